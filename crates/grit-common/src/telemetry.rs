//! Telemetry initialization
//!
//! JSON structured logging with an env-filter. Controllers log through
//! `tracing`; aggregation and export happen outside the process.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize the tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every log line (e.g. "grit-manager")
    pub service_name: String,

    /// Emit human-readable output instead of JSON (local development)
    pub pretty: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "grit".to_string(),
            pretty: false,
        }
    }
}

/// Initialize telemetry with the given configuration
///
/// Respects `RUST_LOG`; defaults to info with debug for grit crates.
/// Call once at process start; a second call returns an error.
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,grit=debug,kube=info,tower=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if config.pretty {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init()
    };

    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    tracing::info!(service = %config.service_name, "telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "grit");
        assert!(!config.pretty);
    }

    #[test]
    fn test_telemetry_config_clone() {
        let config = TelemetryConfig {
            service_name: "grit-manager".to_string(),
            pretty: true,
        };
        let cloned = config.clone();
        assert_eq!(cloned.service_name, "grit-manager");
        assert!(cloned.pretty);
    }
}
