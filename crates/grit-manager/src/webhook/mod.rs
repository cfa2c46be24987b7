//! Admission webhooks for GRIT
//!
//! Three policies:
//! - Checkpoint create validation (fail-closed): the referenced pod must be
//!   a running, scheduled pod on a ready node.
//! - Restore create mutation + validation (fail-closed): copy the
//!   checkpoint's pod-spec hash onto the restore; require checkpointed data.
//! - Pod create mutation (fail-open): bind a freshly created pod to an open
//!   restore and stamp it with the checkpoint data path.
//!
//! The pod webhook is a latch, not a writer of state: it only claims a
//! restore via annotation; the restore controller discovers the bound pod
//! later (pod names may be unset at admission time).

pub mod checkpoint;
pub mod pod;
pub mod restore;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{routing::post, Router};
use kube::Client;
use tracing::{info, warn};

use grit_common::{Error, Result};
use grit_lifecycle::agent::AgentManager;

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Kubernetes client for resource lookups and restore claims
    pub client: Client,
    /// Cached agent configuration (host path for the data-path annotation)
    pub agent: AgentManager,
}

impl WebhookState {
    /// Create a new webhook state
    pub fn new(client: Client, agent: AgentManager) -> Self {
        Self { client, agent }
    }
}

/// Create the webhook router with all admission endpoints
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(
            "/validate-kaito-sh-v1alpha1-checkpoint",
            post(checkpoint::validate_handler),
        )
        .route(
            "/mutate-kaito-sh-v1alpha1-restore",
            post(restore::mutate_handler),
        )
        .route(
            "/validate-kaito-sh-v1alpha1-restore",
            post(restore::validate_handler),
        )
        .route("/mutate-core-v1-pod", post(pod::mutate_handler))
        .with_state(state)
}

/// Serve the admission endpoints
///
/// TLS material is provisioned and rotated externally; when it cannot be
/// loaded the server falls back to plain HTTP for local development.
pub async fn serve(
    state: Arc<WebhookState>,
    addr: SocketAddr,
    tls_cert: &Path,
    tls_key: &Path,
) -> Result<()> {
    let app = webhook_router(state);

    match axum_server::tls_rustls::RustlsConfig::from_pem_file(tls_cert, tls_key).await {
        Ok(tls_config) => {
            info!(%addr, "webhook server listening (TLS)");
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await
                .map_err(|e| Error::internal("webhook", format!("server error: {e}")))
        }
        Err(e) => {
            warn!(error = %e, "webhook TLS material unavailable, serving plain HTTP");
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| Error::internal("webhook", format!("failed to bind {addr}: {e}")))?;
            info!(%addr, "webhook server listening (plain HTTP)");
            axum::serve(listener, app)
                .await
                .map_err(|e| Error::internal("webhook", format!("server error: {e}")))
        }
    }
}
