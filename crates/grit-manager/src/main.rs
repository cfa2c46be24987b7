//! GRIT manager - live checkpoint/restore orchestration for pods

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing::{error, info};

use grit_common::crd::{Checkpoint, Restore};
use grit_common::telemetry::{init_telemetry, TelemetryConfig};
use grit_lifecycle::agent::AgentManager;
use grit_manager::{controller_runner, startup, webhook};

/// GRIT - checkpoint/restore orchestration for Kubernetes workloads
#[derive(Parser, Debug)]
#[command(name = "grit-manager", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Namespace holding the agent configuration
    #[arg(long, env = "GRIT_WORKING_NAMESPACE", default_value = "grit-system")]
    working_namespace: String,

    /// Webhook listen address
    #[arg(long, env = "GRIT_WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,

    /// Webhook serving certificate (provisioned and rotated externally)
    #[arg(long, env = "GRIT_WEBHOOK_TLS_CERT", default_value = "/var/lib/grit/certs/tls.crt")]
    tls_cert: PathBuf,

    /// Webhook serving key
    #[arg(long, env = "GRIT_WEBHOOK_TLS_KEY", default_value = "/var/lib/grit/certs/tls.key")]
    tls_key: PathBuf,

    /// Human-readable logs instead of JSON (local development)
    #[arg(long)]
    pretty_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print_crds()?;
        return Ok(());
    }

    // Crypto provider must be installed before any TLS connection,
    // including the kube client's.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    init_telemetry(TelemetryConfig {
        service_name: "grit-manager".to_string(),
        pretty: cli.pretty_logs,
    })?;

    let client = Client::try_default().await?;

    startup::ensure_crds_installed(&client).await?;

    let store = controller_runner::spawn_agent_config_reflector(
        client.clone(),
        &cli.working_namespace,
    );
    let agent = AgentManager::new(&cli.working_namespace, store);

    let webhook_state = Arc::new(webhook::WebhookState::new(client.clone(), agent.clone()));

    info!(
        namespace = %cli.working_namespace,
        webhook = %cli.webhook_addr,
        "starting GRIT manager"
    );

    tokio::select! {
        _ = controller_runner::run_controllers(client, agent) => {
            info!("controllers exited");
        }
        result = webhook::serve(webhook_state, cli.webhook_addr, &cli.tls_cert, &cli.tls_key) => {
            if let Err(e) = result {
                error!(error = %e, "webhook server exited with error");
            }
        }
    }

    Ok(())
}

/// Print both CRD manifests as a multi-document YAML stream
fn print_crds() -> anyhow::Result<()> {
    use kube::CustomResourceExt;

    let checkpoint = serde_yaml::to_string(&Checkpoint::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize Checkpoint CRD: {e}"))?;
    let restore = serde_yaml::to_string(&Restore::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize Restore CRD: {e}"))?;

    println!("{checkpoint}---\n{restore}");
    Ok(())
}
