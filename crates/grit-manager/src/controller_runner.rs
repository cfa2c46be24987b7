//! Controller wiring
//!
//! Two event-driven controllers share one keyed-queue model each: the
//! checkpoint controller is fed by Checkpoint events and by agent-job
//! events (mapped back to the owner by name prefix); the restore controller
//! additionally follows pods that carry the restore-name annotation.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{reflector::store, watcher, Controller, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, warn};

use grit_common::crd::{Checkpoint, Restore};
use grit_common::{
    owner_for_agent_job, GRIT_AGENT_CONFIG_NAME, GRIT_AGENT_LABEL, GRIT_AGENT_NAME,
    RESTORE_NAME_ANNOTATION,
};
use grit_lifecycle::agent::AgentManager;
use grit_lifecycle::{checkpoint, restore, LifecycleContext};

/// Bounded reconcile concurrency per controller; the queue still
/// deduplicates by key, so at most one reconcile runs per object
const MAX_CONCURRENT_RECONCILES: u16 = 5;

/// Start the reflector caching the agent configuration ConfigMap
///
/// Controllers and the pod webhook read the config through the returned
/// store instead of issuing per-reconcile API calls.
pub fn spawn_agent_config_reflector(client: Client, namespace: &str) -> Store<ConfigMap> {
    let api: Api<ConfigMap> = Api::namespaced(client, namespace);
    let watch_config =
        WatcherConfig::default().fields(&format!("metadata.name={GRIT_AGENT_CONFIG_NAME}"));

    let (reader, writer) = store::<ConfigMap>();
    let stream = reflector::reflector(writer, watcher(api, watch_config).default_backoff());

    tokio::spawn(async move {
        stream
            .applied_objects()
            .for_each(|result| async move {
                if let Err(e) = result {
                    warn!(error = %e, "agent config watch error");
                }
            })
            .await;
    });

    reader
}

/// Run both lifecycle controllers until shutdown
pub async fn run_controllers(client: Client, agent: AgentManager) {
    info!("starting GRIT controllers");
    info!("- Checkpoint controller");
    info!("- Restore controller");

    let checkpoint_ctx = Arc::new(LifecycleContext::new(client.clone(), agent.clone()));
    let restore_ctx = Arc::new(LifecycleContext::new(client.clone(), agent));

    let checkpoint_controller = create_checkpoint_controller(client.clone(), checkpoint_ctx);
    let restore_controller = create_restore_controller(client, restore_ctx);

    tokio::select! {
        _ = checkpoint_controller => info!("checkpoint controller completed"),
        _ = restore_controller => info!("restore controller completed"),
    }
}

/// Watch configuration selecting agent jobs by label
fn agent_job_watch_config() -> WatcherConfig {
    WatcherConfig::default().labels(&format!("{GRIT_AGENT_LABEL}={GRIT_AGENT_NAME}"))
}

fn create_checkpoint_controller(
    client: Client,
    ctx: Arc<LifecycleContext>,
) -> impl std::future::Future<Output = ()> {
    let checkpoints: Api<Checkpoint> = Api::all(client.clone());
    let agent_jobs: Api<Job> = Api::all(client);

    Controller::new(checkpoints, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(MAX_CONCURRENT_RECONCILES))
        .watches(agent_jobs, agent_job_watch_config(), |job: Job| {
            let namespace = job.namespace();
            let name = job.name_any();
            match (namespace, owner_for_agent_job(&name)) {
                (Some(ns), Some(owner)) => Some(ObjectRef::<Checkpoint>::new(owner).within(&ns)),
                _ => None,
            }
        })
        .shutdown_on_signal()
        .run(checkpoint::reconcile, checkpoint::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(?obj, "checkpoint reconciliation completed"),
                Err(e) => error!(error = ?e, "checkpoint reconciliation error"),
            }
        })
}

fn create_restore_controller(
    client: Client,
    ctx: Arc<LifecycleContext>,
) -> impl std::future::Future<Output = ()> {
    let restores: Api<Restore> = Api::all(client.clone());
    let agent_jobs: Api<Job> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);

    Controller::new(restores, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(MAX_CONCURRENT_RECONCILES))
        .watches(agent_jobs, agent_job_watch_config(), |job: Job| {
            let namespace = job.namespace();
            let name = job.name_any();
            match (namespace, owner_for_agent_job(&name)) {
                (Some(ns), Some(owner)) => Some(ObjectRef::<Restore>::new(owner).within(&ns)),
                _ => None,
            }
        })
        .watches(pods, WatcherConfig::default(), |pod: Pod| {
            let namespace = pod.namespace();
            let restore_name = pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(RESTORE_NAME_ANNOTATION))
                .cloned();
            match (namespace, restore_name) {
                (Some(ns), Some(name)) => Some(ObjectRef::<Restore>::new(&name).within(&ns)),
                _ => None,
            }
        })
        .shutdown_on_signal()
        .run(restore::reconcile, restore::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!(?obj, "restore reconciliation completed"),
                Err(e) => error!(error = ?e, "restore reconciliation error"),
            }
        })
}
