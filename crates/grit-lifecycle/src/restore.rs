//! Restore reconciliation
//!
//! Drives a Restore through Created → Pending → Restoring → Restored. The
//! pod webhook only *claims* a restore (annotation latch); this controller
//! completes it: it discovers the bound pod by annotation, waits for
//! scheduling, places the restore agent job on the pod's node, and watches
//! the restoration pod come up.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use grit_common::conditions::{remove_condition, resolve_last_phase, update_condition};
use grit_common::crd::{Checkpoint, ConditionStatus, Restore, RestorePhase, RestoreStatus};
use grit_common::{agent_job_name, Error, POD_SELECTED_ANNOTATION, RESTORE_NAME_ANNOTATION};

use crate::agent::build_agent_job;
use crate::{LifecycleContext, REQUEUE_POLL, REQUEUE_SHORT};

/// Condition types ranked by lifecycle progress, for phase recovery
const CONDITION_ORDER: [&str; 4] = ["Created", "Pending", "Restoring", "Restored"];

/// Reconcile one Restore
pub async fn reconcile(
    restore: Arc<Restore>,
    ctx: Arc<LifecycleContext>,
) -> Result<Action, Error> {
    let name = restore.name_any();
    let namespace = restore
        .namespace()
        .ok_or_else(|| Error::validation(&name, "restore must be namespaced"))?;

    let mut updated = (*restore).clone();
    let phase = resolve_phase(&updated);
    debug!(restore = %name, namespace = %namespace, phase = %phase, "reconciling restore");

    let action = match phase {
        RestorePhase::Created => created(&ctx, &namespace, &mut updated).await?,
        RestorePhase::Pending => pending(&ctx, &namespace, &mut updated).await?,
        RestorePhase::Restoring => restoring(&ctx, &namespace, &mut updated).await?,
        RestorePhase::Restored => restored(&ctx, &namespace, &mut updated).await?,
        RestorePhase::Failed => Action::await_change(),
    };

    if let Some(status) = updated.status.as_mut() {
        if status.phase != Some(RestorePhase::Failed) {
            remove_condition(&mut status.conditions, "Failed");
        }
    }

    if restore.status != updated.status {
        persist_status(&ctx, &namespace, &name, &updated).await?;
    }

    ctx.backoff.reset(&format!("{namespace}/{name}"));
    Ok(action)
}

/// Error policy: per-key exponential backoff under the global limiter
pub fn error_policy(restore: Arc<Restore>, error: &Error, ctx: Arc<LifecycleContext>) -> Action {
    let key = format!(
        "{}/{}",
        restore.namespace().unwrap_or_default(),
        restore.name_any()
    );
    let delay = ctx.backoff.next_delay(&key);
    warn!(restore = %key, error = %error, ?delay, "restore reconcile error, will retry");
    Action::requeue(delay)
}

/// What to do next, recovered from conditions when the stored phase is Failed
fn resolve_phase(restore: &Restore) -> RestorePhase {
    let Some(status) = restore.status.as_ref() else {
        return RestorePhase::Created;
    };

    match &status.phase {
        None => RestorePhase::Created,
        Some(RestorePhase::Failed) => {
            resolve_last_phase(&status.conditions, &CONDITION_ORDER, "Created")
                .parse()
                .unwrap_or(RestorePhase::Created)
        }
        Some(phase) => phase.clone(),
    }
}

/// Record a terminal-until-fixed failure
fn fail(status: &mut RestoreStatus, reason: &str, message: &str) {
    status.phase = Some(RestorePhase::Failed);
    update_condition(
        &mut status.conditions,
        ConditionStatus::True,
        "Failed",
        reason,
        message,
        Utc::now(),
    );
}

fn transition(status: &mut RestoreStatus, phase: RestorePhase, reason: &str, message: &str) {
    let type_ = phase.to_string();
    status.phase = Some(phase);
    update_condition(
        &mut status.conditions,
        ConditionStatus::True,
        &type_,
        reason,
        message,
        Utc::now(),
    );
}

/// Pods the webhook bound to this restore, discovered by annotation
fn bound_pods<'a>(pods: &'a [Pod], restore_name: &str) -> Vec<&'a Pod> {
    pods.iter()
        .filter(|pod| {
            pod.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(RESTORE_NAME_ANNOTATION))
                .is_some_and(|v| v == restore_name)
        })
        .collect()
}

/// Created: stamp the initial condition; once the webhook has claimed this
/// restore, discover the bound pod by annotation
async fn created(
    ctx: &LifecycleContext,
    namespace: &str,
    updated: &mut Restore,
) -> Result<Action, Error> {
    let name = updated.name_any();

    if updated.status.as_ref().and_then(|s| s.phase.as_ref()).is_none() {
        let status = updated.status.get_or_insert_with(Default::default);
        transition(
            status,
            RestorePhase::Created,
            "RestoreIsCreated",
            "restore resource is created",
        );
        return Ok(Action::requeue(REQUEUE_SHORT));
    }

    let selected = updated
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(POD_SELECTED_ANNOTATION))
        .is_some_and(|v| v == "true");
    if !selected {
        return Ok(Action::await_change());
    }

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let pod_list = pods.list(&ListParams::default()).await?;
    let bound = bound_pods(&pod_list.items, &name);

    match bound.as_slice() {
        [] => {
            // Claimed, but the bound pod is not visible yet
            Ok(Action::requeue(REQUEUE_POLL))
        }
        [pod] => {
            let target = pod.name_any();
            let node = pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.clone())
                .unwrap_or_default();
            let status = updated.status.get_or_insert_with(Default::default);
            if !node.is_empty() {
                status.node_name = node;
            }
            status.target_pod = target.clone();
            transition(
                status,
                RestorePhase::Pending,
                "RestorationPodSelected",
                &format!("pod({target}) is selected as the restoration pod"),
            );
            Ok(Action::requeue(REQUEUE_SHORT))
        }
        many => {
            let count = many.len();
            let status = updated.status.get_or_insert_with(Default::default);
            fail(
                status,
                "MultiplePodsSelected",
                &format!("{count} pods are selected as restoration pod for restore({name})"),
            );
            Ok(Action::await_change())
        }
    }
}

/// Pending: wait until the bound pod is scheduled, then place the restore
/// agent job on its node
async fn pending(
    ctx: &LifecycleContext,
    namespace: &str,
    updated: &mut Restore,
) -> Result<Action, Error> {
    let name = updated.name_any();
    let (target_pod, node_name) = match updated.status.as_ref() {
        Some(s) => (s.target_pod.clone(), s.node_name.clone()),
        None => (String::new(), String::new()),
    };

    if target_pod.is_empty() {
        return Ok(Action::await_change());
    }

    if node_name.is_empty() {
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
        match pods.get_opt(&target_pod).await? {
            Some(pod) => {
                let node = pod.spec.as_ref().and_then(|s| s.node_name.clone());
                return match node {
                    Some(node) if !node.is_empty() => {
                        let status = updated.status.get_or_insert_with(Default::default);
                        status.node_name = node;
                        Ok(Action::requeue(REQUEUE_SHORT))
                    }
                    // Not scheduled yet
                    _ => Ok(Action::requeue(REQUEUE_POLL)),
                };
            }
            None => {
                let status = updated.status.get_or_insert_with(Default::default);
                fail(
                    status,
                    "TargetPodNotExist",
                    &format!("target pod({target_pod}) for restore({name}) doesn't exist"),
                );
                return Ok(Action::await_change());
            }
        }
    }

    let job_name = agent_job_name(&name);
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    if jobs.get_opt(&job_name).await?.is_some() {
        let status = updated.status.get_or_insert_with(Default::default);
        transition(
            status,
            RestorePhase::Restoring,
            "GritAgentCreated",
            &format!("agent job({namespace}/{job_name}) for restore is created"),
        );
        return Ok(Action::requeue(REQUEUE_POLL));
    }

    let checkpoint_name = updated.spec.checkpoint_name.clone();
    let checkpoints: Api<Checkpoint> = Api::namespaced(ctx.client.clone(), namespace);
    let Some(ckpt) = checkpoints.get_opt(&checkpoint_name).await? else {
        let status = updated.status.get_or_insert_with(Default::default);
        fail(
            status,
            "CheckpointNotExist",
            &format!(
                "checkpoint({namespace}/{checkpoint_name}) which is used for restore({name}) doesn't exist"
            ),
        );
        return Ok(Action::await_change());
    };

    let build = ctx
        .agent
        .config()
        .and_then(|config| build_agent_job(&config, &ckpt, Some(&*updated)));
    match build {
        Ok(job) => {
            info!(restore = %name, job = %job_name, "creating restore agent job");
            match jobs.create(&PostParams::default(), &job).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
            Ok(Action::requeue(REQUEUE_POLL))
        }
        Err(e) if !e.is_retryable() => {
            let status = updated.status.get_or_insert_with(Default::default);
            fail(
                status,
                "GenerateGritAgentFailed",
                &format!("failed to generate agent job, {e}"),
            );
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

/// Restoring: watch the restoration pod start from the staged data
async fn restoring(
    ctx: &LifecycleContext,
    namespace: &str,
    updated: &mut Restore,
) -> Result<Action, Error> {
    let name = updated.name_any();
    let target_pod = updated
        .status
        .as_ref()
        .map(|s| s.target_pod.clone())
        .unwrap_or_default();

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let Some(pod) = pods.get_opt(&target_pod).await? else {
        let status = updated.status.get_or_insert_with(Default::default);
        fail(
            status,
            "RestorationPodNotFound",
            &format!("restoration pod({target_pod}) for restore({name}) is gone"),
        );
        return Ok(Action::await_change());
    };

    let pod_phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_default();
    match pod_phase.as_str() {
        "Failed" => {
            let status = updated.status.get_or_insert_with(Default::default);
            fail(
                status,
                "RestorationPodFailed",
                &format!("restoration pod({target_pod}) for restore({name}) failed to start"),
            );
            Ok(Action::await_change())
        }
        "Running" => {
            let status = updated.status.get_or_insert_with(Default::default);
            transition(
                status,
                RestorePhase::Restored,
                "RestorationPodRunning",
                &format!("restoration pod({target_pod}) for restore({name}) is running"),
            );
            Ok(Action::requeue(REQUEUE_SHORT))
        }
        _ => Ok(Action::requeue(REQUEUE_POLL)),
    }
}

/// Restored: garbage-collect the restore agent job; terminal once gone
async fn restored(
    ctx: &LifecycleContext,
    namespace: &str,
    updated: &mut Restore,
) -> Result<Action, Error> {
    let name = updated.name_any();
    let job_name = agent_job_name(&name);
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);

    match jobs.get_opt(&job_name).await? {
        Some(job) => {
            if job.metadata.deletion_timestamp.is_none() {
                info!(restore = %name, job = %job_name, "deleting completed restore agent job");
                match jobs.delete(&job_name, &DeleteParams::foreground()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(Action::requeue(REQUEUE_POLL))
        }
        None => Ok(Action::await_change()),
    }
}

/// Persist the mutated status (optimistic concurrency via resourceVersion)
async fn persist_status(
    ctx: &LifecycleContext,
    namespace: &str,
    name: &str,
    updated: &Restore,
) -> Result<(), Error> {
    let api: Api<Restore> = Api::namespaced(ctx.client.clone(), namespace);
    let bytes = serde_json::to_vec(updated)
        .map_err(|e| Error::internal("restore", format!("failed to serialize status: {e}")))?;
    api.replace_status(name, &PostParams::default(), bytes).await?;
    Ok(())
}
