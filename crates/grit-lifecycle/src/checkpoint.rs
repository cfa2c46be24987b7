//! Checkpoint reconciliation
//!
//! Drives a Checkpoint through
//! Created → Pending → Checkpointing → Checkpointed, and with
//! `autoMigration` on through Submitting → Submitted. Every handler is a
//! pure function of observed state: it mutates a working copy and the
//! reconciler persists the status once, at the end, only when it changed.
//!
//! Conditions record each successful transition, so a Failed excursion is
//! not terminal: once the underlying defect is fixed, phase resolution
//! resumes from the last good phase instead of dead-ending.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use grit_common::conditions::{remove_condition, resolve_last_phase, update_condition};
use grit_common::crd::{
    Checkpoint, CheckpointPhase, CheckpointStatus, ConditionStatus, Restore, RestoreSpec,
    WorkloadOwnerRef,
};
use grit_common::hash::compute_pod_spec_hash;
use grit_common::{agent_job_name, Error, POD_SPEC_HASH_ANNOTATION};

use crate::agent::{build_agent_job, is_job_completed, is_job_failed};
use crate::{LifecycleContext, REQUEUE_POLL, REQUEUE_SHORT};

/// Condition types ranked by lifecycle progress, for phase recovery
const CONDITION_ORDER: [&str; 5] = [
    "Pending",
    "Checkpointing",
    "Checkpointed",
    "Submitting",
    "Submitted",
];

/// Reconcile one Checkpoint
pub async fn reconcile(
    ckpt: Arc<Checkpoint>,
    ctx: Arc<LifecycleContext>,
) -> Result<Action, Error> {
    let name = ckpt.name_any();
    let namespace = ckpt
        .namespace()
        .ok_or_else(|| Error::validation(&name, "checkpoint must be namespaced"))?;

    let mut updated = (*ckpt).clone();
    let phase = resolve_phase(&updated);
    debug!(checkpoint = %name, namespace = %namespace, phase = %phase, "reconciling checkpoint");

    let action = match phase {
        CheckpointPhase::Created => created(&ctx, &namespace, &mut updated).await?,
        CheckpointPhase::Pending => pending(&ctx, &namespace, &mut updated).await?,
        CheckpointPhase::Checkpointing => checkpointing(&ctx, &namespace, &mut updated).await?,
        CheckpointPhase::Checkpointed => checkpointed(&ctx, &namespace, &mut updated).await?,
        CheckpointPhase::Submitting => submitting(&ctx, &namespace, &mut updated).await?,
        CheckpointPhase::Submitted | CheckpointPhase::Failed => Action::await_change(),
    };

    if let Some(status) = updated.status.as_mut() {
        if status.phase != Some(CheckpointPhase::Failed) {
            remove_condition(&mut status.conditions, "Failed");
        }
    }

    if ckpt.status != updated.status {
        persist_status(&ctx, &namespace, &name, &updated).await?;
    }

    ctx.backoff.reset(&format!("{namespace}/{name}"));
    Ok(action)
}

/// Error policy: per-key exponential backoff under the global limiter
pub fn error_policy(ckpt: Arc<Checkpoint>, error: &Error, ctx: Arc<LifecycleContext>) -> Action {
    let key = format!("{}/{}", ckpt.namespace().unwrap_or_default(), ckpt.name_any());
    let delay = ctx.backoff.next_delay(&key);
    warn!(checkpoint = %key, error = %error, ?delay, "checkpoint reconcile error, will retry");
    Action::requeue(delay)
}

/// What to do next, recovered from conditions when the stored phase is Failed
fn resolve_phase(ckpt: &Checkpoint) -> CheckpointPhase {
    let Some(status) = ckpt.status.as_ref() else {
        return CheckpointPhase::Created;
    };

    match &status.phase {
        None => CheckpointPhase::Created,
        Some(CheckpointPhase::Failed) => {
            resolve_last_phase(&status.conditions, &CONDITION_ORDER, "Created")
                .parse()
                .unwrap_or(CheckpointPhase::Created)
        }
        Some(phase) => phase.clone(),
    }
}

/// Record a terminal-until-fixed failure
fn fail(status: &mut CheckpointStatus, reason: &str, message: &str) {
    status.phase = Some(CheckpointPhase::Failed);
    update_condition(
        &mut status.conditions,
        ConditionStatus::True,
        "Failed",
        reason,
        message,
        Utc::now(),
    );
}

fn transition(status: &mut CheckpointStatus, phase: CheckpointPhase, reason: &str, message: &str) {
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

/// Created: stamp the initial condition, then capture the target pod's
/// node, spec hash and UID
async fn created(
    ctx: &LifecycleContext,
    namespace: &str,
    updated: &mut Checkpoint,
) -> Result<Action, Error> {
    if updated.status.as_ref().and_then(|s| s.phase.as_ref()).is_none() {
        let status = updated.status.get_or_insert_with(Default::default);
        transition(
            status,
            CheckpointPhase::Created,
            "CheckpointIsCreated",
            "checkpoint resource is created",
        );
        return Ok(Action::requeue(REQUEUE_SHORT));
    }

    let pod_name = updated.spec.pod_name.clone();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let pod = pods.get_opt(&pod_name).await?;

    let Some(pod) = pod else {
        let status = updated.status.get_or_insert_with(Default::default);
        fail(
            status,
            "PodNotExist",
            &format!("pod({pod_name}) for checkpoint doesn't exist"),
        );
        return Ok(Action::await_change());
    };

    let pod_spec = pod
        .spec
        .as_ref()
        .ok_or_else(|| Error::internal("checkpoint", format!("pod({pod_name}) has no spec")))?;
    let hash = compute_pod_spec_hash(pod_spec)?;

    let status = updated.status.get_or_insert_with(Default::default);
    status.node_name = pod_spec.node_name.clone().unwrap_or_default();
    status.pod_spec_hash = hash;
    status.pod_uid = pod.metadata.uid.clone().unwrap_or_default();
    transition(
        status,
        CheckpointPhase::Pending,
        "InitializingCompleted",
        "pod spec hash has been configured",
    );
    Ok(Action::requeue(REQUEUE_SHORT))
}

/// Pending: place the agent job on the captured node; once the job is
/// observed, move to Checkpointing
async fn pending(
    ctx: &LifecycleContext,
    namespace: &str,
    updated: &mut Checkpoint,
) -> Result<Action, Error> {
    let name = updated.name_any();
    let job_name = agent_job_name(&name);
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);

    if jobs.get_opt(&job_name).await?.is_some() {
        let status = updated.status.get_or_insert_with(Default::default);
        transition(
            status,
            CheckpointPhase::Checkpointing,
            "GritAgentCreated",
            &format!("agent job({namespace}/{job_name}) is observed"),
        );
        return Ok(Action::requeue(REQUEUE_POLL));
    }

    let build = ctx
        .agent
        .config()
        .and_then(|config| build_agent_job(&config, &*updated, None));
    match build {
        Ok(job) => {
            info!(checkpoint = %name, job = %job_name, "creating agent job");
            match jobs.create(&PostParams::default(), &job).await {
                Ok(_) => {}
                // A concurrent reconcile already submitted it
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

/// Checkpointing: watch the agent job; on success record the data path and
/// move to Checkpointed
async fn checkpointing(
    ctx: &LifecycleContext,
    namespace: &str,
    updated: &mut Checkpoint,
) -> Result<Action, Error> {
    let name = updated.name_any();
    let job_name = agent_job_name(&name);
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);

    match jobs.get_opt(&job_name).await? {
        Some(job) if is_job_completed(&job) => {
            let data_path = resolve_data_path(ctx, namespace, &*updated).await?;
            let status = updated.status.get_or_insert_with(Default::default);
            if let Some(data_path) = data_path {
                status.data_path = data_path;
            }
            transition(
                status,
                CheckpointPhase::Checkpointed,
                "GritAgentCompleted",
                &format!("agent job({namespace}/{job_name}) completed"),
            );
            Ok(Action::requeue(REQUEUE_SHORT))
        }
        Some(job) if is_job_failed(&job) => {
            let status = updated.status.get_or_insert_with(Default::default);
            fail(
                status,
                "GritAgentJobFailed",
                &format!("agent job({namespace}/{job_name}) failed"),
            );
            Ok(Action::await_change())
        }
        Some(_) => Ok(Action::requeue(REQUEUE_POLL)),
        None => {
            let status = updated.status.get_or_insert_with(Default::default);
            fail(
                status,
                "GritAgentJobFailed",
                &format!("agent job({namespace}/{job_name}) disappeared before completion"),
            );
            Ok(Action::await_change())
        }
    }
}

/// `<volumeName>://<namespace>/<name>`, from the claim's bound volume
///
/// An unbound or missing claim at this instant is transient: the error
/// propagates and the reconcile retries until the claim binds. Without a
/// claim the data stays under the host work path and no URI is recorded.
async fn resolve_data_path(
    ctx: &LifecycleContext,
    namespace: &str,
    ckpt: &Checkpoint,
) -> Result<Option<String>, Error> {
    let Some(claim) = ckpt.spec.volume_claim.as_ref() else {
        return Ok(None);
    };

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), namespace);
    let pvc = pvcs.get_opt(&claim.claim_name).await?.ok_or_else(|| {
        Error::internal(
            "checkpoint",
            format!("volume claim({}/{}) doesn't exist", namespace, claim.claim_name),
        )
    })?;

    let volume_name = pvc
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.clone())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::internal(
                "checkpoint",
                format!("volume claim({}/{}) is not bound yet", namespace, claim.claim_name),
            )
        })?;

    Ok(Some(format!("{volume_name}://{namespace}/{}", ckpt.name_any())))
}

/// Checkpointed: garbage-collect the agent job; once it is gone, start
/// auto-migration if requested
async fn checkpointed(
    ctx: &LifecycleContext,
    namespace: &str,
    updated: &mut Checkpoint,
) -> Result<Action, Error> {
    let name = updated.name_any();
    let job_name = agent_job_name(&name);
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);

    match jobs.get_opt(&job_name).await? {
        Some(job) => {
            if job.metadata.deletion_timestamp.is_none() {
                info!(checkpoint = %name, job = %job_name, "deleting completed agent job");
                match jobs.delete(&job_name, &DeleteParams::foreground()).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(Action::requeue(REQUEUE_POLL))
        }
        None => {
            if updated.spec.auto_migration {
                let status = updated.status.get_or_insert_with(Default::default);
                transition(
                    status,
                    CheckpointPhase::Submitting,
                    "CheckpointedCompleted",
                    "auto migration is enabled and checkpoint data is ready",
                );
                Ok(Action::requeue(REQUEUE_SHORT))
            } else {
                Ok(Action::await_change())
            }
        }
    }
}

/// Submitting: create the Restore for the source pod's controller, then
/// delete the source pod so the workload recreates a replica
async fn submitting(
    ctx: &LifecycleContext,
    namespace: &str,
    updated: &mut Checkpoint,
) -> Result<Action, Error> {
    let name = updated.name_any();
    let pod_name = updated.spec.pod_name.clone();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);

    let Some(pod) = pods.get_opt(&pod_name).await? else {
        let status = updated.status.get_or_insert_with(Default::default);
        fail(
            status,
            "PodIsRemoved",
            &format!("migrating pod({pod_name}) in checkpoint has been removed"),
        );
        return Ok(Action::await_change());
    };

    let owner = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)));
    let Some(owner) = owner else {
        let status = updated.status.get_or_insert_with(Default::default);
        fail(
            status,
            "PodHasNoOwnerReference",
            &format!("pod({namespace}/{pod_name}) has no controller owner reference"),
        );
        return Ok(Action::await_change());
    };

    let pod_spec_hash = updated
        .status
        .as_ref()
        .map(|s| s.pod_spec_hash.clone())
        .unwrap_or_default();
    let restore = build_migration_restore(&name, namespace, &pod_spec_hash, owner.into());

    let restores: Api<Restore> = Api::namespaced(ctx.client.clone(), namespace);
    match restores.create(&PostParams::default(), &restore).await {
        Ok(_) => {}
        // A previous attempt got this far already
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e.into()),
    }

    if pod.metadata.deletion_timestamp.is_none() {
        info!(checkpoint = %name, pod = %pod_name, "deleting source pod for migration");
        match pods.delete(&pod_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    let status = updated.status.get_or_insert_with(Default::default);
    transition(
        status,
        CheckpointPhase::Submitted,
        "AutoMigrationCompleted",
        "restore resource is created and checkpointed pod is removed",
    );
    Ok(Action::await_change())
}

/// The Restore a migrating checkpoint hands off to
fn build_migration_restore(
    name: &str,
    namespace: &str,
    pod_spec_hash: &str,
    owner_ref: WorkloadOwnerRef,
) -> Restore {
    Restore {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(BTreeMap::from([(
                POD_SPEC_HASH_ANNOTATION.to_string(),
                pod_spec_hash.to_string(),
            )])),
            ..Default::default()
        },
        spec: RestoreSpec {
            checkpoint_name: name.to_string(),
            owner_ref,
        },
        status: None,
    }
}

/// Persist the mutated status (optimistic concurrency via resourceVersion)
async fn persist_status(
    ctx: &LifecycleContext,
    namespace: &str,
    name: &str,
    updated: &Checkpoint,
) -> Result<(), Error> {
    let api: Api<Checkpoint> = Api::namespaced(ctx.client.clone(), namespace);
    let bytes = serde_json::to_vec(updated)
        .map_err(|e| Error::internal("checkpoint", format!("failed to serialize status: {e}")))?;
    api.replace_status(name, &PostParams::default(), bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use grit_common::crd::{CheckpointSpec, Condition};

    fn checkpoint_with(phase: Option<CheckpointPhase>, condition_types: &[&str]) -> Checkpoint {
        let mut ckpt = Checkpoint::new(
            "c1",
            CheckpointSpec {
                pod_name: "p1".to_string(),
                volume_claim: None,
                auto_migration: false,
            },
        );
        ckpt.metadata.namespace = Some("foo".to_string());
        ckpt.status = Some(CheckpointStatus {
            phase,
            conditions: condition_types
                .iter()
                .map(|t| Condition::new(*t, ConditionStatus::True, "r", "m", Utc::now()))
                .collect(),
            ..Default::default()
        });
        ckpt
    }

    #[test]
    fn resolve_trusts_non_failed_phase() {
        let ckpt = checkpoint_with(Some(CheckpointPhase::Checkpointing), &["Pending"]);
        assert_eq!(resolve_phase(&ckpt), CheckpointPhase::Checkpointing);
    }

    #[test]
    fn resolve_empty_is_created() {
        let mut ckpt = checkpoint_with(None, &[]);
        assert_eq!(resolve_phase(&ckpt), CheckpointPhase::Created);

        ckpt.status = None;
        assert_eq!(resolve_phase(&ckpt), CheckpointPhase::Created);
    }

    #[test]
    fn resolve_failed_resumes_from_last_good_phase() {
        let ckpt = checkpoint_with(
            Some(CheckpointPhase::Failed),
            &["Pending", "Checkpointing", "Failed"],
        );
        assert_eq!(resolve_phase(&ckpt), CheckpointPhase::Checkpointing);

        let ckpt = checkpoint_with(
            Some(CheckpointPhase::Failed),
            &["Pending", "Checkpointing", "Checkpointed", "Submitting", "Failed"],
        );
        assert_eq!(resolve_phase(&ckpt), CheckpointPhase::Submitting);
    }

    #[test]
    fn resolve_failed_without_conditions_restarts() {
        let ckpt = checkpoint_with(Some(CheckpointPhase::Failed), &["Failed"]);
        assert_eq!(resolve_phase(&ckpt), CheckpointPhase::Created);
    }

    #[test]
    fn fail_records_reason() {
        let mut status = CheckpointStatus::default();
        fail(&mut status, "PodNotExist", "pod(p1) for checkpoint doesn't exist");

        assert_eq!(status.phase, Some(CheckpointPhase::Failed));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].type_, "Failed");
        assert_eq!(status.conditions[0].reason, "PodNotExist");
    }

    #[test]
    fn transition_stamps_condition_with_phase_type() {
        let mut status = CheckpointStatus::default();
        transition(
            &mut status,
            CheckpointPhase::Pending,
            "InitializingCompleted",
            "pod spec hash has been configured",
        );

        assert_eq!(status.phase, Some(CheckpointPhase::Pending));
        assert_eq!(status.conditions[0].type_, "Pending");
    }

    #[test]
    fn repeated_transition_is_idempotent() {
        let mut status = CheckpointStatus::default();
        transition(&mut status, CheckpointPhase::Pending, "r", "m");
        let snapshot = status.clone();
        transition(&mut status, CheckpointPhase::Pending, "r", "m");
        assert_eq!(status, snapshot);
    }

    #[test]
    fn migration_restore_carries_hash_and_owner() {
        let owner = WorkloadOwnerRef {
            api_version: "apps/v1".to_string(),
            kind: "ReplicaSet".to_string(),
            name: "web-7d9f".to_string(),
            uid: "u1".to_string(),
        };
        let restore = build_migration_restore("c1", "foo", "abc123", owner);

        assert_eq!(restore.metadata.name.as_deref(), Some("c1"));
        assert_eq!(restore.metadata.namespace.as_deref(), Some("foo"));
        assert_eq!(restore.spec.checkpoint_name, "c1");
        assert_eq!(restore.spec.owner_ref.uid, "u1");
        assert_eq!(
            restore
                .metadata
                .annotations
                .as_ref()
                .unwrap()
                .get(POD_SPEC_HASH_ANNOTATION),
            Some(&"abc123".to_string())
        );
        assert!(restore.status.is_none());
    }

    #[test]
    fn error_policy_backs_off_per_object() {
        let backoff = grit_common::backoff::RequeueBackoff::new();
        let d1 = backoff.next_delay("foo/c1");
        let d2 = backoff.next_delay("foo/c1");
        assert!(d2 > d1);
    }
}
