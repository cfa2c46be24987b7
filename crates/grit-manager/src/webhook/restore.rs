//! Restore admission webhooks
//!
//! Mutating half: copy the checkpoint's pod-spec hash onto the restore, so
//! the pod webhook can match replacement pods without fetching the
//! checkpoint. Validating half: only accept restores whose checkpoint data
//! is ready. Both fail-closed.

use std::sync::Arc;

use axum::{extract::State, Json};
use kube::api::{Api, DynamicObject};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::ResourceExt;
use tracing::{error, info};

use grit_common::crd::{Checkpoint, CheckpointPhase, Restore};
use grit_common::POD_SPEC_HASH_ANNOTATION;

use super::WebhookState;

/// Handle the mutating admission review for Restore create
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Restore>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Restore> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse restore admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = mutate_restore(&state, &req).await;
    Json(response.into_review())
}

async fn mutate_restore(
    state: &WebhookState,
    req: &AdmissionRequest<Restore>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);

    let Some(restore) = req.object.as_ref() else {
        return response.deny("no restore object in admission request");
    };
    let name = restore.name_any();
    let namespace = req
        .namespace
        .clone()
        .or_else(|| restore.namespace())
        .unwrap_or_default();

    let checkpoints: Api<Checkpoint> = Api::namespaced(state.client.clone(), &namespace);
    let ckpt = match checkpoints.get_opt(&restore.spec.checkpoint_name).await {
        Ok(Some(ckpt)) => ckpt,
        Ok(None) => {
            return response.deny(format!(
                "checkpoint({}) referenced by restore({name}) doesn't exist",
                restore.spec.checkpoint_name
            ));
        }
        Err(e) => return response.deny(e.to_string()),
    };

    let pod_spec_hash = ckpt
        .status
        .as_ref()
        .map(|s| s.pod_spec_hash.clone())
        .unwrap_or_default();

    let patch = annotation_patch_ops(
        restore.metadata.annotations.is_some(),
        POD_SPEC_HASH_ANNOTATION,
        &pod_spec_hash,
    );

    info!(restore = %name, namespace = %namespace, "stamping pod-spec hash on restore");
    match response.with_patch(json_patch::Patch(patch)) {
        Ok(response) => response,
        Err(e) => {
            error!(restore = %name, error = %e, "failed to serialize restore patch");
            AdmissionResponse::from(req).deny(format!("patch serialization error: {e}"))
        }
    }
}

/// Handle the validating admission review for Restore create
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Restore>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Restore> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse restore admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = validate_restore(&state, &req).await;
    Json(response.into_review())
}

async fn validate_restore(
    state: &WebhookState,
    req: &AdmissionRequest<Restore>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);

    let Some(restore) = req.object.as_ref() else {
        return response.deny("no restore object in admission request");
    };
    let name = restore.name_any();

    if restore.spec.checkpoint_name.is_empty() {
        return response.deny(format!("checkpoint is not specified in restore({name})"));
    }

    let namespace = req
        .namespace
        .clone()
        .or_else(|| restore.namespace())
        .unwrap_or_default();

    let checkpoints: Api<Checkpoint> = Api::namespaced(state.client.clone(), &namespace);
    let ckpt = match checkpoints.get_opt(&restore.spec.checkpoint_name).await {
        Ok(Some(ckpt)) => ckpt,
        Ok(None) => {
            return response.deny(format!(
                "checkpoint({}) referenced by restore({name}) doesn't exist",
                restore.spec.checkpoint_name
            ));
        }
        Err(e) => return response.deny(e.to_string()),
    };

    if !checkpoint_data_ready(&ckpt) {
        return response.deny(format!(
            "restore({name}) referenced checkpoint({}) has not completed checkpoint process",
            ckpt.name_any()
        ));
    }

    response
}

/// Checkpoint data is restorable once the checkpoint reached Checkpointed
fn checkpoint_data_ready(ckpt: &Checkpoint) -> bool {
    matches!(
        ckpt.phase(),
        Some(CheckpointPhase::Checkpointed)
            | Some(CheckpointPhase::Submitting)
            | Some(CheckpointPhase::Submitted)
    )
}

/// JSON patch setting one annotation, creating the map when absent
pub(crate) fn annotation_patch_ops(
    has_annotations: bool,
    key: &str,
    value: &str,
) -> Vec<json_patch::PatchOperation> {
    use json_patch::{AddOperation, PatchOperation};
    use jsonptr::PointerBuf;

    if has_annotations {
        vec![PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations", key]),
            value: serde_json::Value::String(value.to_string()),
        })]
    } else {
        vec![PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations"]),
            value: serde_json::json!({ key: value }),
        })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grit_common::crd::{CheckpointSpec, CheckpointStatus};

    fn checkpoint_in_phase(phase: Option<CheckpointPhase>) -> Checkpoint {
        let mut ckpt = Checkpoint::new(
            "c1",
            CheckpointSpec {
                pod_name: "p1".to_string(),
                volume_claim: None,
                auto_migration: false,
            },
        );
        ckpt.status = Some(CheckpointStatus {
            phase,
            ..Default::default()
        });
        ckpt
    }

    #[test]
    fn data_ready_from_checkpointed_on() {
        for phase in [
            CheckpointPhase::Checkpointed,
            CheckpointPhase::Submitting,
            CheckpointPhase::Submitted,
        ] {
            assert!(checkpoint_data_ready(&checkpoint_in_phase(Some(phase))));
        }
    }

    #[test]
    fn data_not_ready_before_checkpointed() {
        for phase in [
            CheckpointPhase::Created,
            CheckpointPhase::Pending,
            CheckpointPhase::Checkpointing,
            CheckpointPhase::Failed,
        ] {
            assert!(!checkpoint_data_ready(&checkpoint_in_phase(Some(phase))));
        }
        assert!(!checkpoint_data_ready(&checkpoint_in_phase(None)));
    }

    #[test]
    fn patch_creates_annotation_map_when_absent() {
        let ops = annotation_patch_ops(false, POD_SPEC_HASH_ANNOTATION, "abc123");
        assert_eq!(ops.len(), 1);

        let json = serde_json::to_value(&json_patch::Patch(ops)).unwrap();
        assert_eq!(json[0]["op"], "add");
        assert_eq!(json[0]["path"], "/metadata/annotations");
        assert_eq!(json[0]["value"][POD_SPEC_HASH_ANNOTATION], "abc123");
    }

    #[test]
    fn patch_adds_key_when_map_exists() {
        let ops = annotation_patch_ops(true, POD_SPEC_HASH_ANNOTATION, "abc123");
        let json = serde_json::to_value(&json_patch::Patch(ops)).unwrap();

        // "/" in the annotation key must be pointer-escaped
        assert_eq!(json[0]["path"], "/metadata/annotations/grit.dev~1pod-spec-hash");
        assert_eq!(json[0]["value"], "abc123");
    }
}
