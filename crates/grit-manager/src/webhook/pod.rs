//! Pod-binding mutation webhook
//!
//! Intercepts pod creation and matches the pod against open restores in
//! its namespace: the first restore whose owner reference matches one of
//! the pod's controller owner references and whose recorded pod-spec hash
//! equals the pod's computed hash is claimed for this pod.
//!
//! The webhook is fail-open: transient lookup failures never block pod
//! creation. Only a failed restore claim is surfaced as a denial, so the
//! workload controller retries and the claim stays race-free.

use std::sync::Arc;

use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::ResourceExt;
use tracing::{error, info, warn};

use grit_common::crd::Restore;
use grit_common::hash::compute_pod_spec_hash;
use grit_common::{
    CHECKPOINT_PATH_ANNOTATION, POD_SELECTED_ANNOTATION, POD_SPEC_HASH_ANNOTATION,
    RESTORE_NAME_ANNOTATION,
};

use super::WebhookState;

/// Handle the mutating admission review for Pod create
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Pod> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse pod admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = mutate_pod(&state, &req).await;
    Json(response.into_review())
}

async fn mutate_pod(state: &WebhookState, req: &AdmissionRequest<Pod>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);

    let Some(pod) = req.object.as_ref() else {
        return response;
    };

    // Already bound to a restore
    if pod.annotations().contains_key(CHECKPOINT_PATH_ANNOTATION) {
        return response;
    }

    let Some(namespace) = req.namespace.clone().or_else(|| pod.namespace()) else {
        return response;
    };
    let Some(pod_spec) = pod.spec.as_ref() else {
        return response;
    };

    let restores: Api<Restore> = Api::namespaced(state.client.clone(), &namespace);
    let restore_list = match restores.list(&Default::default()).await {
        Ok(list) => list,
        Err(e) => {
            warn!(namespace = %namespace, error = %e, "failed to list restores, allowing pod unchanged");
            return response;
        }
    };

    let pod_spec_hash = match compute_pod_spec_hash(pod_spec) {
        Ok(hash) => hash,
        Err(e) => {
            warn!(namespace = %namespace, error = %e, "failed to hash pod spec, allowing pod unchanged");
            return response;
        }
    };

    let Some(selected) = select_restore(&restore_list.items, pod, &pod_spec_hash) else {
        return response;
    };
    let restore_name = selected.name_any();

    // Binding a pod to an unreadable data path would be useless; let the
    // pod through and leave the restore open.
    let Some(host_base) = state.agent.host_path() else {
        warn!(restore = %restore_name, "agent config unavailable, allowing pod unchanged");
        return response;
    };

    // Claim the restore first (optimistic: a concurrent claim conflicts on
    // resourceVersion and this admission fails, so pod creation retries)
    let claim = serde_json::json!({
        "metadata": {
            "resourceVersion": selected.resource_version(),
            "annotations": { POD_SELECTED_ANNOTATION: "true" },
        }
    });
    if let Err(e) = restores
        .patch(&restore_name, &PatchParams::default(), &Patch::Merge(&claim))
        .await
    {
        error!(restore = %restore_name, error = %e, "failed to claim restore for pod");
        return response.deny(format!("failed to claim restore({restore_name}): {e}"));
    }

    let checkpoint_path = format!(
        "{}/{namespace}/{}",
        host_base.trim_end_matches('/'),
        selected.spec.checkpoint_name
    );
    let patch = bind_pod_patch_ops(
        pod.metadata.annotations.is_some(),
        &checkpoint_path,
        &restore_name,
    );

    info!(
        namespace = %namespace,
        pod = %pod.name_any(),
        restore = %restore_name,
        "bound pod to restore"
    );
    match response.with_patch(json_patch::Patch(patch)) {
        Ok(response) => response,
        Err(e) => {
            error!(restore = %restore_name, error = %e, "failed to serialize pod patch");
            AdmissionResponse::from(req).deny(format!("patch serialization error: {e}"))
        }
    }
}

/// First open restore matching the pod's controller owner refs and spec hash
///
/// Candidates are scanned in list order; phase and the pod-selected
/// annotation decide openness, the owner reference plus the recorded
/// pod-spec hash decide the match.
fn select_restore<'a>(restores: &'a [Restore], pod: &Pod, pod_spec_hash: &str) -> Option<&'a Restore> {
    restores.iter().filter(|r| r.is_open()).find(|restore| {
        let owner_matches = pod
            .metadata
            .owner_references
            .as_ref()
            .map(|refs| refs.iter().any(|o| restore.spec.owner_ref.matches(o)))
            .unwrap_or(false);

        let hash_matches = restore
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(POD_SPEC_HASH_ANNOTATION))
            .is_some_and(|recorded| recorded == pod_spec_hash);

        owner_matches && hash_matches
    })
}

/// JSON patch stamping the checkpoint-path and restore-name annotations
fn bind_pod_patch_ops(
    has_annotations: bool,
    checkpoint_path: &str,
    restore_name: &str,
) -> Vec<json_patch::PatchOperation> {
    use json_patch::{AddOperation, PatchOperation};
    use jsonptr::PointerBuf;

    if has_annotations {
        vec![
            PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "annotations", CHECKPOINT_PATH_ANNOTATION]),
                value: serde_json::Value::String(checkpoint_path.to_string()),
            }),
            PatchOperation::Add(AddOperation {
                path: PointerBuf::from_tokens(["metadata", "annotations", RESTORE_NAME_ANNOTATION]),
                value: serde_json::Value::String(restore_name.to_string()),
            }),
        ]
    } else {
        vec![PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["metadata", "annotations"]),
            value: serde_json::json!({
                CHECKPOINT_PATH_ANNOTATION: checkpoint_path,
                RESTORE_NAME_ANNOTATION: restore_name,
            }),
        })]
    }
}
