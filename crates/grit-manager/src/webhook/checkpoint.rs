//! Checkpoint validation webhook
//!
//! Rejects structurally invalid or premature Checkpoint requests before
//! they reach the controller: the target pod must exist, be running and
//! scheduled, and its node must be ready. Fail-closed.

use std::sync::Arc;

use axum::{extract::State, Json};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DynamicObject};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::ResourceExt;
use tracing::{error, info};

use grit_common::crd::Checkpoint;

use super::WebhookState;

/// Handle the validating admission review for Checkpoint create
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Checkpoint>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Checkpoint> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse checkpoint admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = validate_checkpoint(&state, &req).await;
    Json(response.into_review())
}

async fn validate_checkpoint(
    state: &WebhookState,
    req: &AdmissionRequest<Checkpoint>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);

    let Some(ckpt) = req.object.as_ref() else {
        return response.deny("no checkpoint object in admission request");
    };
    let name = ckpt.name_any();

    if ckpt.spec.pod_name.is_empty() {
        return response.deny(format!("pod is not specified in checkpoint({name})"));
    }

    let namespace = req
        .namespace
        .clone()
        .or_else(|| ckpt.namespace())
        .unwrap_or_default();

    let pods: Api<Pod> = Api::namespaced(state.client.clone(), &namespace);
    let pod = match pods.get_opt(&ckpt.spec.pod_name).await {
        Ok(Some(pod)) => pod,
        Ok(None) => {
            return response.deny(format!(
                "pod({}) referenced by checkpoint({name}) doesn't exist",
                ckpt.spec.pod_name
            ));
        }
        Err(e) => return response.deny(e.to_string()),
    };

    let node_name = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .unwrap_or_default();
    let running = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Running");
    if !running || node_name.is_empty() {
        return response.deny(format!(
            "pod({}) referenced by checkpoint({name}) is not running",
            pod.name_any()
        ));
    }

    let nodes: Api<Node> = Api::all(state.client.clone());
    let node = match nodes.get_opt(&node_name).await {
        Ok(Some(node)) => node,
        Ok(None) => {
            return response.deny(format!(
                "node({node_name}) referenced by pod({}) doesn't exist",
                pod.name_any()
            ));
        }
        Err(e) => return response.deny(e.to_string()),
    };

    if !is_node_ready(&node) {
        return response.deny(format!(
            "node({node_name}) referenced by pod({}) and checkpoint({name}) is not ready",
            pod.name_any()
        ));
    }

    info!(checkpoint = %name, namespace = %namespace, "checkpoint admitted");
    response
}

/// A node is ready when its Ready condition is True
fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}
