//! Restore Custom Resource Definition
//!
//! A Restore is the durable record of a request to materialize previously
//! checkpointed state into a new pod. It is "open" until the pod webhook
//! claims it for a freshly created pod; the restore controller then
//! completes the restoration on that pod's node.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, WorkloadOwnerRef};
use crate::POD_SELECTED_ANNOTATION;

/// Lifecycle phase of a Restore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestorePhase {
    /// Restore resource exists; no pod bound yet
    #[default]
    Created,
    /// A pod was bound; waiting for scheduling, then placing the agent job
    Pending,
    /// Agent job is staging data; restoration pod starting
    Restoring,
    /// Restoration pod reached Running
    Restored,
    /// A precondition or the restoration pod failed; see conditions
    Failed,
}

impl std::fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Pending => write!(f, "Pending"),
            Self::Restoring => write!(f, "Restoring"),
            Self::Restored => write!(f, "Restored"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl std::str::FromStr for RestorePhase {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Created" => Ok(Self::Created),
            "Pending" => Ok(Self::Pending),
            "Restoring" => Ok(Self::Restoring),
            "Restored" => Ok(Self::Restored),
            "Failed" => Ok(Self::Failed),
            _ => Err(crate::Error::validation(
                "restore",
                format!("unknown restore phase: {s}"),
            )),
        }
    }
}

/// Status of a Restore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    /// Node the restoration pod was scheduled to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,

    /// Name of the pod selected for restoration
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_pod: String,

    /// Current phase; absent until the controller first observes the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<RestorePhase>,

    /// Transition history; authoritative for recovery out of Failed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Specification for a Restore
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kaito.sh",
    version = "v1alpha1",
    kind = "Restore",
    plural = "restores",
    shortname = "rt",
    namespaced,
    status = "RestoreStatus",
    printcolumn = r#"{"name":"Checkpoint","type":"string","jsonPath":".spec.checkpointName"}"#,
    printcolumn = r#"{"name":"TargetPod","type":"string","jsonPath":".status.targetPod"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Name of the Checkpoint (same namespace) whose data will be restored.
    /// Only checkpoints whose data is ready are accepted.
    pub checkpoint_name: String,

    /// Owner of the restoration pod. The next pod created under this
    /// controller whose spec hashes equal to the checkpoint's is bound.
    pub owner_ref: WorkloadOwnerRef,
}

impl Restore {
    /// Current phase, or `None` when the controller has not stamped one yet
    pub fn phase(&self) -> Option<&RestorePhase> {
        self.status.as_ref().and_then(|s| s.phase.as_ref())
    }

    /// True while no pod has been bound by the webhook
    ///
    /// Open restores are candidates for pod binding: phase empty or
    /// Created, and the pod-selected annotation not set.
    pub fn is_open(&self) -> bool {
        let phase_open = matches!(self.phase(), None | Some(RestorePhase::Created));
        let selected = self
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(POD_SELECTED_ANNOTATION))
            .is_some_and(|v| v == "true");
        phase_open && !selected
    }
}
