//! Checkpoint Custom Resource Definition
//!
//! A Checkpoint is the durable record of a request to snapshot a running
//! pod's state. The checkpoint controller drives it through
//! Created → Pending → Checkpointing → Checkpointed, and — when
//! `autoMigration` is set — on through Submitting → Submitted.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, VolumeClaimSource};

/// Lifecycle phase of a Checkpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CheckpointPhase {
    /// Checkpoint resource exists; target pod not yet captured
    #[default]
    Created,
    /// Target pod captured; agent job being placed
    Pending,
    /// Agent job is on the node staging checkpoint data
    Checkpointing,
    /// Checkpoint data is in shared storage
    Checkpointed,
    /// Auto-migration: creating the Restore and removing the source pod
    Submitting,
    /// Auto-migration hand-off complete
    Submitted,
    /// A precondition or the agent job failed; see conditions for the cause
    Failed,
}

impl std::fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Pending => write!(f, "Pending"),
            Self::Checkpointing => write!(f, "Checkpointing"),
            Self::Checkpointed => write!(f, "Checkpointed"),
            Self::Submitting => write!(f, "Submitting"),
            Self::Submitted => write!(f, "Submitted"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

impl std::str::FromStr for CheckpointPhase {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Created" => Ok(Self::Created),
            "Pending" => Ok(Self::Pending),
            "Checkpointing" => Ok(Self::Checkpointing),
            "Checkpointed" => Ok(Self::Checkpointed),
            "Submitting" => Ok(Self::Submitting),
            "Submitted" => Ok(Self::Submitted),
            "Failed" => Ok(Self::Failed),
            _ => Err(crate::Error::validation(
                "checkpoint",
                format!("unknown checkpoint phase: {s}"),
            )),
        }
    }
}

/// Status of a Checkpoint
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStatus {
    /// Node the checkpointed pod was running on; set once at Pending
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,

    /// Fingerprint of the pod spec; restoration pods must hash equal.
    /// Set once at Pending and never changed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_spec_hash: String,

    /// UID of the checkpointed pod, exported to the agent as TARGET_UID
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "podUID")]
    pub pod_uid: String,

    /// Current phase; absent until the controller first observes the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CheckpointPhase>,

    /// Transition history; authoritative for recovery out of Failed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// URI of the stored blob: `<volumeName>://<namespace>/<name>`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_path: String,
}

/// Specification for a Checkpoint
///
/// Immutable after create. The referenced pod must be in the same namespace.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kaito.sh",
    version = "v1alpha1",
    kind = "Checkpoint",
    plural = "checkpoints",
    shortname = "ckpt",
    namespaced,
    status = "CheckpointStatus",
    printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".spec.podName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#,
    printcolumn = r#"{"name":"Storage","type":"string","jsonPath":".status.dataPath"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSpec {
    /// Name of the pod to checkpoint (same namespace as the Checkpoint)
    pub pod_name: String,

    /// Shared-storage claim for checkpoint data; enables cross-node restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim: Option<VolumeClaimSource>,

    /// Automatically create a Restore and delete the source pod once
    /// checkpointed, so the owning workload recreates a replica elsewhere
    #[serde(default)]
    pub auto_migration: bool,
}

impl Checkpoint {
    /// Current phase, or `None` when the controller has not stamped one yet
    pub fn phase(&self) -> Option<&CheckpointPhase> {
        self.status.as_ref().and_then(|s| s.phase.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_spec(yaml: &str) -> CheckpointSpec {
        serde_yaml::from_str(yaml).expect("parse spec")
    }

    #[test]
    fn test_spec_roundtrip() {
        let spec = parse_spec(
            r#"
podName: p1
volumeClaim:
  claimName: ckpt-storage
autoMigration: true
"#,
        );

        assert_eq!(spec.pod_name, "p1");
        assert_eq!(
            spec.volume_claim.as_ref().map(|v| v.claim_name.as_str()),
            Some("ckpt-storage")
        );
        assert!(spec.auto_migration);
    }

    #[test]
    fn test_spec_defaults() {
        let spec = parse_spec("podName: p1");
        assert!(spec.volume_claim.is_none());
        assert!(!spec.auto_migration);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(CheckpointPhase::Created.to_string(), "Created");
        assert_eq!(CheckpointPhase::Pending.to_string(), "Pending");
        assert_eq!(CheckpointPhase::Checkpointing.to_string(), "Checkpointing");
        assert_eq!(CheckpointPhase::Checkpointed.to_string(), "Checkpointed");
        assert_eq!(CheckpointPhase::Submitting.to_string(), "Submitting");
        assert_eq!(CheckpointPhase::Submitted.to_string(), "Submitted");
        assert_eq!(CheckpointPhase::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_phase_parse_roundtrip() {
        let phases = [
            CheckpointPhase::Created,
            CheckpointPhase::Pending,
            CheckpointPhase::Checkpointing,
            CheckpointPhase::Checkpointed,
            CheckpointPhase::Submitting,
            CheckpointPhase::Submitted,
            CheckpointPhase::Failed,
        ];
        for phase in phases {
            let parsed: CheckpointPhase = phase.to_string().parse().unwrap();
            assert_eq!(phase, parsed);
        }
        assert!("Running".parse::<CheckpointPhase>().is_err());
    }

    #[test]
    fn test_status_serialization_omits_empty_fields() {
        let status = CheckpointStatus::default();
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "{}");

        let status = CheckpointStatus {
            node_name: "n1".to_string(),
            phase: Some(CheckpointPhase::Pending),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["nodeName"], "n1");
        assert_eq!(json["phase"], "Pending");
        assert!(json.get("dataPath").is_none());
        assert!(json.get("podUID").is_none());
    }

    #[test]
    fn test_checkpoint_phase_accessor() {
        let mut ckpt = Checkpoint::new(
            "c1",
            CheckpointSpec {
                pod_name: "p1".to_string(),
                volume_claim: None,
                auto_migration: false,
            },
        );
        assert!(ckpt.phase().is_none());

        ckpt.status = Some(CheckpointStatus::default());
        assert!(ckpt.phase().is_none());

        ckpt.status = Some(CheckpointStatus {
            phase: Some(CheckpointPhase::Checkpointed),
            ..Default::default()
        });
        assert_eq!(ckpt.phase(), Some(&CheckpointPhase::Checkpointed));
    }
}
