//! Supporting types shared by the Checkpoint and Restore CRDs

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
///
/// Condition history is authoritative over phase for recovery: each
/// successful transition is recorded as a condition whose type is the phase
/// name, so a Failed excursion can be resumed from the last good phase.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (phase name, or `Failed`)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the given timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
        }
    }
}

/// Reference to the workload controller whose next pod is the restoration target
///
/// A pod is a match when one of its controller owner references agrees on
/// uid, kind and apiVersion.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadOwnerRef {
    /// API version of the owner (e.g. "apps/v1")
    pub api_version: String,

    /// Kind of the owner (e.g. "ReplicaSet")
    pub kind: String,

    /// Name of the owner
    pub name: String,

    /// UID of the owner
    pub uid: String,
}

impl WorkloadOwnerRef {
    /// True when this reference denotes the same owner as `other`
    pub fn matches(&self, other: &OwnerReference) -> bool {
        self.uid == other.uid && self.kind == other.kind && self.api_version == other.api_version
    }
}

impl From<&OwnerReference> for WorkloadOwnerRef {
    fn from(other: &OwnerReference) -> Self {
        Self {
            api_version: other.api_version.clone(),
            kind: other.kind.clone(),
            name: other.name.clone(),
            uid: other.uid.clone(),
        }
    }
}

/// Pointer to the shared-storage claim holding checkpoint data
///
/// The user is expected to provision the claim (and its volume) before
/// creating the Checkpoint.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimSource {
    /// Name of the PersistentVolumeClaim in the checkpoint's namespace
    pub claim_name: String,

    /// Mount the claim read-only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_new_keeps_timestamp() {
        let now = Utc::now();
        let condition = Condition::new(
            "Pending",
            ConditionStatus::True,
            "InitializingCompleted",
            "pod spec hash has been configured",
            now,
        );

        assert_eq!(condition.type_, "Pending");
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, "InitializingCompleted");
        assert_eq!(condition.last_transition_time, now);
    }

    #[test]
    fn test_condition_serialization_uses_kubernetes_field_names() {
        let condition = Condition::new(
            "Checkpointed",
            ConditionStatus::True,
            "GritAgentCompleted",
            "data staged",
            Utc::now(),
        );
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "Checkpointed");
        assert!(json.get("lastTransitionTime").is_some());
        assert!(json.get("last_transition_time").is_none());
    }

    #[test]
    fn test_condition_status_default_is_unknown() {
        assert_eq!(ConditionStatus::default(), ConditionStatus::Unknown);
    }

    #[test]
    fn test_owner_ref_matches() {
        let owner = OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "ReplicaSet".to_string(),
            name: "web-7d9f".to_string(),
            uid: "u1".to_string(),
            controller: Some(true),
            ..Default::default()
        };

        let matching = WorkloadOwnerRef::from(&owner);
        assert!(matching.matches(&owner));

        // Name is not part of identity, uid is
        let mut renamed = matching.clone();
        renamed.name = "other".to_string();
        assert!(renamed.matches(&owner));

        let mut wrong_uid = matching.clone();
        wrong_uid.uid = "u2".to_string();
        assert!(!wrong_uid.matches(&owner));

        let mut wrong_kind = matching.clone();
        wrong_kind.kind = "StatefulSet".to_string();
        assert!(!wrong_kind.matches(&owner));

        let mut wrong_version = matching;
        wrong_version.api_version = "apps/v1beta1".to_string();
        assert!(!wrong_version.matches(&owner));
    }

    #[test]
    fn test_volume_claim_roundtrip() {
        let claim = VolumeClaimSource {
            claim_name: "ckpt-storage".to_string(),
            read_only: None,
        };
        let json = serde_json::to_string(&claim).unwrap();
        assert!(json.contains("claimName"));
        assert!(!json.contains("readOnly"));
        let parsed: VolumeClaimSource = serde_json::from_str(&json).unwrap();
        assert_eq!(claim, parsed);
    }
}
