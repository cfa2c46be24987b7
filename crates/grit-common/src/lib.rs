//! Common types for the GRIT manager: CRDs, conditions, errors, and utilities

#![deny(missing_docs)]

pub mod backoff;
pub mod conditions;
pub mod crd;
pub mod error;
pub mod hash;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for GRIT system resources (agent config, manager deployment)
pub const GRIT_SYSTEM_NAMESPACE: &str = "grit-system";

/// Name of the ConfigMap carrying the agent host path and job template
pub const GRIT_AGENT_CONFIG_NAME: &str = "grit-agent-config";

/// Label key marking agent jobs (and their pods)
pub const GRIT_AGENT_LABEL: &str = "grit.dev/helper";

/// Label value marking agent jobs (and their pods)
pub const GRIT_AGENT_NAME: &str = "grit-agent";

/// Name prefix shared by every agent job
pub const GRIT_AGENT_JOB_PREFIX: &str = "grit-agent-";

/// Pod annotation: host path the checkpoint data was staged under
pub const CHECKPOINT_PATH_ANNOTATION: &str = "grit.dev/checkpoint";

/// Pod annotation: name of the restore this pod was bound to
pub const RESTORE_NAME_ANNOTATION: &str = "grit.dev/restore-name";

/// Restore annotation: pod-spec hash copied from the checkpoint at create
pub const POD_SPEC_HASH_ANNOTATION: &str = "grit.dev/pod-spec-hash";

/// Restore annotation: set to "true" once the pod webhook claimed the restore
pub const POD_SELECTED_ANNOTATION: &str = "grit.dev/pod-selected";

/// Derive the agent job name for a checkpoint or restore name
pub fn agent_job_name(owner: &str) -> String {
    format!("{GRIT_AGENT_JOB_PREFIX}{owner}")
}

/// Resolve the owning checkpoint/restore name from an agent job name
///
/// Returns `None` for jobs that do not carry the agent name prefix.
pub fn owner_for_agent_job(job_name: &str) -> Option<&str> {
    job_name
        .strip_prefix(GRIT_AGENT_JOB_PREFIX)
        .filter(|rest| !rest.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_job_name() {
        assert_eq!(agent_job_name("c1"), "grit-agent-c1");
        assert_eq!(agent_job_name("my-restore"), "grit-agent-my-restore");
    }

    #[test]
    fn test_owner_for_agent_job() {
        assert_eq!(owner_for_agent_job("grit-agent-c1"), Some("c1"));
        assert_eq!(owner_for_agent_job("grit-agent-"), None);
        assert_eq!(owner_for_agent_job("model-prefetch-c1"), None);
        assert_eq!(owner_for_agent_job("c1"), None);
    }

    #[test]
    fn test_job_name_roundtrip() {
        for name in ["c1", "web-7d9f", "a"] {
            assert_eq!(owner_for_agent_job(&agent_job_name(name)), Some(name));
        }
    }
}
