//! Custom Resource Definitions for GRIT
//!
//! Two kinds under `kaito.sh/v1alpha1`: Checkpoint and Restore.

mod checkpoint;
mod restore;
mod types;

pub use checkpoint::{Checkpoint, CheckpointPhase, CheckpointSpec, CheckpointStatus};
pub use restore::{Restore, RestorePhase, RestoreSpec, RestoreStatus};
pub use types::{Condition, ConditionStatus, VolumeClaimSource, WorkloadOwnerRef};
