//! Lifecycle reconcilers for the GRIT manager
//!
//! Two event-driven state machines, one per Checkpoint and one per Restore,
//! plus the agent-job subsystem that places one-shot worker jobs on the
//! node holding (or receiving) the workload.

pub mod agent;
pub mod checkpoint;
pub mod restore;

use std::time::Duration;

use kube::Client;

use grit_common::backoff::RequeueBackoff;

use crate::agent::AgentManager;

/// Requeue after a successful transition (next step usually actionable)
pub(crate) const REQUEUE_SHORT: Duration = Duration::from_secs(5);

/// Requeue while polling an external actor (agent job, pod startup)
pub(crate) const REQUEUE_POLL: Duration = Duration::from_secs(15);

/// Shared context for the lifecycle controllers
pub struct LifecycleContext {
    /// Kubernetes client
    pub client: Client,
    /// Cached agent configuration and job construction
    pub agent: AgentManager,
    /// Error-policy pacing (per-key exponential backoff + global limiter)
    pub backoff: RequeueBackoff,
}

impl LifecycleContext {
    /// Create a context for one controller
    pub fn new(client: Client, agent: AgentManager) -> Self {
        Self {
            client,
            agent,
            backoff: RequeueBackoff::new(),
        }
    }
}
