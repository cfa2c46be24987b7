//! Error types for the GRIT manager
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries enough context (resource names, underlying causes)
//! to act on without consulting logs.

use thiserror::Error;

/// Main error type for GRIT operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The agent configuration object or one of its required keys is absent
    #[error("agent config missing: {message}")]
    ConfigMissing {
        /// Description of what is missing
        message: String,
    },

    /// The agent job template failed to render or decode
    #[error("bad agent job template: {message}")]
    BadTemplate {
        /// Description of the render/decode failure
        message: String,
    },

    /// The rendered agent job does not declare exactly one container
    #[error("agent job must declare exactly one container, found {count}")]
    BadContainerCount {
        /// Number of containers found in the rendered job
        count: usize,
    },

    /// Validation error for a Checkpoint or Restore
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid state
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "webhook")
        context: String,
    },
}

impl Error {
    /// Create a config-missing error
    pub fn config_missing(msg: impl Into<String>) -> Self {
        Self::ConfigMissing {
            message: msg.into(),
        }
    }

    /// Create a bad-template error
    pub fn bad_template(msg: impl Into<String>) -> Self {
        Self::BadTemplate {
            message: msg.into(),
        }
    }

    /// Create a validation error for a specific resource
    pub fn validation(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True if this is an optimistic-concurrency conflict (HTTP 409)
    ///
    /// Conflicts are returned up so the reconcile reruns against fresh state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 409
        )
    }

    /// True if the underlying API error is a 404
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }

    /// Check if this error should be retried by the work queue
    ///
    /// Builder errors (missing config, bad template, container count) and
    /// validation errors describe preconditions the user must fix; they are
    /// recorded as conditions rather than retried. Everything else retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::ConfigMissing { .. } => false,
            Error::BadTemplate { .. } => false,
            Error::BadContainerCount { .. } => false,
            Error::Validation { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}
