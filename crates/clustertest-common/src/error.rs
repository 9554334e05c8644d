//! Error types for clustertest
//!
//! Errors are structured with fields so a failed test run reports which
//! cluster, step or unit was involved. Lifecycle steps wrap their cause in
//! [`Error::Step`] so the terminal message reads `failed to <step>: <cause>`.

use std::time::Duration;

use thiserror::Error;

use crate::store::{ErrorKind, StoreError};

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for clustertest operations
#[derive(Debug, Error)]
pub enum Error {
    /// Object store error
    #[error("object store error: {source}")]
    Store {
        /// The classified store error
        #[from]
        source: StoreError,
    },

    /// A poll ran out of time or was cancelled before its condition held
    #[error("deadline exceeded after {}s waiting for {operation}", timeout.as_secs())]
    DeadlineExceeded {
        /// Description of the awaited condition
        operation: String,
        /// Configured timeout
        timeout: Duration,
    },

    /// Version resolution exhausted every source
    #[error("unable to get latest release of {unit}: {message}")]
    Resolution {
        /// Installable unit being resolved
        unit: String,
        /// Why resolution failed
        message: String,
    },

    /// A workload reported fewer available replicas than desired
    #[error("{resource} has {available} available replicas, expected {desired}")]
    ReplicasMismatch {
        /// The mismatched workload, e.g. `Deployment kube-system/coredns`
        resource: String,
        /// Available replicas reported in status
        available: i32,
        /// Desired replicas
        desired: i32,
    },

    /// A lifecycle step failed
    #[error("failed to {step}: {source}")]
    Step {
        /// Step description, e.g. "apply cluster manifest"
        step: String,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// Invalid input
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field (e.g., "cluster_context")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Kubeconfig extraction or client construction failed
    #[error("credential error for {cluster}: {message}")]
    Credential {
        /// Cluster whose credential was being handled
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Wrap an error with the lifecycle step that produced it
    pub fn step(step: impl Into<String>, source: impl Into<Error>) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(source.into()),
        }
    }

    /// Create a deadline error for the named operation
    pub fn deadline(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a resolution error for a unit
    pub fn resolution(unit: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Resolution {
            unit: unit.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field
    pub fn validation_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a credential error for a cluster
    pub fn credential(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credential {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// The innermost error, looking through step wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// The store error at the root of this error, if any
    pub fn store_error(&self) -> Option<&StoreError> {
        match self.root() {
            Error::Store { source } => Some(source),
            _ => None,
        }
    }

    /// Store error kind at the root of this error, if any
    pub fn store_kind(&self) -> Option<ErrorKind> {
        self.store_error().map(|e| e.kind)
    }

    /// True if the root cause is a missing object
    pub fn is_not_found(&self) -> bool {
        self.store_kind() == Some(ErrorKind::NotFound)
    }

    /// True if the root cause is expected to clear on its own
    pub fn is_transient(&self) -> bool {
        self.store_kind() == Some(ErrorKind::Transient)
    }

    /// True if the root cause is a poll deadline
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self.root(), Error::DeadlineExceeded { .. })
    }

    /// Get the step name if this error was produced by a lifecycle step
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Error::Step { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
