//! Error types for kubez controllers
//!
//! Errors carry enough context (object key, operation) to be useful in logs.
//! [`Error::is_retryable`] is the single place that decides whether a failed
//! reconciliation goes back on the work queue.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kubez operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Scaling annotations on a workload are malformed or contradictory
    #[error("validation error for {object}: {message}")]
    Validation {
        /// `namespace/name` of the offending workload
        object: String,
        /// Description of what's invalid
        message: String,
    },

    /// An object with the autoscaler's name exists but is not managed by us
    #[error("{object} exists and is not managed by {manager}")]
    Unmanaged {
        /// `namespace/name` of the foreign object
        object: String,
        /// Expected manager
        manager: String,
    },

    /// An API call did not finish before its deadline
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Operation that timed out (e.g. "get deployment")
        operation: String,
        /// Deadline that was exceeded
        seconds: u64,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "worker", "queue", "leader")
        context: String,
    },
}

impl Error {
    /// Create a validation error without object context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a specific object
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create an unmanaged-object error
    pub fn unmanaged(object: impl Into<String>) -> Self {
        Self::Unmanaged {
            object: object.into(),
            manager: crate::CONTROLLER_NAME.to_string(),
        }
    }

    /// Create a timeout error for an operation
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create an internal error without context
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

    /// Check if this error is retryable
    ///
    /// Conflicts (409), throttling (429), server errors and transport failures
    /// are transient. Other 4xx responses, validation and ownership errors
    /// need an operator to change something first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Unmanaged { .. } => false,
            Error::Timeout { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error breaks a controller invariant and should stop the worker
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Internal { context, .. } if context == "invariant")
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Returns true when the error is a Kubernetes 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
