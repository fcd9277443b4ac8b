//! Error types for the Stowage operator
//!
//! `Error` is the structured error used by shared helpers and the
//! Kubernetes client seam. `ReconcileError` is what controller reconcile
//! functions return to `kube::runtime::Controller`.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Stowage operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs or helper inputs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// True when this is a Kubernetes 409 AlreadyExists response
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

/// Error returned from controller reconcile functions
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Kubernetes API call failed
    #[error("kubernetes error: {0}")]
    Kube(String),

    /// The reconciled object is malformed in a way retries cannot fix
    #[error("validation error: {0}")]
    Validation(String),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Error> for ReconcileError {
    fn from(e: Error) -> Self {
        match e {
            Error::Kube { source } => Self::Kube(source.to_string()),
            Error::Validation { message, .. } => Self::Validation(message),
            other => Self::Internal(other.to_string()),
        }
    }
}
