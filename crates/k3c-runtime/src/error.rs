//! Error types for runtime operations.

use k3c_error::CommonError;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while talking to the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Common errors shared across k3c crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// The runtime daemon is unreachable or refused the operation.
    #[error("runtime daemon error: {0}")]
    Daemon(String),

    /// A command exited non-zero.
    #[error("'{command}' failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The runtime returned output we could not interpret.
    #[error("unexpected runtime output for '{command}': {message}")]
    MalformedOutput { command: String, message: String },

    /// No free address left in the network's subnet.
    #[error("subnet {0} is exhausted")]
    SubnetExhausted(String),
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}

impl RuntimeError {
    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::Common(CommonError::not_found(resource))
    }

    /// Creates a new already exists error.
    #[must_use]
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::Common(CommonError::already_exists(resource))
    }

    /// Creates a new cancellation error.
    #[must_use]
    pub fn cancelled(what: impl Into<String>) -> Self {
        Self::Common(CommonError::cancelled(what))
    }

    /// Returns true if this is a cancellation error.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Common(CommonError::Cancelled(_)))
    }

    /// Returns true if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Common(CommonError::NotFound(_)))
    }

    /// Returns true if this is an already exists error.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Common(CommonError::AlreadyExists(_)))
    }
}
