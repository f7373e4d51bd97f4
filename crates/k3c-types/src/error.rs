//! Error types for the domain model.

use k3c_error::CommonError;
use thiserror::Error;

/// Errors produced while constructing or interpreting domain objects.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Common errors shared across k3c crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Cluster name is not a valid DNS label.
    #[error("invalid cluster name '{0}': must match [a-z0-9]([-a-z0-9]*[a-z0-9])? and be at most 32 characters")]
    InvalidClusterName(String),

    /// A mandatory container label is absent.
    #[error("container '{container}' is missing label '{label}'")]
    MissingLabel { container: String, label: String },

    /// A container label is present but cannot be interpreted.
    #[error("container '{container}' has malformed label '{label}': {value}")]
    MalformedLabel {
        container: String,
        label: String,
        value: String,
    },

    /// A port mapping string could not be parsed.
    #[error("invalid port mapping '{0}'")]
    InvalidPortMapping(String),

    /// A volume mount string could not be parsed.
    #[error("invalid volume mount '{0}'")]
    InvalidVolumeMount(String),

    /// An unknown role string was encountered.
    #[error("unknown role '{0}'")]
    UnknownRole(String),
}
