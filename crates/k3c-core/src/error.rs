//! Error types for cluster orchestration.

use std::time::Duration;

use k3c_config::ConfigError;
use k3c_error::CommonError;
use k3c_runtime::RuntimeError;
use k3c_types::{Role, TypesError};
use thiserror::Error;

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while orchestrating clusters.
///
/// Every variant carries the offending object's identity where one exists,
/// so the CLI can report cluster, node or registry names alongside the
/// originating runtime error.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Common errors shared across k3c crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Configuration was rejected before any mutation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Domain model violation.
    #[error(transparent)]
    Types(#[from] TypesError),

    /// The container runtime reported a failure.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A node did not become ready within its timeout.
    #[error("node '{node}' ({role}) not ready after {}s", waited.as_secs())]
    ReadinessTimeout {
        node: String,
        role: Role,
        waited: Duration,
    },

    /// A lifecycle hook failed.
    #[error("hook '{description}' on node '{node}' failed: {message}")]
    Hook {
        node: String,
        description: String,
        message: String,
    },

    /// The load balancer rejected its new configuration.
    #[error("load balancer reload failed with status {status}: {stderr}")]
    LbReloadFailed { status: i32, stderr: String },

    /// The operation failed and all mutations were undone.
    #[error("{original} (all changes rolled back)")]
    RolledBack {
        #[source]
        original: Box<CoreError>,
    },

    /// The operation failed and cleanup failed too; objects leaked.
    #[error("{original}; rollback failed, leaked objects: [{}]", leaked.join(", "))]
    RollbackFailed {
        original: Box<CoreError>,
        /// Objects that could not be removed, for manual cleanup.
        leaked: Vec<String>,
        /// The individual cleanup failures.
        failures: Vec<String>,
    },
}

impl CoreError {
    /// Maps the error onto the process exit code contract:
    /// 1 generic, 2 validation, 3 timeout, 4 rolled back, 5 rollback failed.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Types(_) | Self::Common(CommonError::Config(_)) => 2,
            Self::ReadinessTimeout { .. }
            | Self::Common(CommonError::Timeout(_) | CommonError::Cancelled(_)) => 3,
            Self::Runtime(err) if err.is_cancelled() => 3,
            Self::RolledBack { original } => match original.exit_code() {
                1 => 4,
                code => code,
            },
            Self::RollbackFailed { .. } => 5,
            _ => 1,
        }
    }

    /// Returns true when the error is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Common(err) => err.is_cancelled(),
            Self::Runtime(err) => err.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_err() -> CoreError {
        CoreError::ReadinessTimeout {
            node: "k3c-t-server-0".to_string(),
            role: Role::Server,
            waited: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(timeout_err().exit_code(), 3);
        assert_eq!(
            CoreError::Config(ConfigError::UnknownApiVersion("x".into())).exit_code(),
            2
        );
        assert_eq!(
            CoreError::RollbackFailed {
                original: Box::new(timeout_err()),
                leaked: vec!["k3c-t-server-0".into()],
                failures: vec!["rm failed".into()],
            }
            .exit_code(),
            5
        );
    }

    #[test]
    fn test_rolled_back_keeps_timeout_code() {
        let err = CoreError::RolledBack {
            original: Box::new(timeout_err()),
        };
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_rolled_back_generic_maps_to_four() {
        let err = CoreError::RolledBack {
            original: Box::new(CoreError::LbReloadFailed {
                status: 1,
                stderr: "bad config".into(),
            }),
        };
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_rollback_never_masks_original() {
        let err = CoreError::RolledBack {
            original: Box::new(timeout_err()),
        };
        assert!(err.to_string().contains("not ready"));

        let err = CoreError::RollbackFailed {
            original: Box::new(timeout_err()),
            leaked: vec!["k3c-t-server-0".into()],
            failures: vec!["network busy".into()],
        };
        let text = err.to_string();
        assert!(text.contains("not ready"));
        assert!(text.contains("k3c-t-server-0"));
    }
}
