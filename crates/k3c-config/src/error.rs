//! Error types for the configuration pipeline.

use k3c_error::CommonError;
use k3c_types::TypesError;
use thiserror::Error;

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// A single schema violation.
///
/// Validation collects every violation before failing, so users fix their
/// config in one pass instead of one error at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Stable machine-readable code.
    pub code: String,
    /// Path of the offending field, dotted.
    pub path: String,
    /// Human-readable message.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.path, self.message)
    }
}

/// Errors produced by the configuration pipeline.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Common errors shared across k3c crates.
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Domain model construction failed.
    #[error(transparent)]
    Types(#[from] TypesError),

    /// The document's `apiVersion` is not one we know.
    #[error("unknown apiVersion '{0}'")]
    UnknownApiVersion(String),

    /// A migration step between two schema versions failed.
    #[error("migration {from} -> {to} failed: {message}")]
    MigrationFailure {
        from: String,
        to: String,
        message: String,
    },

    /// The document violates the schema of the current version.
    #[error("config validation failed with {} error(s):\n{}", .0.len(), format_violations(.0))]
    SchemaViolation(Vec<Violation>),

    /// A node filter could not be parsed.
    #[error("invalid node filter '{0}'")]
    InvalidNodeFilter(String),

    /// A node filter matched nothing.
    #[error("node filter '{0}' matches no node")]
    FilterNoMatch(String),

    /// A single-target context was given a filter matching several nodes.
    #[error("node filter '{0}' is ambiguous here: exactly one target required")]
    FilterAmbiguous(String),

    /// The same host port is bound more than once.
    #[error("duplicate port binding for host port {0}")]
    DuplicatePortBinding(String),

    /// The document is not valid YAML or does not deserialize.
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_violation_lists_all() {
        let err = ConfigError::SchemaViolation(vec![
            Violation {
                code: "name-missing".into(),
                path: "metadata.name".into(),
                message: "required".into(),
            },
            Violation {
                code: "servers-zero".into(),
                path: "servers".into(),
                message: "must be at least 1".into(),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("2 error(s)"));
        assert!(text.contains("metadata.name"));
        assert!(text.contains("servers"));
    }
}
