//! Error types for ctxtree

use thiserror::Error;

use crate::task::TaskStatus;

/// Result type alias for ctxtree operations
pub type Result<T> = std::result::Result<T, CtxError>;

/// Main error type for ctxtree operations
#[derive(Error, Debug)]
pub enum CtxError {
    /// Scope, task or record is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// A task with the same `(project_id, task_tree_id, id)` already exists
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    /// Dependency references an unknown task or closes a cycle
    #[error("Invalid dependency: {0}")]
    InvalidDependency(String),

    /// Other tasks in the project still depend on this one
    #[error("Task {task_id} has dependents: {}", .dependents.join(", "))]
    HasDependents {
        task_id: String,
        dependents: Vec<String>,
    },

    /// Path addresses a value of the wrong JSON type
    #[error("Type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Nothing stored at the path (distinct from a stored null)
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// Path expression could not be parsed or compiled
    #[error("Invalid path {expr:?}: {reason}")]
    InvalidPath { expr: String, reason: String },

    /// Status change not allowed by the transition table
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// Malformed caller input (empty ids, non-object patches)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Connection or transport failure; retryable
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Non-retryable backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Migration stopped at a project boundary on request
    #[error("Migration cancelled")]
    Cancelled,

    /// Migration finished with failed projects or validation mismatches
    #[error(
        "Migration partially failed: {} project(s) failed, {mismatches} mismatch(es)",
        .failed.len()
    )]
    MigrationPartialFailure {
        failed: Vec<(String, String)>,
        mismatches: usize,
    },
}

impl CtxError {
    /// Whether the operation may succeed if attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CtxError::BackendUnavailable(_))
    }

    /// Whether the error means "absent" rather than "broken".
    pub fn is_not_found(&self) -> bool {
        matches!(self, CtxError::NotFound(_) | CtxError::PathNotFound(_))
    }
}

impl From<serde_json::Error> for CtxError {
    fn from(err: serde_json::Error) -> Self {
        CtxError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for CtxError {
    fn from(err: toml::de::Error) -> Self {
        CtxError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backend_unavailable_is_retryable() {
        assert!(CtxError::BackendUnavailable("connection reset".into()).is_retryable());
        assert!(!CtxError::Backend("syntax error".into()).is_retryable());
        assert!(!CtxError::NotFound("project p1".into()).is_retryable());
        assert!(!CtxError::Cancelled.is_retryable());
    }

    #[test]
    fn has_dependents_lists_ids() {
        let err = CtxError::HasDependents {
            task_id: "t1".into(),
            dependents: vec!["t2".into(), "t3".into()],
        };
        assert_eq!(err.to_string(), "Task t1 has dependents: t2, t3");
    }

    #[test]
    fn partial_failure_counts() {
        let err = CtxError::MigrationPartialFailure {
            failed: vec![("p2".into(), "boom".into())],
            mismatches: 3,
        };
        assert!(err.to_string().contains("1 project(s) failed"));
        assert!(err.to_string().contains("3 mismatch(es)"));
    }

    #[test]
    fn transition_error_display() {
        let err = CtxError::InvalidTransition {
            from: TaskStatus::Blocked,
            to: TaskStatus::Done,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition from blocked to done"
        );
    }
}
