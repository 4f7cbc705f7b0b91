//! Store error types

use thiserror::Error;

use crate::tasks::TaskState;

/// Errors returned by the registry and task store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid task state transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("Task {id} is already {state} and cannot be modified")]
    TaskTerminal { id: String, state: TaskState },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Store is closed")]
    Closed,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("spawn_blocking task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub(crate) fn task_not_found(id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity: "task",
            id: id.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = StoreError::InvalidTransition {
            from: TaskState::Completed,
            to: TaskState::Working,
        };
        assert_eq!(
            err.to_string(),
            "Invalid task state transition: COMPLETED -> WORKING"
        );

        let err = StoreError::task_not_found("abc");
        assert_eq!(err.to_string(), "task not found: abc");
        assert_eq!(StoreError::Closed.to_string(), "Store is closed");
    }
}
