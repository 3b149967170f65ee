//! Error types for the Floe executor.
//!
//! Engine errors from `floe-core` are wrapped as they are; storage and queue
//! failures get their own variants so the loop can decide
//! whether a message is retried or dropped.

use floe_core::CoreError;
use thiserror::Error;

/// Executor-level errors.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Engine error (parse, validation, transitions)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Flow not found in the repository
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Conflict error (e.g., duplicate execution or flow revision)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Queue or messaging error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using ExecutorError.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

impl ExecutorError {
    /// Whether redelivering the message could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecutorError::Database(_) | ExecutorError::Queue(_) | ExecutorError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_not_found_error() {
        let err = ExecutorError::FlowNotFound("ns.hello".to_string());
        assert_eq!(err.to_string(), "Flow not found: ns.hello");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_core_error_is_transparent() {
        let err: ExecutorError = CoreError::UnknownTaskRun("tr-1".to_string()).into();
        assert_eq!(err.to_string(), "Unknown task run: tr-1");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_queue_error_is_transient() {
        assert!(ExecutorError::Queue("timeout".to_string()).is_transient());
    }
}
