//! Error types for the Floe core library.
//!
//! Every fallible operation of the flow model, the state machine and the
//! reconciliation pass reports one of these variants. None of them is fatal
//! to the engine: callers turn them into FAILED task runs or log and drop the
//! offending message.

use thiserror::Error;

use crate::state::StateType;

/// Core-level errors.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Flow source could not be parsed (YAML, JSON, etc.)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Flow definition is malformed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Task tree cannot be resolved at runtime (missing switch branch, unknown task id)
    #[error("Definition error at '{path}': {message}")]
    Definition { path: String, message: String },

    /// Expression rendering failed
    #[error("Template error: {0}")]
    Template(String),

    /// A state append is not reachable from the current head
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: StateType, to: StateType },

    /// The same terminal state was appended twice
    #[error("State is already terminal ({0})")]
    AlreadyTerminal(StateType),

    /// A task run referenced by a message does not exist
    #[error("Unknown task run: {0}")]
    UnknownTaskRun(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn definition(path: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Definition {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether this error means the message was already applied.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, CoreError::AlreadyTerminal(_))
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = CoreError::InvalidTransition {
            from: StateType::Success,
            to: StateType::Running,
        };
        assert_eq!(err.to_string(), "Invalid transition from SUCCESS to RUNNING");
        assert!(!err.is_duplicate());
    }

    #[test]
    fn test_definition_error() {
        let err = CoreError::definition("root.choice", "no case matches 'X' and no defaults");
        assert_eq!(
            err.to_string(),
            "Definition error at 'root.choice': no case matches 'X' and no defaults"
        );
    }

    #[test]
    fn test_already_terminal_is_duplicate() {
        assert!(CoreError::AlreadyTerminal(StateType::Failed).is_duplicate());
    }
}
