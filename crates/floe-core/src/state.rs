//! Task run and execution state machine.
//!
//! A [`State`] is an append-only history of [`StateType`] entries. The head
//! of the history is the current type; appends are checked against the
//! transition graph:
//!
//! - `CREATED -> RUNNING`
//! - `RUNNING -> RETRYING | SUCCESS | WARNING | FAILED`
//! - `RETRYING -> RUNNING`, `RESTARTED -> RUNNING`
//! - any non-terminal type `-> KILLED`

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Type of a state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    /// Instantiated, not started yet.
    Created,
    /// Started by a worker or by the executor (flowable tasks).
    Running,
    /// A retryable leaf is waiting for its next attempt.
    Retrying,
    /// Restarted after a previous terminal outcome.
    Restarted,
    /// Completed successfully.
    Success,
    /// Completed with warnings (or an allowed failure).
    Warning,
    /// Completed with a failure.
    Failed,
    /// Cancelled.
    Killed,
}

impl StateType {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Warning | Self::Failed | Self::Killed
        )
    }

    pub fn is_created(&self) -> bool {
        *self == Self::Created
    }

    pub fn is_failed(&self) -> bool {
        *self == Self::Failed
    }

    /// Whether `next` may be appended after `self`.
    pub fn can_transition_to(&self, next: StateType) -> bool {
        if self.is_terminal() {
            return false;
        }

        matches!(
            (self, next),
            (_, Self::Killed)
                | (Self::Created, Self::Running)
                | (
                    Self::Running,
                    Self::Retrying | Self::Success | Self::Warning | Self::Failed
                )
                | (Self::Retrying, Self::Running)
                | (Self::Restarted, Self::Running)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Retrying => "RETRYING",
            Self::Restarted => "RESTARTED",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        }
    }
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StateType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CREATED" => Ok(Self::Created),
            "RUNNING" => Ok(Self::Running),
            "RETRYING" => Ok(Self::Retrying),
            "RESTARTED" => Ok(Self::Restarted),
            "SUCCESS" => Ok(Self::Success),
            "WARNING" => Ok(Self::Warning),
            "FAILED" => Ok(Self::Failed),
            "KILLED" => Ok(Self::Killed),
            other => Err(CoreError::Parse(format!("Unknown state type: {}", other))),
        }
    }
}

/// One entry of a state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub state: StateType,
    pub date: DateTime<Utc>,
}

/// Append-only state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    current: StateType,
    histories: Vec<History>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// A fresh history holding a single CREATED entry.
    pub fn new() -> Self {
        Self {
            current: StateType::Created,
            histories: vec![History {
                state: StateType::Created,
                date: Utc::now(),
            }],
        }
    }

    /// Rebuild a state from a list of types, validating every step.
    pub fn from_types(types: &[StateType]) -> CoreResult<Self> {
        let mut state = Self::new();
        let mut iter = types.iter();
        match iter.next() {
            Some(StateType::Created) => {}
            Some(other) => {
                return Err(CoreError::InvalidTransition {
                    from: StateType::Created,
                    to: *other,
                })
            }
            None => return Ok(state),
        }
        for next in iter {
            state = state.with_state(*next)?;
        }
        Ok(state)
    }

    pub fn current(&self) -> StateType {
        self.current
    }

    pub fn histories(&self) -> &[History] {
        &self.histories
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn is_created(&self) -> bool {
        self.current.is_created()
    }

    pub fn is_failed(&self) -> bool {
        self.current.is_failed()
    }

    /// Return a new state with `next` appended.
    ///
    /// Appending the current terminal type again yields
    /// [`CoreError::AlreadyTerminal`]; any other unreachable append yields
    /// [`CoreError::InvalidTransition`].
    pub fn with_state(&self, next: StateType) -> CoreResult<Self> {
        if self.current.is_terminal() && self.current == next {
            return Err(CoreError::AlreadyTerminal(next));
        }
        if !self.current.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.current,
                to: next,
            });
        }

        let mut histories = self.histories.clone();
        histories.push(History {
            state: next,
            date: Utc::now(),
        });

        Ok(Self {
            current: next,
            histories,
        })
    }

    /// Check that this history is internally consistent: starts at CREATED,
    /// every step is allowed and `current` matches the head.
    pub fn validate(&self) -> CoreResult<()> {
        let mut iter = self.histories.iter();
        let mut previous = match iter.next() {
            Some(first) if first.state == StateType::Created => StateType::Created,
            Some(first) => {
                return Err(CoreError::InvalidTransition {
                    from: StateType::Created,
                    to: first.state,
                })
            }
            None => return Err(CoreError::Validation("empty state history".to_string())),
        };

        for entry in iter {
            if !previous.can_transition_to(entry.state) {
                return Err(CoreError::InvalidTransition {
                    from: previous,
                    to: entry.state,
                });
            }
            previous = entry.state;
        }

        if previous != self.current {
            return Err(CoreError::Validation(format!(
                "state head {} does not match current {}",
                previous, self.current
            )));
        }

        Ok(())
    }

    /// Whether `self` is a strict continuation of `base` (same leading types,
    /// longer history).
    pub fn extends(&self, base: &State) -> bool {
        self.histories.len() > base.histories.len()
            && base
                .histories
                .iter()
                .zip(self.histories.iter())
                .all(|(a, b)| a.state == b.state)
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.histories
            .first()
            .map(|h| h.date)
            .unwrap_or_else(Utc::now)
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        if self.is_terminal() {
            self.histories.last().map(|h| h.date)
        } else {
            None
        }
    }

    pub fn duration(&self) -> Duration {
        self.end_date().unwrap_or_else(Utc::now) - self.start_date()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_created() {
        let state = State::new();
        assert_eq!(state.current(), StateType::Created);
        assert_eq!(state.histories().len(), 1);
        assert!(state.end_date().is_none());
    }

    #[test]
    fn test_nominal_path() {
        let state = State::new()
            .with_state(StateType::Running)
            .unwrap()
            .with_state(StateType::Success)
            .unwrap();

        assert!(state.is_terminal());
        assert_eq!(state.histories().len(), 3);
        assert!(state.end_date().is_some());
        state.validate().unwrap();
    }

    #[test]
    fn test_retrying_loop() {
        let state = State::from_types(&[
            StateType::Created,
            StateType::Running,
            StateType::Retrying,
            StateType::Running,
            StateType::Failed,
        ])
        .unwrap();
        assert_eq!(state.current(), StateType::Failed);
    }

    #[test]
    fn test_created_cannot_jump_to_success() {
        let err = State::new().with_state(StateType::Success).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidTransition {
                from: StateType::Created,
                to: StateType::Success
            }
        ));
    }

    #[test]
    fn test_any_non_terminal_can_be_killed() {
        for from in [
            StateType::Created,
            StateType::Running,
            StateType::Retrying,
            StateType::Restarted,
        ] {
            assert!(from.can_transition_to(StateType::Killed), "{from}");
        }
        assert!(!StateType::Success.can_transition_to(StateType::Killed));
    }

    #[test]
    fn test_terminal_is_immutable() {
        let state = State::from_types(&[StateType::Created, StateType::Running, StateType::Failed])
            .unwrap();

        assert!(state.with_state(StateType::Failed).unwrap_err().is_duplicate());
        assert!(matches!(
            state.with_state(StateType::Running),
            Err(CoreError::InvalidTransition { .. })
        ));
        // the original history is untouched by failed appends
        assert_eq!(state.histories().len(), 3);
    }

    #[test]
    fn test_extends() {
        let base = State::new().with_state(StateType::Running).unwrap();
        let next = base.with_state(StateType::Success).unwrap();
        assert!(next.extends(&base));
        assert!(!base.extends(&next));
        assert!(!base.extends(&base));

        let other = State::new().with_state(StateType::Killed).unwrap();
        assert!(!next.extends(&other));
    }

    #[test]
    fn test_validate_rejects_tampered_history() {
        let json = serde_json::json!({
            "current": "SUCCESS",
            "histories": [
                {"state": "CREATED", "date": "2024-01-01T00:00:00Z"},
                {"state": "SUCCESS", "date": "2024-01-01T00:00:01Z"}
            ]
        });
        let state: State = serde_json::from_value(json).unwrap();
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_state_type_serde() {
        let json = serde_json::to_string(&StateType::Warning).unwrap();
        assert_eq!(json, "\"WARNING\"");
        let parsed: StateType = "killed".parse().unwrap();
        assert_eq!(parsed, StateType::Killed);
    }
}
