//! State aggregation.
//!
//! Maps the states of a set of children to one aggregate state. The same
//! function decides composite task runs and whole executions.

use crate::state::StateType;

/// A child state with the flags of the task that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildState {
    pub state: StateType,
    pub allow_failure: bool,
    pub allow_warning: bool,
}

impl ChildState {
    pub fn new(state: StateType) -> Self {
        Self {
            state,
            allow_failure: false,
            allow_warning: false,
        }
    }

    pub fn allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = allow;
        self
    }

    pub fn allow_warning(mut self, allow: bool) -> Self {
        self.allow_warning = allow;
        self
    }
}

/// Aggregate child states, first matching rule wins:
///
/// 1. any child non-terminal: RUNNING
/// 2. any FAILED child without `allow_failure`: FAILED
/// 3. any FAILED child with `allow_failure`, or any WARNING child without
///    `allow_warning`: WARNING
/// 4. any KILLED child: KILLED
/// 5. SUCCESS
///
/// An empty set aggregates to SUCCESS.
pub fn aggregate<I>(children: I) -> StateType
where
    I: IntoIterator<Item = ChildState>,
{
    let mut running = false;
    let mut failed = false;
    let mut warning = false;
    let mut killed = false;

    for child in children {
        match child.state {
            s if !s.is_terminal() => running = true,
            StateType::Failed if child.allow_failure => warning = true,
            StateType::Failed => failed = true,
            StateType::Warning if !child.allow_warning => warning = true,
            StateType::Killed => killed = true,
            _ => {}
        }
    }

    if running {
        StateType::Running
    } else if failed {
        StateType::Failed
    } else if warning {
        StateType::Warning
    } else if killed {
        StateType::Killed
    } else {
        StateType::Success
    }
}
