//! Executor metrics.
//!
//! Recorded through the `metrics` facade; the binary decides which recorder
//! (if any) is installed.

use floe_core::models::{Execution, TaskRunTransition};
use floe_core::state::StateType;

pub const TASKRUN_TRANSITIONS: &str = "floe_executor_taskrun_transitions_total";
pub const EXECUTION_TRANSITIONS: &str = "floe_executor_execution_transitions_total";
pub const MESSAGES: &str = "floe_executor_messages_total";

/// What the loop did with one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The execution changed and was persisted.
    Applied,
    /// Redelivery, stale snapshot or terminal execution.
    Unchanged,
    /// Unknown execution, unknown flow, malformed or rejected payload.
    Dropped,
}

impl MessageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageOutcome::Applied => "applied",
            MessageOutcome::Unchanged => "unchanged",
            MessageOutcome::Dropped => "dropped",
        }
    }
}

pub fn record_task_run_transition(transition: &TaskRunTransition) {
    metrics::counter!(
        TASKRUN_TRANSITIONS,
        "namespace" => transition.namespace.clone(),
        "flow" => transition.flow_id.clone(),
        "task" => transition.task_id.clone(),
        "state" => transition.state.as_str()
    )
    .increment(1);
}

pub fn record_execution_transition(execution: &Execution, state: StateType) {
    metrics::counter!(
        EXECUTION_TRANSITIONS,
        "namespace" => execution.namespace.clone(),
        "flow" => execution.flow_id.clone(),
        "state" => state.as_str()
    )
    .increment(1);
}

pub fn record_message(kind: &'static str, outcome: MessageOutcome) {
    metrics::counter!(
        MESSAGES,
        "kind" => kind,
        "outcome" => outcome.as_str()
    )
    .increment(1);
}
