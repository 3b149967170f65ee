//! Subflow completion.

use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::models::{Execution, SubflowExecutionResult, TaskRunTransition};
use crate::state::StateType;

/// State reported to the parent task for a child execution that ended in
/// `child`. A FAILED child is a WARNING when failures are not transmitted.
pub fn subflow_state(child: StateType, transmit_failed: bool) -> StateType {
    match child {
        StateType::Failed if !transmit_failed => StateType::Warning,
        other => other,
    }
}

/// Result to send back to the parent once `child` is terminal.
///
/// `None` while the child is still running or when it has no parent.
pub fn subflow_result(child: &Execution) -> Option<SubflowExecutionResult> {
    let parent = child.parent.as_ref()?;
    if !child.is_terminal() {
        return None;
    }

    Some(SubflowExecutionResult {
        execution_id: parent.execution_id.clone(),
        task_run_id: parent.task_run_id.clone(),
        state: subflow_state(child.current(), parent.transmit_failed),
        outputs: child_outputs(&child.id, Some(child.current())),
    })
}

/// Outputs recorded on the parent subflow task run.
pub fn child_outputs(child_execution_id: &str, state: Option<StateType>) -> Map<String, Value> {
    let mut outputs = Map::new();
    outputs.insert(
        "executionId".to_string(),
        Value::String(child_execution_id.to_string()),
    );
    if let Some(state) = state {
        outputs.insert("state".to_string(), Value::String(state.as_str().to_string()));
    }
    outputs
}

/// Complete the subflow task run named by `result`.
///
/// Returns `None` when the run is already terminal (redelivery).
pub fn apply_subflow_result(
    execution: &Execution,
    result: &SubflowExecutionResult,
) -> CoreResult<Option<(Execution, TaskRunTransition)>> {
    let run = execution
        .find_task_run(&result.task_run_id)
        .ok_or_else(|| CoreError::UnknownTaskRun(result.task_run_id.clone()))?;

    if run.state.is_terminal() {
        return Ok(None);
    }
    if !result.state.is_terminal() {
        return Err(CoreError::Validation(format!(
            "Subflow result for '{}' carries non-terminal state {}",
            result.task_run_id, result.state
        )));
    }

    let mut updated = run.with_state(result.state)?;
    updated.outputs.extend(result.outputs.clone());

    let transition = TaskRunTransition::of(&updated);
    let execution = execution.with_task_run(updated)?;

    Ok(Some((execution, transition)))
}
