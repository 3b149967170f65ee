//! Kill propagation.

use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::flow::Flow;
use crate::models::{Execution, TaskRunTransition, WorkerKill};
use crate::state::StateType;

/// Result of a kill request.
#[derive(Debug, Clone)]
pub struct KillOutcome {
    pub execution: Execution,
    /// Notices for the killed leaf runs a worker may still be executing.
    pub worker_kills: Vec<WorkerKill>,
    pub transitions: Vec<TaskRunTransition>,
    pub changed: bool,
}

/// Kill `task_run_id` and everything below it, or the whole execution when
/// no target is given.
///
/// Terminal runs are left alone. Enclosing composites are not touched: they
/// see a KILLED child on the next pass and resolve through aggregation.
/// Child executions of subflows are not killed.
pub fn kill(flow: &Flow, execution: &Execution, task_run_id: Option<&str>) -> CoreResult<KillOutcome> {
    let mut outcome = KillOutcome {
        execution: execution.clone(),
        worker_kills: Vec::new(),
        transitions: Vec::new(),
        changed: false,
    };

    if execution.is_terminal() {
        return Ok(outcome);
    }

    let targets: Vec<String> = match task_run_id {
        Some(id) => {
            if execution.find_task_run(id).is_none() {
                return Err(CoreError::UnknownTaskRun(id.to_string()));
            }
            execution.descendants_of(id)
        }
        None => execution
            .task_run_list
            .iter()
            .map(|run| run.id.clone())
            .collect(),
    };

    let index = flow.task_index();

    for id in targets {
        let Some(run) = outcome
            .execution
            .task_run_list
            .iter_mut()
            .find(|run| run.id == id)
        else {
            continue;
        };
        if run.state.is_terminal() {
            continue;
        }

        run.state = run.state.with_state(StateType::Killed)?;
        outcome.transitions.push(TaskRunTransition::of(run));
        outcome.changed = true;

        let is_leaf = index
            .get(run.task_id.as_str())
            .is_some_and(|task| !task.is_flowable());
        if is_leaf {
            outcome.worker_kills.push(WorkerKill {
                execution_id: run.execution_id.clone(),
                task_run_id: run.id.clone(),
            });
        }
    }

    if task_run_id.is_none() {
        outcome.execution = outcome.execution.with_state(StateType::Killed)?;
        outcome.changed = true;
    }

    debug!(
        execution_id = %execution.id,
        target = ?task_run_id,
        killed = outcome.transitions.len(),
        "Kill applied"
    );

    Ok(outcome)
}
