//! Worker task generation.
//!
//! Turns a freshly created leaf task run into the payload a worker picks up:
//! the task properties rendered against the run variables.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::flow::{Flow, Task, TaskKind};
use crate::models::{Execution, TaskRun, WorkerTask};
use crate::template::ExpressionRenderer;

use super::variables::run_variables;

/// Builder for worker tasks.
pub struct WorkerTaskBuilder {
    renderer: Arc<dyn ExpressionRenderer>,
}

impl WorkerTaskBuilder {
    pub fn new(renderer: Arc<dyn ExpressionRenderer>) -> Self {
        Self { renderer }
    }

    /// Build the worker task for `task_run`.
    ///
    /// Fails with [`CoreError::Template`] when a property does not render,
    /// and with a definition error when `task` is not a runnable leaf.
    pub fn build(
        &self,
        flow: &Flow,
        execution: &Execution,
        task_run: &TaskRun,
        task: &Task,
    ) -> CoreResult<WorkerTask> {
        let TaskKind::Runnable { properties } = &task.kind else {
            return Err(CoreError::definition(
                &task.id,
                format!("'{}' is not a runnable task", task.task_type),
            ));
        };

        let variables = run_variables(flow, execution, Some(task_run), Some(task));
        let rendered_context = self
            .renderer
            .render_value(&Value::Object(properties.clone()), &variables)?;

        Ok(WorkerTask {
            execution_id: execution.id.clone(),
            task_run_id: task_run.id.clone(),
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            rendered_context,
            task_run: task_run.clone(),
        })
    }
}
