//! Task runs: one instance of a task within one execution.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreResult;
use crate::state::{State, StateType};

/// One attempt of a retryable leaf, reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunAttempt {
    pub state: State,
}

/// One instance of a task within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub id: String,
    pub execution_id: String,
    pub namespace: String,
    pub flow_id: String,
    pub task_id: String,
    /// `None` only for top-level task runs (and top-level error handlers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_run_id: Option<String>,
    /// Set only on each-block instantiations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub state: State,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<TaskRunAttempt>,
}

impl TaskRun {
    pub fn new(
        execution_id: &str,
        namespace: &str,
        flow_id: &str,
        task_id: &str,
        parent_task_run_id: Option<&str>,
        value: Option<&str>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            namespace: namespace.to_string(),
            flow_id: flow_id.to_string(),
            task_id: task_id.to_string(),
            parent_task_run_id: parent_task_run_id.map(str::to_string),
            value: value.map(str::to_string),
            state: State::new(),
            outputs: Map::new(),
            attempts: Vec::new(),
        }
    }

    /// Addressable name: `taskId` or `taskId_value`.
    pub fn uid(&self) -> String {
        match &self.value {
            Some(value) => format!("{}_{}", self.task_id, value),
            None => self.task_id.clone(),
        }
    }

    pub fn current(&self) -> StateType {
        self.state.current()
    }

    /// Copy of this run with `next` appended to its history.
    pub fn with_state(&self, next: StateType) -> CoreResult<Self> {
        let mut run = self.clone();
        run.state = self.state.with_state(next)?;
        Ok(run)
    }

    /// Whether this run instantiates `task_id` under `parent` with `value`.
    pub fn is_for(&self, task_id: &str, parent: Option<&str>, value: Option<&str>) -> bool {
        self.task_id == task_id
            && self.parent_task_run_id.as_deref() == parent
            && (value.is_none() || self.value.as_deref() == value)
    }
}
