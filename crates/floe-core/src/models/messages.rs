//! Messages exchanged between the executor, the workers and the scheduler.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::models::execution::Execution;
use crate::models::task_run::TaskRun;
use crate::state::StateType;

/// A runnable leaf handed to the worker queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTask {
    pub execution_id: String,
    pub task_run_id: String,
    pub task_id: String,
    pub task_type: String,
    /// Task properties rendered against the run variables.
    pub rendered_context: Value,
    /// Snapshot the worker appends its transitions to.
    pub task_run: TaskRun,
}

/// A worker's updated snapshot of a leaf task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTaskResult {
    pub task_run: TaskRun,
}

impl WorkerTaskResult {
    pub fn execution_id(&self) -> &str {
        &self.task_run.execution_id
    }
}

/// Kill request for a whole execution or for one task run subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionKilled {
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_run_id: Option<String>,
}

/// Notice to workers that a running leaf was killed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerKill {
    pub execution_id: String,
    pub task_run_id: String,
}

/// Request to create the child execution of a subflow task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubflowExecution {
    pub parent_execution_id: String,
    pub parent_task_run_id: String,
    pub parent_namespace: String,
    pub parent_flow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub wait: bool,
    pub transmit_failed: bool,
}

/// Outcome of a child execution, addressed to the parent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubflowExecutionResult {
    pub execution_id: String,
    pub task_run_id: String,
    pub state: StateType,
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

/// Every message consumed by the executor loop, keyed by execution id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorMessage {
    Execution(Execution),
    WorkerTaskResult(WorkerTaskResult),
    Kill(ExecutionKilled),
    SubflowResult(SubflowExecutionResult),
}

impl ExecutorMessage {
    /// Partition key.
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Execution(execution) => &execution.id,
            Self::WorkerTaskResult(result) => result.execution_id(),
            Self::Kill(killed) => &killed.execution_id,
            Self::SubflowResult(result) => &result.execution_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execution(_) => "execution",
            Self::WorkerTaskResult(_) => "worker_task_result",
            Self::Kill(_) => "kill",
            Self::SubflowResult(_) => "subflow_result",
        }
    }
}

/// One appended transition, used for events and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunTransition {
    pub execution_id: String,
    pub namespace: String,
    pub flow_id: String,
    pub task_id: String,
    pub task_run_id: String,
    pub state: StateType,
}

impl TaskRunTransition {
    pub fn of(run: &TaskRun) -> Self {
        Self {
            execution_id: run.execution_id.clone(),
            namespace: run.namespace.clone(),
            flow_id: run.flow_id.clone(),
            task_id: run.task_id.clone(),
            task_run_id: run.id.clone(),
            state: run.current(),
        }
    }
}
