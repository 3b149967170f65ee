//! Executions: one run of a flow.
//!
//! An execution owns the growing list of its task runs. The list keeps
//! creation order; updates replace a run in place by id so the order stays
//! usable for tie-breaks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::flow::Flow;
use crate::models::task_run::TaskRun;
use crate::state::{State, StateType};

/// Link from a child execution to the subflow task that spawned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentExecution {
    pub execution_id: String,
    pub task_run_id: String,
    pub namespace: String,
    pub flow_id: String,
    /// The parent task waits for this execution to end.
    pub wait: bool,
    pub transmit_failed: bool,
}

/// One run of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub namespace: String,
    pub flow_id: String,
    /// Pinned at creation.
    pub flow_revision: u32,
    pub state: State,
    #[serde(default)]
    pub task_run_list: Vec<TaskRun>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentExecution>,
}

/// Result of merging a task run snapshot into an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The snapshot was newer and replaced the stored run.
    Applied(Box<Execution>),
    /// The snapshot was a redelivery or stale; nothing changed.
    Unchanged,
}

impl Execution {
    /// New CREATED execution of `flow`; `inputs` override the flow defaults.
    pub fn new(flow: &Flow, inputs: Map<String, Value>) -> Self {
        let mut merged = flow.inputs.clone();
        merged.extend(inputs);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: flow.tenant_id.clone(),
            namespace: flow.namespace.clone(),
            flow_id: flow.id.clone(),
            flow_revision: flow.revision.unwrap_or(1),
            state: State::new(),
            task_run_list: Vec::new(),
            inputs: merged,
            variables: flow.variables.clone(),
            labels: flow.labels.clone(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: ParentExecution) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn current(&self) -> StateType {
        self.state.current()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Copy of this execution with `next` appended to its own history.
    pub fn with_state(&self, next: StateType) -> CoreResult<Self> {
        let mut execution = self.clone();
        execution.state = self.state.with_state(next)?;
        Ok(execution)
    }

    pub fn find_task_run(&self, id: &str) -> Option<&TaskRun> {
        self.task_run_list.iter().find(|run| run.id == id)
    }

    /// Direct children of `parent` (`None` = top level), in creation order.
    pub fn children_of<'a>(&'a self, parent: Option<&'a str>) -> impl Iterator<Item = &'a TaskRun> {
        self.task_run_list
            .iter()
            .filter(move |run| run.parent_task_run_id.as_deref() == parent)
    }

    /// Ids of `root` and every run below it.
    pub fn descendants_of(&self, root: &str) -> Vec<String> {
        let mut out = vec![root.to_string()];
        let mut cursor = 0;
        while cursor < out.len() {
            let current = out[cursor].clone();
            out.extend(
                self.children_of(Some(current.as_str()))
                    .map(|run| run.id.clone()),
            );
            cursor += 1;
        }
        out
    }

    /// Copy with `task_run` replacing the stored run with the same id.
    pub fn with_task_run(&self, task_run: TaskRun) -> CoreResult<Self> {
        let position = self
            .task_run_list
            .iter()
            .position(|run| run.id == task_run.id)
            .ok_or_else(|| CoreError::UnknownTaskRun(task_run.id.clone()))?;

        let mut execution = self.clone();
        execution.task_run_list[position] = task_run;
        Ok(execution)
    }

    /// Merge a worker snapshot of a task run.
    ///
    /// The snapshot is applied only when its history strictly extends the
    /// stored one and every appended step is a valid transition. Redeliveries
    /// and stale snapshots are [`MergeOutcome::Unchanged`].
    pub fn merge_task_run(&self, incoming: &TaskRun) -> CoreResult<MergeOutcome> {
        let stored = self
            .find_task_run(&incoming.id)
            .ok_or_else(|| CoreError::UnknownTaskRun(incoming.id.clone()))?;

        if stored.task_id != incoming.task_id
            || stored.parent_task_run_id != incoming.parent_task_run_id
            || stored.value != incoming.value
        {
            return Err(CoreError::Validation(format!(
                "Task run '{}' identity mismatch ({} vs {})",
                incoming.id,
                stored.uid(),
                incoming.uid()
            )));
        }

        if stored.state.is_terminal() {
            return Ok(MergeOutcome::Unchanged);
        }

        if !incoming.state.extends(&stored.state) {
            let stored_len = stored.state.histories().len();
            let incoming_len = incoming.state.histories().len();
            let same_prefix = incoming
                .state
                .histories()
                .iter()
                .zip(stored.state.histories().iter())
                .all(|(a, b)| a.state == b.state);

            if incoming_len <= stored_len && same_prefix {
                return Ok(MergeOutcome::Unchanged);
            }

            return Err(CoreError::InvalidTransition {
                from: stored.current(),
                to: incoming.current(),
            });
        }

        incoming.state.validate()?;

        let merged = self.with_task_run(incoming.clone())?;
        Ok(MergeOutcome::Applied(Box::new(merged)))
    }

    /// Outputs of every run keyed by task id; each-block instantiations are
    /// nested under their value.
    pub fn outputs(&self) -> Map<String, Value> {
        let mut outputs = Map::new();

        for run in &self.task_run_list {
            if run.outputs.is_empty() {
                continue;
            }
            let current = Value::Object(run.outputs.clone());
            match &run.value {
                Some(value) => {
                    let entry = outputs
                        .entry(run.task_id.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(map) = entry {
                        map.insert(value.clone(), current);
                    }
                }
                None => {
                    outputs.insert(run.task_id.clone(), current);
                }
            }
        }

        outputs
    }
}
