//! Flow definitions.
//!
//! A flow is an immutable, versioned task tree identified by
//! `(tenant, namespace, id, revision)`.

pub mod parser;
pub mod task;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

pub use parser::{parse_flow, validate_flow};
pub use task::{SubflowSpec, Task, TaskKind};

/// Trigger declaration. Triggers are evaluated by the scheduler; the engine
/// only carries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

/// Immutable flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Assigned by the flow repository when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default input values, overridden by the inputs of an execution.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub disabled: bool,
}

impl Flow {
    /// Unique key of this revision.
    pub fn uid(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.tenant_id.as_deref().unwrap_or("main"),
            self.namespace,
            self.id,
            self.revision.unwrap_or(0)
        )
    }

    /// Key shared by every revision of this flow.
    pub fn uid_without_revision(&self) -> String {
        format!(
            "{}_{}_{}",
            self.tenant_id.as_deref().unwrap_or("main"),
            self.namespace,
            self.id
        )
    }

    /// Every task of the tree with its dotted path, walked breadth-first
    /// with an explicit queue.
    pub fn all_tasks(&self) -> Vec<(String, &Task)> {
        let mut out = Vec::new();
        let mut queue: std::collections::VecDeque<(String, &Task)> = self
            .tasks
            .iter()
            .chain(self.errors.iter())
            .map(|t| (t.id.clone(), t))
            .collect();

        while let Some((path, task)) = queue.pop_front() {
            for child in task.declared_children() {
                queue.push_back((format!("{}.{}", path, child.id), child));
            }
            out.push((path, task));
        }

        out
    }

    /// Index from task id to task.
    pub fn task_index(&self) -> HashMap<&str, &Task> {
        self.all_tasks()
            .into_iter()
            .map(|(_, task)| (task.id.as_str(), task))
            .collect()
    }

    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        self.all_tasks()
            .into_iter()
            .find(|(_, task)| task.id == task_id)
            .map(|(_, task)| task)
    }

    /// Dotted path from the flow root to `task_id`.
    pub fn task_path(&self, task_id: &str) -> Option<String> {
        self.all_tasks()
            .into_iter()
            .find(|(_, task)| task.id == task_id)
            .map(|(path, _)| path)
    }
}
