//! Task tree definitions.
//!
//! A task is either a Runnable leaf (executed by a worker) or a Flowable
//! composite that owns child tasks and decides how they are scheduled:
//! - `sequential`: children one after the other
//! - `parallel`: children at once, bounded by `concurrency`
//! - `each_sequential` / `each_parallel`: child subtree once per value
//! - `switch`: one branch selected by a rendered value
//! - `if`: `then` or `else` depending on a rendered condition
//! - `subflow`: spawn another flow as a child execution
//!
//! Any other `type` is treated as a Runnable leaf and its extra keys are kept
//! as `properties`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::CoreError;

pub const SEQUENTIAL: &str = "sequential";
pub const PARALLEL: &str = "parallel";
pub const EACH_SEQUENTIAL: &str = "each_sequential";
pub const EACH_PARALLEL: &str = "each_parallel";
pub const SWITCH: &str = "switch";
pub const IF: &str = "if";
pub const SUBFLOW: &str = "subflow";

/// A node of the task tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTask", into = "RawTask")]
pub struct Task {
    pub id: String,
    /// The `type` tag as written in the flow.
    pub task_type: String,
    pub description: Option<String>,
    /// Error handlers scoped to this task.
    pub errors: Vec<Task>,
    /// A failure of this task is reported as WARNING to its parent.
    pub allow_failure: bool,
    /// A warning of this task is reported as SUCCESS to its parent.
    pub allow_warning: bool,
    /// Still run inside a sequential block after a sibling failed.
    pub always_run: bool,
    pub disabled: bool,
    pub kind: TaskKind,
}

/// Capability-specific part of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    Runnable {
        properties: Map<String, Value>,
    },
    Sequential {
        tasks: Vec<Task>,
    },
    Parallel {
        tasks: Vec<Task>,
        concurrency: usize,
    },
    EachSequential {
        value: Value,
        tasks: Vec<Task>,
    },
    EachParallel {
        value: Value,
        tasks: Vec<Task>,
        concurrency: usize,
    },
    Switch {
        value: String,
        cases: BTreeMap<String, Vec<Task>>,
        defaults: Vec<Task>,
    },
    If {
        condition: String,
        then: Vec<Task>,
        /// May be empty; a false condition then ends the block at once.
        else_: Vec<Task>,
    },
    Subflow(SubflowSpec),
}

/// Reference to the flow a subflow task spawns.
#[derive(Debug, Clone, PartialEq)]
pub struct SubflowSpec {
    pub namespace: String,
    pub flow_id: String,
    /// Latest revision when absent.
    pub revision: Option<u32>,
    pub inputs: Map<String, Value>,
    pub wait: bool,
    pub transmit_failed: bool,
}

impl Task {
    pub fn is_flowable(&self) -> bool {
        !matches!(self.kind, TaskKind::Runnable { .. })
    }

    pub fn is_subflow(&self) -> bool {
        matches!(self.kind, TaskKind::Subflow(_))
    }

    /// Every task declared directly under this one (branches, defaults and
    /// error handlers included), in declaration order.
    pub fn declared_children(&self) -> Vec<&Task> {
        let mut children: Vec<&Task> = match &self.kind {
            TaskKind::Runnable { .. } | TaskKind::Subflow(_) => Vec::new(),
            TaskKind::Sequential { tasks }
            | TaskKind::Parallel { tasks, .. }
            | TaskKind::EachSequential { tasks, .. }
            | TaskKind::EachParallel { tasks, .. } => tasks.iter().collect(),
            TaskKind::Switch {
                cases, defaults, ..
            } => cases.values().flatten().chain(defaults.iter()).collect(),
            TaskKind::If { then, else_, .. } => then.iter().chain(else_.iter()).collect(),
        };
        children.extend(self.errors.iter());
        children
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Wire shape of a task, shared by every kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTask {
    id: String,
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    errors: Vec<Task>,
    #[serde(default, skip_serializing_if = "is_false")]
    allow_failure: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    allow_warning: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    always_run: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    disabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cases: Option<BTreeMap<String, Vec<Task>>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    defaults: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    then: Vec<Task>,
    #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
    else_: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inputs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wait: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transmit_failed: Option<bool>,
    #[serde(flatten)]
    properties: Map<String, Value>,
}

impl RawTask {
    fn require_tasks(&self) -> Result<Vec<Task>, CoreError> {
        if self.tasks.is_empty() {
            return Err(CoreError::Validation(format!(
                "Task '{}': '{}' requires a non-empty 'tasks' list",
                self.id, self.task_type
            )));
        }
        Ok(self.tasks.clone())
    }

    fn require_value(&self) -> Result<Value, CoreError> {
        match &self.value {
            Some(v @ (Value::String(_) | Value::Array(_))) => Ok(v.clone()),
            Some(_) => Err(CoreError::Validation(format!(
                "Task '{}': 'value' must be a list or an expression",
                self.id
            ))),
            None => Err(CoreError::Validation(format!(
                "Task '{}': '{}' requires a 'value'",
                self.id, self.task_type
            ))),
        }
    }
}

impl TryFrom<RawTask> for Task {
    type Error = CoreError;

    fn try_from(raw: RawTask) -> Result<Self, Self::Error> {
        if raw.id.trim().is_empty() {
            return Err(CoreError::Validation("Task id must not be empty".to_string()));
        }

        let kind = match raw.task_type.as_str() {
            SEQUENTIAL => TaskKind::Sequential {
                tasks: raw.require_tasks()?,
            },
            PARALLEL => TaskKind::Parallel {
                tasks: raw.require_tasks()?,
                concurrency: raw.concurrency.unwrap_or(0),
            },
            EACH_SEQUENTIAL => TaskKind::EachSequential {
                value: raw.require_value()?,
                tasks: raw.require_tasks()?,
            },
            EACH_PARALLEL => TaskKind::EachParallel {
                value: raw.require_value()?,
                tasks: raw.require_tasks()?,
                concurrency: raw.concurrency.unwrap_or(0),
            },
            SWITCH => {
                let value = match &raw.value {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    Some(Value::Bool(b)) => b.to_string(),
                    _ => {
                        return Err(CoreError::Validation(format!(
                            "Task '{}': switch requires a scalar 'value'",
                            raw.id
                        )))
                    }
                };
                let cases = raw.cases.clone().unwrap_or_default();
                if cases.is_empty() && raw.defaults.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "Task '{}': switch requires 'cases' or 'defaults'",
                        raw.id
                    )));
                }
                TaskKind::Switch {
                    value,
                    cases,
                    defaults: raw.defaults.clone(),
                }
            }
            IF => {
                let condition = match &raw.condition {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Bool(b)) => b.to_string(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => {
                        return Err(CoreError::Validation(format!(
                            "Task '{}': if requires a scalar 'condition'",
                            raw.id
                        )))
                    }
                };
                if raw.then.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "Task '{}': if requires a non-empty 'then' list",
                        raw.id
                    )));
                }
                TaskKind::If {
                    condition,
                    then: raw.then.clone(),
                    else_: raw.else_.clone(),
                }
            }
            SUBFLOW => {
                let namespace = raw.namespace.clone().ok_or_else(|| {
                    CoreError::Validation(format!("Task '{}': subflow requires 'namespace'", raw.id))
                })?;
                let flow_id = raw.flow_id.clone().ok_or_else(|| {
                    CoreError::Validation(format!("Task '{}': subflow requires 'flowId'", raw.id))
                })?;
                TaskKind::Subflow(SubflowSpec {
                    namespace,
                    flow_id,
                    revision: raw.revision,
                    inputs: raw.inputs.clone().unwrap_or_default(),
                    wait: raw.wait.unwrap_or(true),
                    transmit_failed: raw.transmit_failed.unwrap_or(true),
                })
            }
            _ => {
                if !raw.tasks.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "Task '{}': runnable type '{}' cannot declare child tasks",
                        raw.id, raw.task_type
                    )));
                }
                // keys that only mean something on flowables stay leaf properties
                let mut properties = raw.properties.clone();
                if let Some(v) = &raw.value {
                    properties.insert("value".to_string(), v.clone());
                }
                if let Some(v) = &raw.condition {
                    properties.insert("condition".to_string(), v.clone());
                }
                if let Some(v) = &raw.namespace {
                    properties.insert("namespace".to_string(), Value::String(v.clone()));
                }
                if let Some(v) = &raw.inputs {
                    properties.insert("inputs".to_string(), Value::Object(v.clone()));
                }
                if let Some(v) = raw.concurrency {
                    properties.insert("concurrency".to_string(), Value::from(v));
                }
                TaskKind::Runnable { properties }
            }
        };

        Ok(Task {
            id: raw.id,
            task_type: raw.task_type,
            description: raw.description,
            errors: raw.errors,
            allow_failure: raw.allow_failure,
            allow_warning: raw.allow_warning,
            always_run: raw.always_run,
            disabled: raw.disabled,
            kind,
        })
    }
}

impl From<Task> for RawTask {
    fn from(task: Task) -> Self {
        let mut raw = RawTask {
            id: task.id,
            task_type: task.task_type,
            description: task.description,
            errors: task.errors,
            allow_failure: task.allow_failure,
            allow_warning: task.allow_warning,
            always_run: task.always_run,
            disabled: task.disabled,
            tasks: Vec::new(),
            concurrency: None,
            value: None,
            cases: None,
            defaults: Vec::new(),
            condition: None,
            then: Vec::new(),
            else_: Vec::new(),
            namespace: None,
            flow_id: None,
            revision: None,
            inputs: None,
            wait: None,
            transmit_failed: None,
            properties: Map::new(),
        };

        match task.kind {
            TaskKind::Runnable { properties } => raw.properties = properties,
            TaskKind::Sequential { tasks } => raw.tasks = tasks,
            TaskKind::Parallel { tasks, concurrency } => {
                raw.tasks = tasks;
                raw.concurrency = Some(concurrency);
            }
            TaskKind::EachSequential { value, tasks } => {
                raw.value = Some(value);
                raw.tasks = tasks;
            }
            TaskKind::EachParallel {
                value,
                tasks,
                concurrency,
            } => {
                raw.value = Some(value);
                raw.tasks = tasks;
                raw.concurrency = Some(concurrency);
            }
            TaskKind::Switch {
                value,
                cases,
                defaults,
            } => {
                raw.value = Some(Value::String(value));
                raw.cases = Some(cases);
                raw.defaults = defaults;
            }
            TaskKind::If {
                condition,
                then,
                else_,
            } => {
                raw.condition = Some(Value::String(condition));
                raw.then = then;
                raw.else_ = else_;
            }
            TaskKind::Subflow(spec) => {
                raw.namespace = Some(spec.namespace);
                raw.flow_id = Some(spec.flow_id);
                raw.revision = spec.revision;
                raw.inputs = Some(spec.inputs);
                raw.wait = Some(spec.wait);
                raw.transmit_failed = Some(spec.transmit_failed);
            }
        }

        raw
    }
}
