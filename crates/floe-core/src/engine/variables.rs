//! Run variables exposed to expressions.

use serde_json::{json, Map, Value};

use crate::flow::{Flow, Task};
use crate::models::{Execution, TaskRun};

/// Variables visible while rendering for `task_run` (or for the execution
/// when `task_run` is `None`):
/// `flow`, `execution`, `inputs`, `variables`, `outputs`, `taskrun`,
/// `parent`, `parents` and `task`.
pub fn run_variables(
    flow: &Flow,
    execution: &Execution,
    task_run: Option<&TaskRun>,
    task: Option<&Task>,
) -> Map<String, Value> {
    let mut vars = Map::new();

    vars.insert(
        "flow".to_string(),
        json!({
            "id": flow.id,
            "namespace": flow.namespace,
            "revision": execution.flow_revision,
            "tenantId": flow.tenant_id,
        }),
    );
    vars.insert(
        "execution".to_string(),
        json!({
            "id": execution.id,
            "startDate": execution.state.start_date(),
            "state": execution.current(),
            "labels": execution.labels,
        }),
    );
    vars.insert("inputs".to_string(), Value::Object(execution.inputs.clone()));

    let mut variables = flow.variables.clone();
    variables.extend(execution.variables.clone());
    vars.insert("variables".to_string(), Value::Object(variables));
    vars.insert("outputs".to_string(), Value::Object(execution.outputs()));

    if let Some(run) = task_run {
        vars.insert(
            "taskrun".to_string(),
            json!({
                "id": run.id,
                "value": run.value,
                "parentId": run.parent_task_run_id,
                "startDate": run.state.start_date(),
            }),
        );

        let parents = parent_chain(execution, run);
        if let Some(first) = parents.first() {
            vars.insert("parent".to_string(), first.clone());
        }
        vars.insert("parents".to_string(), Value::Array(parents));
    }

    if let Some(task) = task {
        vars.insert(
            "task".to_string(),
            json!({ "id": task.id, "type": task.task_type }),
        );
    }

    vars
}

/// Enclosing task runs, nearest first.
fn parent_chain(execution: &Execution, run: &TaskRun) -> Vec<Value> {
    let mut parents = Vec::new();
    let mut cursor = run.parent_task_run_id.as_deref();

    while let Some(id) = cursor {
        let Some(parent) = execution.find_task_run(id) else {
            break;
        };
        parents.push(json!({
            "taskrun": {"id": parent.id, "value": parent.value},
            "outputs": parent.outputs,
        }));
        cursor = parent.parent_task_run_id.as_deref();
    }

    parents
}
