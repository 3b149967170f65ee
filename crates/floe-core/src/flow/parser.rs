//! Flow YAML parser.
//!
//! Parses YAML flow definitions and validates the task tree:
//! - flow id and namespace are set, at least one task is declared
//! - task ids are unique over the whole tree (error handlers and branches included)
//! - error handlers are attached to flowable tasks only
//! - a subflow does not call its own flow

use std::collections::HashSet;

use crate::error::{CoreError, CoreResult};
use crate::flow::task::TaskKind;
use crate::flow::Flow;

/// Parse a YAML string into a Flow.
pub fn parse_flow(yaml_content: &str) -> CoreResult<Flow> {
    let flow: Flow =
        serde_yaml::from_str(yaml_content).map_err(|e| CoreError::Parse(e.to_string()))?;

    validate_flow(&flow)?;

    Ok(flow)
}

/// Validate a parsed flow.
pub fn validate_flow(flow: &Flow) -> CoreResult<()> {
    if flow.id.trim().is_empty() {
        return Err(CoreError::Validation("Flow id must not be empty".to_string()));
    }

    if flow.namespace.trim().is_empty() {
        return Err(CoreError::Validation(format!(
            "Flow '{}': namespace must not be empty",
            flow.id
        )));
    }

    if flow.tasks.is_empty() {
        return Err(CoreError::Validation(format!(
            "Flow '{}.{}' must declare at least one task",
            flow.namespace, flow.id
        )));
    }

    let mut seen = HashSet::new();
    for (path, task) in flow.all_tasks() {
        if !seen.insert(task.id.as_str()) {
            return Err(CoreError::Validation(format!(
                "Duplicate task id '{}' at '{}'",
                task.id, path
            )));
        }

        if !task.errors.is_empty() && !task.is_flowable() {
            return Err(CoreError::Validation(format!(
                "Task '{}': error handlers are only allowed on flowable tasks",
                path
            )));
        }

        if let TaskKind::Subflow(spec) = &task.kind {
            if spec.namespace == flow.namespace && spec.flow_id == flow.id {
                return Err(CoreError::Validation(format!(
                    "Task '{}': subflow references its own flow '{}.{}'",
                    path, flow.namespace, flow.id
                )));
            }
        }
    }

    Ok(())
}
