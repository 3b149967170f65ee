//! Task resolver.
//!
//! A [`Scope`] is the list of children a composite node (or the flow root)
//! schedules, with its error handlers and its ordering. Resolving a scope
//! against the current execution yields one [`ScopeDecision`]:
//! - `Next`: task runs to create now
//! - `Wait`: children are still running
//! - `Done`: the scope reached its aggregate terminal state
//!
//! Normal children run until one fails (without `allowFailure`) or is
//! killed. From then on only `alwaysRun` children are still created. Once the
//! normal children are all terminal and aggregate to FAILED, the error
//! handlers run one after the other; the scope then ends FAILED whatever
//! their outcome.

use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::{CoreError, CoreResult};
use crate::flow::{Flow, Task, TaskKind};
use crate::models::{Execution, TaskRun};
use crate::state::StateType;
use crate::template::{contains_template_syntax, ExpressionRenderer};

use super::aggregate::{aggregate, ChildState};

/// A task bound to the parent run and value it will be instantiated with.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTask<'f> {
    pub task: &'f Task,
    pub parent_task_run_id: Option<String>,
    pub value: Option<String>,
}

impl<'f> ResolvedTask<'f> {
    /// Resolve `tasks` under `parent`; children inherit the parent's value.
    /// Disabled tasks are left out.
    pub fn of(tasks: &'f [Task], parent: Option<&TaskRun>) -> Vec<Self> {
        tasks
            .iter()
            .filter(|task| !task.disabled)
            .map(|task| ResolvedTask {
                task,
                parent_task_run_id: parent.map(|p| p.id.clone()),
                value: parent.and_then(|p| p.value.clone()),
            })
            .collect()
    }

    /// Resolve `tasks` once per value, value-major.
    pub fn each(tasks: &'f [Task], parent: &TaskRun, values: &[String]) -> Vec<Self> {
        values
            .iter()
            .flat_map(|value| {
                tasks
                    .iter()
                    .filter(|task| !task.disabled)
                    .map(move |task| ResolvedTask {
                        task,
                        parent_task_run_id: Some(parent.id.clone()),
                        value: Some(value.clone()),
                    })
            })
            .collect()
    }

    fn find_run<'e>(&self, children: &[&'e TaskRun]) -> Option<&'e TaskRun> {
        children.iter().copied().find(|run| {
            run.is_for(
                &self.task.id,
                self.parent_task_run_id.as_deref(),
                self.value.as_deref(),
            )
        })
    }

    fn child_state(&self, run: &TaskRun) -> ChildState {
        ChildState::new(run.current())
            .allow_failure(self.task.allow_failure)
            .allow_warning(self.task.allow_warning)
    }
}

/// How the children of a scope are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    Sequential,
    /// `concurrency == 0` means unbounded.
    Parallel { concurrency: usize },
}

/// What a scope wants after looking at its children.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeDecision<'f> {
    Next(Vec<ResolvedTask<'f>>),
    Wait,
    Done(StateType),
}

/// Children and error handlers of one composite node.
#[derive(Debug, Clone)]
pub struct Scope<'f> {
    pub parent_task_run_id: Option<String>,
    pub ordering: Ordering,
    pub tasks: Vec<ResolvedTask<'f>>,
    pub errors: Vec<ResolvedTask<'f>>,
    /// Outputs to record on the composite run on first resolution.
    pub outputs: Option<Map<String, Value>>,
}

impl<'f> Scope<'f> {
    /// The flow root: top-level tasks in sequence with the flow's error handlers.
    pub fn root(flow: &'f Flow) -> Self {
        Self {
            parent_task_run_id: None,
            ordering: Ordering::Sequential,
            tasks: ResolvedTask::of(&flow.tasks, None),
            errors: ResolvedTask::of(&flow.errors, None),
            outputs: None,
        }
    }

    /// The scope of a RUNNING flowable task run.
    ///
    /// Each-block values, switch selections and if conditions are rendered
    /// once and stored in the run outputs; later passes reuse them.
    pub fn for_task_run(
        task: &'f Task,
        run: &TaskRun,
        renderer: &dyn ExpressionRenderer,
        variables: &Map<String, Value>,
    ) -> CoreResult<Self> {
        let errors = ResolvedTask::of(&task.errors, Some(run));
        let mut outputs = None;

        let (ordering, tasks) = match &task.kind {
            TaskKind::Sequential { tasks } => (Ordering::Sequential, ResolvedTask::of(tasks, Some(run))),
            TaskKind::Parallel { tasks, concurrency } => (
                Ordering::Parallel {
                    concurrency: *concurrency,
                },
                ResolvedTask::of(tasks, Some(run)),
            ),
            TaskKind::EachSequential { value, tasks } => {
                let values = each_values(value, run, renderer, variables, &mut outputs)?;
                (Ordering::Sequential, ResolvedTask::each(tasks, run, &values))
            }
            TaskKind::EachParallel {
                value,
                tasks,
                concurrency,
            } => {
                let values = each_values(value, run, renderer, variables, &mut outputs)?;
                (
                    Ordering::Parallel {
                        concurrency: *concurrency,
                    },
                    ResolvedTask::each(tasks, run, &values),
                )
            }
            TaskKind::Switch {
                value,
                cases,
                defaults,
            } => {
                let selected = match run.outputs.get("value").and_then(Value::as_str) {
                    Some(stored) => stored.to_string(),
                    None => renderer.render(value, variables)?.trim().to_string(),
                };

                let (branch, is_default) = match cases.get(&selected) {
                    Some(branch) => (branch, false),
                    None if !defaults.is_empty() => (defaults, true),
                    None => {
                        return Err(CoreError::definition(
                            &task.id,
                            format!("no case matches '{}' and no defaults are declared", selected),
                        ))
                    }
                };

                if !run.outputs.contains_key("value") {
                    let mut switch_outputs = Map::new();
                    switch_outputs.insert("value".to_string(), Value::String(selected));
                    switch_outputs.insert("defaults".to_string(), Value::Bool(is_default));
                    outputs = Some(switch_outputs);
                }

                (Ordering::Sequential, ResolvedTask::of(branch, Some(run)))
            }
            TaskKind::If {
                condition,
                then,
                else_,
            } => {
                let holds = match run.outputs.get("condition").and_then(Value::as_bool) {
                    Some(stored) => stored,
                    None => {
                        let rendered = if contains_template_syntax(condition) {
                            renderer.render(condition, variables)?
                        } else {
                            condition.clone()
                        };
                        let holds = is_truthy(&rendered);
                        let mut if_outputs = Map::new();
                        if_outputs.insert("condition".to_string(), Value::Bool(holds));
                        outputs = Some(if_outputs);
                        holds
                    }
                };

                let branch = if holds { then } else { else_ };
                (Ordering::Sequential, ResolvedTask::of(branch, Some(run)))
            }
            TaskKind::Runnable { .. } | TaskKind::Subflow(_) => {
                return Err(CoreError::definition(
                    &task.id,
                    format!("'{}' does not own child tasks", task.task_type),
                ))
            }
        };

        Ok(Self {
            parent_task_run_id: Some(run.id.clone()),
            ordering,
            tasks,
            errors,
            outputs,
        })
    }

    /// Decide what this scope needs given the current execution.
    pub fn resolve(&self, execution: &Execution) -> ScopeDecision<'f> {
        let children: Vec<&TaskRun> = execution
            .children_of(self.parent_task_run_id.as_deref())
            .collect();

        let normal: Vec<(&ResolvedTask<'f>, Option<&TaskRun>)> = self
            .tasks
            .iter()
            .map(|rt| (rt, rt.find_run(&children)))
            .collect();
        let errors: Vec<(&ResolvedTask<'f>, Option<&TaskRun>)> = self
            .errors
            .iter()
            .map(|rt| (rt, rt.find_run(&children)))
            .collect();

        let errors_started = errors.iter().any(|(_, run)| run.is_some());

        if !errors_started {
            let halted = normal.iter().any(|(rt, run)| {
                run.is_some_and(|r| {
                    (r.state.is_failed() && !rt.task.allow_failure)
                        || r.current() == StateType::Killed
                })
            });
            let pending = normal
                .iter()
                .filter(|(_, run)| run.is_some_and(|r| !r.state.is_terminal()))
                .count();
            let mut eligible = normal
                .iter()
                .filter(|(rt, run)| run.is_none() && (!halted || rt.task.always_run))
                .map(|(rt, _)| (*rt).clone());

            match self.ordering {
                Ordering::Sequential => {
                    if pending > 0 {
                        return ScopeDecision::Wait;
                    }
                    if let Some(next) = eligible.next() {
                        return ScopeDecision::Next(vec![next]);
                    }
                }
                Ordering::Parallel { concurrency } => {
                    let budget = if concurrency == 0 {
                        usize::MAX
                    } else {
                        concurrency.saturating_sub(pending)
                    };
                    let next: Vec<ResolvedTask<'f>> = eligible.take(budget).collect();
                    if !next.is_empty() {
                        return ScopeDecision::Next(next);
                    }
                    if pending > 0 {
                        return ScopeDecision::Wait;
                    }
                }
            }

            let outcome = aggregate(
                normal
                    .iter()
                    .filter_map(|(rt, run)| run.map(|r| rt.child_state(r))),
            );

            if outcome == StateType::Failed {
                if let Some((first, _)) = errors.first() {
                    return ScopeDecision::Next(vec![(*first).clone()]);
                }
            }

            return ScopeDecision::Done(outcome);
        }

        if errors
            .iter()
            .any(|(_, run)| run.is_some_and(|r| !r.state.is_terminal()))
        {
            return ScopeDecision::Wait;
        }

        let handler_failed = errors.iter().any(|(rt, run)| {
            run.is_some_and(|r| r.state.is_failed() && !rt.task.allow_failure)
        });
        if !handler_failed {
            if let Some((next, _)) = errors.iter().find(|(_, run)| run.is_none()) {
                return ScopeDecision::Next(vec![(*next).clone()]);
            }
        }

        ScopeDecision::Done(StateType::Failed)
    }
}

/// Values of an each-block: the stored list when the run has one, else
/// rendered now and staged in `outputs`.
fn each_values(
    value: &Value,
    run: &TaskRun,
    renderer: &dyn ExpressionRenderer,
    variables: &Map<String, Value>,
    outputs: &mut Option<Map<String, Value>>,
) -> CoreResult<Vec<String>> {
    if let Some(values) = stored_values(run) {
        return Ok(values);
    }
    let values = resolve_each_values(value, renderer, variables)?;
    *outputs = Some(values_outputs(&values));
    Ok(values)
}

/// Empty, `false`, `0` and `null` are false (case-insensitive); anything else is true.
pub fn is_truthy(rendered: &str) -> bool {
    let trimmed = rendered.trim();
    if trimmed.is_empty() {
        return false;
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        return n != 0.0;
    }
    !matches!(
        trimmed.to_ascii_lowercase().as_str(),
        "false" | "null" | "none"
    )
}

fn stored_values(run: &TaskRun) -> Option<Vec<String>> {
    run.outputs.get("values")?.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

fn values_outputs(values: &[String]) -> Map<String, Value> {
    let mut outputs = Map::new();
    outputs.insert(
        "values".to_string(),
        Value::Array(values.iter().cloned().map(Value::String).collect()),
    );
    outputs
}

/// Render the list an each-block iterates over.
///
/// The list is either literal or a template rendering to a JSON array.
/// Duplicates are dropped (first occurrence wins), `null` is rejected and
/// non-string elements are bound as their JSON text.
pub fn resolve_each_values(
    value: &Value,
    renderer: &dyn ExpressionRenderer,
    variables: &Map<String, Value>,
) -> CoreResult<Vec<String>> {
    let items = match value {
        Value::Array(items) => items.clone(),
        Value::String(template) => {
            let rendered = if contains_template_syntax(template) {
                renderer.render(template, variables)?
            } else {
                template.clone()
            };
            match serde_json::from_str::<Value>(rendered.trim()) {
                Ok(Value::Array(items)) => items,
                _ => {
                    return Err(CoreError::Template(format!(
                        "each value must render to a JSON list, got '{}'",
                        rendered
                    )))
                }
            }
        }
        other => {
            return Err(CoreError::Validation(format!(
                "each value must be a list or an expression, got {}",
                other
            )))
        }
    };

    let mut seen = HashSet::new();
    let mut values = Vec::with_capacity(items.len());

    for item in items {
        let bound = match item {
            Value::Null => {
                return Err(CoreError::Template(
                    "each value list contains a null element".to_string(),
                ))
            }
            Value::String(s) if contains_template_syntax(&s) => renderer.render(&s, variables)?,
            Value::String(s) => s,
            other => other.to_string(),
        };
        if seen.insert(bound.clone()) {
            values.push(bound);
        }
    }

    Ok(values)
}
