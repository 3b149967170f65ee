//! Reconciliation pass.
//!
//! Given a flow and a snapshot of one of its executions, compute the next
//! snapshot and the side effects to publish. The pass never performs I/O:
//! worker tasks and subflow requests are returned to the caller, which
//! publishes them once the new snapshot is persisted.
//!
//! The task tree is walked with an explicit worklist of scopes (the flow
//! root, then every RUNNING composite run). Scopes are decided deepest
//! first so a composite that completes in this pass is seen by its parent
//! in the same pass. The walk repeats until nothing changes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::CoreError;
use crate::flow::{Flow, SubflowSpec, Task, TaskKind};
use crate::models::{Execution, SubflowExecution, TaskRun, TaskRunTransition, WorkerTask};
use crate::state::StateType;
use crate::template::{ExpressionRenderer, TemplateRenderer};

use super::commands::WorkerTaskBuilder;
use super::resolver::{ResolvedTask, Scope, ScopeDecision};
use super::variables::run_variables;

/// Output of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub execution: Execution,
    /// Leaf runs created in this pass, ready for dispatch.
    pub worker_tasks: Vec<WorkerTask>,
    pub subflow_executions: Vec<SubflowExecution>,
    /// Every task run state appended in this pass, in order.
    pub transitions: Vec<TaskRunTransition>,
    /// States appended to the execution itself.
    pub execution_transitions: Vec<StateType>,
    pub changed: bool,
}

impl Reconciliation {
    fn unchanged(execution: Execution) -> Self {
        Self {
            execution,
            worker_tasks: Vec::new(),
            subflow_executions: Vec::new(),
            transitions: Vec::new(),
            execution_transitions: Vec::new(),
            changed: false,
        }
    }
}

/// Drives executions forward.
pub struct Reconciler {
    renderer: Arc<dyn ExpressionRenderer>,
    commands: WorkerTaskBuilder,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::with_renderer(Arc::new(TemplateRenderer::new()))
    }

    pub fn with_renderer(renderer: Arc<dyn ExpressionRenderer>) -> Self {
        Self {
            commands: WorkerTaskBuilder::new(renderer.clone()),
            renderer,
        }
    }

    /// Run one pass over `execution`.
    ///
    /// Terminal executions are returned untouched. Rendering and definition
    /// errors never abort the pass; they fail the task run they belong to.
    pub fn reconcile(&self, flow: &Flow, execution: &Execution) -> Reconciliation {
        if execution.is_terminal() {
            return Reconciliation::unchanged(execution.clone());
        }

        let started = Instant::now();
        let mut pass = Pass::new(self, flow, execution.clone());

        if pass.execution.state.is_created() {
            pass.set_execution_state(StateType::Running);
        }

        let mut rounds = 0usize;
        while !pass.execution.is_terminal() && pass.step() {
            rounds += 1;
        }

        info!(
            target: "floe.performance",
            execution_id = %pass.execution.id,
            rounds,
            task_runs = pass.execution.task_run_list.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Reconciliation pass"
        );

        pass.finish()
    }
}

struct Pass<'f, 'r> {
    reconciler: &'r Reconciler,
    flow: &'f Flow,
    index: HashMap<&'f str, &'f Task>,
    execution: Execution,
    worker_tasks: Vec<WorkerTask>,
    subflow_executions: Vec<SubflowExecution>,
    transitions: Vec<TaskRunTransition>,
    execution_transitions: Vec<StateType>,
    mutations: usize,
}

impl<'f, 'r> Pass<'f, 'r> {
    fn new(reconciler: &'r Reconciler, flow: &'f Flow, execution: Execution) -> Self {
        Self {
            reconciler,
            flow,
            index: flow.task_index(),
            execution,
            worker_tasks: Vec::new(),
            subflow_executions: Vec::new(),
            transitions: Vec::new(),
            execution_transitions: Vec::new(),
            mutations: 0,
        }
    }

    fn finish(self) -> Reconciliation {
        Reconciliation {
            changed: self.mutations > 0,
            execution: self.execution,
            worker_tasks: self.worker_tasks,
            subflow_executions: self.subflow_executions,
            transitions: self.transitions,
            execution_transitions: self.execution_transitions,
        }
    }

    /// One walk over the tree. Returns whether anything changed.
    fn step(&mut self) -> bool {
        let mark = self.mutations;

        self.start_created_composites();

        let scopes = self.collect_scopes();
        for scope in scopes.iter().rev() {
            if self.execution.is_terminal() {
                break;
            }
            self.evaluate(scope.as_deref());
        }

        self.mutations != mark
    }

    fn task(&self, task_id: &str) -> Option<&'f Task> {
        self.index.get(task_id).copied()
    }

    /// CREATED composites and subflows move to RUNNING; subflows also ask for
    /// their child execution.
    fn start_created_composites(&mut self) {
        let created: Vec<(String, String)> = self
            .execution
            .task_run_list
            .iter()
            .filter(|run| run.state.is_created())
            .filter(|run| self.task(&run.task_id).map_or(true, Task::is_flowable))
            .map(|run| (run.id.clone(), run.task_id.clone()))
            .collect();

        for (run_id, task_id) in created {
            let Some(task) = self.task(&task_id) else {
                self.transition(&run_id, StateType::Running);
                self.fail(
                    &run_id,
                    &CoreError::definition(&task_id, "task is not declared in the flow"),
                );
                continue;
            };

            if !self.transition(&run_id, StateType::Running) {
                continue;
            }

            if let TaskKind::Subflow(spec) = &task.kind {
                self.request_subflow(task, spec, &run_id);
            }
        }
    }

    fn request_subflow(&mut self, task: &'f Task, spec: &SubflowSpec, run_id: &str) {
        let Some(run) = self.execution.find_task_run(run_id).cloned() else {
            return;
        };

        let variables = run_variables(self.flow, &self.execution, Some(&run), Some(task));
        let inputs = match self
            .reconciler
            .renderer
            .render_value(&Value::Object(spec.inputs.clone()), &variables)
        {
            Ok(Value::Object(inputs)) => inputs,
            Ok(other) => {
                let err = CoreError::Template(format!("subflow inputs rendered to {}", other));
                self.fail(run_id, &err);
                return;
            }
            Err(err) => {
                self.fail(run_id, &err);
                return;
            }
        };

        debug!(
            execution_id = %self.execution.id,
            task_run_id = %run_id,
            namespace = %spec.namespace,
            flow_id = %spec.flow_id,
            "Requesting subflow execution"
        );

        self.subflow_executions.push(SubflowExecution {
            parent_execution_id: self.execution.id.clone(),
            parent_task_run_id: run_id.to_string(),
            parent_namespace: self.execution.namespace.clone(),
            parent_flow_id: self.execution.flow_id.clone(),
            tenant_id: self.execution.tenant_id.clone(),
            namespace: spec.namespace.clone(),
            flow_id: spec.flow_id.clone(),
            revision: spec.revision,
            inputs,
            labels: self.execution.labels.clone(),
            wait: spec.wait,
            transmit_failed: spec.transmit_failed,
        });
    }

    /// Root scope first, then every RUNNING composite run breadth first.
    fn collect_scopes(&self) -> Vec<Option<String>> {
        let mut scopes = vec![None];
        let mut queue: VecDeque<Option<String>> = VecDeque::from([None]);

        while let Some(parent) = queue.pop_front() {
            for child in self.execution.children_of(parent.as_deref()) {
                if child.current() != StateType::Running {
                    continue;
                }
                let is_scope = match self.task(&child.task_id) {
                    Some(task) => task.is_flowable() && !task.is_subflow(),
                    None => true,
                };
                if is_scope {
                    scopes.push(Some(child.id.clone()));
                    queue.push_back(Some(child.id.clone()));
                }
            }
        }

        scopes
    }

    fn evaluate(&mut self, scope_run_id: Option<&str>) {
        let Some(run_id) = scope_run_id else {
            let decision = Scope::root(self.flow).resolve(&self.execution);
            self.apply(None, decision);
            return;
        };

        let Some(run) = self.execution.find_task_run(run_id).cloned() else {
            return;
        };
        if run.current() != StateType::Running {
            return;
        }

        let Some(task) = self.task(&run.task_id) else {
            self.fail(
                run_id,
                &CoreError::definition(&run.task_id, "task is not declared in the flow"),
            );
            return;
        };

        let variables = run_variables(self.flow, &self.execution, Some(&run), Some(task));
        let scope = match Scope::for_task_run(
            task,
            &run,
            self.reconciler.renderer.as_ref(),
            &variables,
        ) {
            Ok(scope) => scope,
            Err(err) => {
                self.fail(run_id, &err);
                return;
            }
        };

        if let Some(outputs) = &scope.outputs {
            self.set_outputs(run_id, outputs.clone());
        }

        let decision = scope.resolve(&self.execution);
        self.apply(Some(run_id), decision);
    }

    fn apply(&mut self, scope_run_id: Option<&str>, decision: ScopeDecision<'f>) {
        match decision {
            ScopeDecision::Wait => {}
            ScopeDecision::Next(tasks) => {
                for resolved in tasks {
                    self.create_run(resolved);
                }
            }
            ScopeDecision::Done(state) => match scope_run_id {
                Some(run_id) => {
                    self.transition(run_id, state);
                }
                None => self.set_execution_state(state),
            },
        }
    }

    fn create_run(&mut self, resolved: ResolvedTask<'f>) {
        let run = TaskRun::new(
            &self.execution.id,
            &self.execution.namespace,
            &self.execution.flow_id,
            &resolved.task.id,
            resolved.parent_task_run_id.as_deref(),
            resolved.value.as_deref(),
        );

        debug!(
            execution_id = %self.execution.id,
            task_run_id = %run.id,
            task_id = %run.task_id,
            value = ?run.value,
            "Created task run"
        );

        self.transitions.push(TaskRunTransition::of(&run));
        self.execution.task_run_list.push(run.clone());
        self.mutations += 1;

        if resolved.task.is_flowable() {
            return;
        }

        match self
            .reconciler
            .commands
            .build(self.flow, &self.execution, &run, resolved.task)
        {
            Ok(worker_task) => self.worker_tasks.push(worker_task),
            Err(err) => {
                self.transition(&run.id, StateType::Running);
                self.fail(&run.id, &err);
            }
        }
    }

    fn fail(&mut self, run_id: &str, err: &CoreError) {
        warn!(
            execution_id = %self.execution.id,
            task_run_id = %run_id,
            error = %err,
            "Task run failed during reconciliation"
        );
        self.transition(run_id, StateType::Failed);
    }

    /// Append `next` to a task run. Returns whether it was applied.
    fn transition(&mut self, run_id: &str, next: StateType) -> bool {
        let Some(run) = self
            .execution
            .task_run_list
            .iter_mut()
            .find(|run| run.id == run_id)
        else {
            return false;
        };

        match run.state.with_state(next) {
            Ok(state) => {
                run.state = state;
                self.transitions.push(TaskRunTransition::of(run));
                self.mutations += 1;
                true
            }
            Err(err) => {
                error!(
                    target: "floe.defect",
                    execution_id = %run.execution_id,
                    task_run_id = %run.id,
                    task_id = %run.task_id,
                    error = %err,
                    "Rejected task run transition"
                );
                false
            }
        }
    }

    fn set_execution_state(&mut self, next: StateType) {
        match self.execution.state.with_state(next) {
            Ok(state) => {
                self.execution.state = state;
                self.execution_transitions.push(next);
                self.mutations += 1;
                debug!(
                    execution_id = %self.execution.id,
                    state = %next,
                    "Execution state changed"
                );
            }
            Err(err) => {
                error!(
                    target: "floe.defect",
                    execution_id = %self.execution.id,
                    error = %err,
                    "Rejected execution transition"
                );
            }
        }
    }

    fn set_outputs(&mut self, run_id: &str, outputs: Map<String, Value>) {
        if let Some(run) = self
            .execution
            .task_run_list
            .iter_mut()
            .find(|run| run.id == run_id)
        {
            run.outputs.extend(outputs);
            self.mutations += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::parse_flow;
    use crate::models::MergeOutcome;
    use StateType::*;

    fn flow(yaml: &str) -> Flow {
        parse_flow(yaml).unwrap()
    }

    fn start(flow: &Flow) -> Reconciliation {
        let execution = Execution::new(flow, Map::new());
        Reconciler::new().reconcile(flow, &execution)
    }

    /// Simulate a worker reporting `end` for the pending run of `task_id`.
    fn finish(execution: &Execution, task_id: &str, value: Option<&str>, end: StateType) -> Execution {
        let run = execution
            .task_run_list
            .iter()
            .find(|run| {
                run.task_id == task_id
                    && !run.state.is_terminal()
                    && (value.is_none() || run.value.as_deref() == value)
            })
            .unwrap();
        let done = run.with_state(Running).unwrap().with_state(end).unwrap();
        match execution.merge_task_run(&done).unwrap() {
            MergeOutcome::Applied(execution) => *execution,
            MergeOutcome::Unchanged => panic!("snapshot was not applied"),
        }
    }

    fn step(flow: &Flow, execution: &Execution, task_id: &str, end: StateType) -> Reconciliation {
        let execution = finish(execution, task_id, None, end);
        Reconciler::new().reconcile(flow, &execution)
    }

    fn dispatched(r: &Reconciliation) -> Vec<&str> {
        r.worker_tasks.iter().map(|w| w.task_id.as_str()).collect()
    }

    fn runs_of<'a>(execution: &'a Execution, task_id: &str) -> Vec<&'a TaskRun> {
        execution
            .task_run_list
            .iter()
            .filter(|run| run.task_id == task_id)
            .collect()
    }

    #[test]
    fn test_sequential_ordering() {
        let f = flow(
            r#"
id: seq
namespace: ns
tasks:
  - id: a
    type: log
  - id: b
    type: log
"#,
        );

        let r = start(&f);
        assert_eq!(r.execution.current(), Running);
        assert_eq!(dispatched(&r), vec!["a"]);

        let r = step(&f, &r.execution, "a", Success);
        assert_eq!(dispatched(&r), vec!["b"]);
        assert_eq!(r.execution.current(), Running);

        let r = step(&f, &r.execution, "b", Success);
        assert!(r.worker_tasks.is_empty());
        assert_eq!(r.execution.current(), Success);
        assert_eq!(r.execution_transitions, vec![Success]);
    }

    #[test]
    fn test_failure_in_block_stops_siblings() {
        let f = flow(
            r#"
id: abc
namespace: ns
tasks:
  - id: block
    type: sequential
    tasks:
      - id: a
        type: log
      - id: b
        type: log
      - id: c
        type: log
"#,
        );

        let r = start(&f);
        assert_eq!(dispatched(&r), vec!["a"]);

        let r = step(&f, &r.execution, "a", Success);
        assert_eq!(dispatched(&r), vec!["b"]);

        let r = step(&f, &r.execution, "b", Failed);
        assert!(r.worker_tasks.is_empty());
        assert_eq!(runs_of(&r.execution, "block")[0].current(), Failed);
        assert!(runs_of(&r.execution, "c").is_empty());
        assert_eq!(r.execution.current(), Failed);
    }

    #[test]
    fn test_parallel_fan_out_in_one_pass() {
        let f = flow(
            r#"
id: par
namespace: ns
tasks:
  - id: fan
    type: parallel
    tasks:
      - id: x
        type: log
      - id: y
        type: log
      - id: z
        type: log
"#,
        );

        let r = start(&f);
        assert_eq!(dispatched(&r), vec!["x", "y", "z"]);
        assert_eq!(runs_of(&r.execution, "fan")[0].current(), Running);

        let mut execution = r.execution;
        for id in ["z", "x", "y"] {
            execution = finish(&execution, id, None, Success);
        }
        let r = Reconciler::new().reconcile(&f, &execution);
        assert_eq!(r.execution.current(), Success);
    }

    #[test]
    fn test_parallel_concurrency_limit() {
        let f = flow(
            r#"
id: limited
namespace: ns
tasks:
  - id: fan
    type: parallel
    concurrency: 1
    tasks:
      - id: x
        type: log
      - id: y
        type: log
"#,
        );

        let r = start(&f);
        assert_eq!(dispatched(&r), vec!["x"]);

        let r = step(&f, &r.execution, "x", Success);
        assert_eq!(dispatched(&r), vec!["y"]);
    }

    #[test]
    fn test_each_parallel_over_values() {
        let f = flow(
            r#"
id: each
namespace: ns
tasks:
  - id: loop
    type: each_parallel
    value: [1, 2, 3]
    tasks:
      - id: work
        type: log
        message: "item {{ taskrun.value }}"
"#,
        );

        let r = start(&f);
        assert_eq!(r.worker_tasks.len(), 3);
        let values: Vec<Option<&str>> = r
            .worker_tasks
            .iter()
            .map(|w| w.task_run.value.as_deref())
            .collect();
        assert_eq!(values, vec![Some("1"), Some("2"), Some("3")]);
        assert_eq!(r.worker_tasks[1].rendered_context["message"], "item 2");

        let each = runs_of(&r.execution, "loop")[0];
        assert_eq!(each.outputs["values"], serde_json::json!(["1", "2", "3"]));

        let mut execution = r.execution;
        for value in ["1", "2", "3"] {
            execution = finish(&execution, "work", Some(value), Success);
        }
        let r = Reconciler::new().reconcile(&f, &execution);
        assert_eq!(runs_of(&r.execution, "loop")[0].current(), Success);
        assert_eq!(r.execution.current(), Success);
    }

    #[test]
    fn test_each_sequential_runs_in_value_order() {
        let f = flow(
            r#"
id: each
namespace: ns
tasks:
  - id: loop
    type: each_sequential
    value: '["a", "b"]'
    tasks:
      - id: work
        type: log
"#,
        );

        let r = start(&f);
        assert_eq!(r.worker_tasks.len(), 1);
        assert_eq!(r.worker_tasks[0].task_run.value.as_deref(), Some("a"));

        let execution = finish(&r.execution, "work", Some("a"), Success);
        let r = Reconciler::new().reconcile(&f, &execution);
        assert_eq!(r.worker_tasks[0].task_run.value.as_deref(), Some("b"));
    }

    #[test]
    fn test_switch_runs_only_matching_branch() {
        let f = flow(
            r#"
id: switch
namespace: ns
inputs:
  branch: THIRD
tasks:
  - id: route
    type: switch
    value: "{{ inputs.branch }}"
    cases:
      FIRST:
        - id: first
          type: log
      THIRD:
        - id: third
          type: log
    defaults:
      - id: fallback
        type: log
"#,
        );

        let r = start(&f);
        assert_eq!(dispatched(&r), vec!["third"]);

        let route = runs_of(&r.execution, "route")[0];
        assert_eq!(route.outputs["value"], "THIRD");
        assert_eq!(route.outputs["defaults"], false);

        let r = step(&f, &r.execution, "third", Success);
        assert_eq!(r.execution.current(), Success);
        assert!(runs_of(&r.execution, "first").is_empty());
        assert!(runs_of(&r.execution, "fallback").is_empty());
    }

    #[test]
    fn test_switch_without_match_fails() {
        let f = flow(
            r#"
id: switch
namespace: ns
tasks:
  - id: route
    type: switch
    value: "UNKNOWN"
    cases:
      FIRST:
        - id: first
          type: log
"#,
        );

        let r = start(&f);
        assert!(r.worker_tasks.is_empty());
        assert_eq!(runs_of(&r.execution, "route")[0].current(), Failed);
        assert_eq!(r.execution.current(), Failed);
    }

    const GATED: &str = r#"
id: gated
namespace: ns
inputs:
  enabled: ENABLED
tasks:
  - id: gate
    type: if
    condition: "{{ inputs.enabled }}"
    then:
      - id: notify
        type: log
      - id: report
        type: log
    else:
      - id: skip
        type: log
  - id: tail
    type: log
"#;

    #[test]
    fn test_if_runs_then_branch() {
        let f = flow(&GATED.replace("ENABLED", "true"));

        let r = start(&f);
        assert_eq!(dispatched(&r), vec!["notify"]);
        assert_eq!(runs_of(&r.execution, "gate")[0].outputs["condition"], true);

        let r = step(&f, &r.execution, "notify", Success);
        assert_eq!(dispatched(&r), vec!["report"]);

        let r = step(&f, &r.execution, "report", Success);
        assert_eq!(runs_of(&r.execution, "gate")[0].current(), Success);
        assert_eq!(dispatched(&r), vec!["tail"]);
        assert!(runs_of(&r.execution, "skip").is_empty());
    }

    #[test]
    fn test_if_runs_else_branch() {
        let f = flow(&GATED.replace("ENABLED", "false"));

        let r = start(&f);
        assert_eq!(dispatched(&r), vec!["skip"]);
        assert_eq!(runs_of(&r.execution, "gate")[0].outputs["condition"], false);

        let r = step(&f, &r.execution, "skip", Failed);
        assert_eq!(runs_of(&r.execution, "gate")[0].current(), Failed);
        assert_eq!(r.execution.current(), Failed);
        assert!(runs_of(&r.execution, "notify").is_empty());
        assert!(runs_of(&r.execution, "tail").is_empty());
    }

    #[test]
    fn test_if_without_else_ends_on_false() {
        let f = flow(
            r#"
id: gated
namespace: ns
tasks:
  - id: gate
    type: if
    condition: "0"
    then:
      - id: notify
        type: log
  - id: tail
    type: log
"#,
        );

        let r = start(&f);
        assert_eq!(runs_of(&r.execution, "gate")[0].current(), Success);
        assert_eq!(dispatched(&r), vec!["tail"]);
    }

    #[test]
    fn test_error_handlers_run_after_failure() {
        let f = flow(
            r#"
id: errors
namespace: ns
tasks:
  - id: a
    type: log
  - id: b
    type: log
errors:
  - id: alert
    type: log
"#,
        );

        let r = start(&f);
        let r = step(&f, &r.execution, "a", Failed);
        assert_eq!(dispatched(&r), vec!["alert"]);
        assert_eq!(r.execution.current(), Running);
        assert!(runs_of(&r.execution, "b").is_empty());

        let r = step(&f, &r.execution, "alert", Success);
        assert_eq!(r.execution.current(), Failed);
    }

    #[test]
    fn test_always_run_after_failure() {
        let f = flow(
            r#"
id: cleanup
namespace: ns
tasks:
  - id: a
    type: log
  - id: skipped
    type: log
  - id: cleanup
    type: log
    alwaysRun: true
"#,
        );

        let r = start(&f);
        let r = step(&f, &r.execution, "a", Failed);
        assert_eq!(dispatched(&r), vec!["cleanup"]);

        let r = step(&f, &r.execution, "cleanup", Success);
        assert_eq!(r.execution.current(), Failed);
        assert!(runs_of(&r.execution, "skipped").is_empty());
    }

    #[test]
    fn test_allow_failure_is_warning() {
        let f = flow(
            r#"
id: tolerant
namespace: ns
tasks:
  - id: a
    type: log
    allowFailure: true
  - id: b
    type: log
"#,
        );

        let r = start(&f);
        let r = step(&f, &r.execution, "a", Failed);
        assert_eq!(dispatched(&r), vec!["b"]);

        let r = step(&f, &r.execution, "b", Success);
        assert_eq!(r.execution.current(), Warning);
    }

    #[test]
    fn test_disabled_task_is_skipped() {
        let f = flow(
            r#"
id: disabled
namespace: ns
tasks:
  - id: off
    type: log
    disabled: true
  - id: on
    type: log
"#,
        );

        let r = start(&f);
        assert_eq!(dispatched(&r), vec!["on"]);
    }

    #[test]
    fn test_render_failure_fails_without_dispatch() {
        let f = flow(
            r#"
id: broken
namespace: ns
tasks:
  - id: a
    type: log
    message: "{{ inputs.x | }}"
"#,
        );

        let r = start(&f);
        assert!(r.worker_tasks.is_empty());
        let run = runs_of(&r.execution, "a")[0];
        let states: Vec<StateType> = run.state.histories().iter().map(|h| h.state).collect();
        assert_eq!(states, vec![Created, Running, Failed]);
        assert_eq!(r.execution.current(), Failed);
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let f = flow(
            r#"
id: redelivery
namespace: ns
tasks:
  - id: a
    type: log
  - id: b
    type: log
"#,
        );

        let r = start(&f);
        let run = runs_of(&r.execution, "a")[0];
        let done = run.with_state(Running).unwrap().with_state(Success).unwrap();

        let execution = match r.execution.merge_task_run(&done).unwrap() {
            MergeOutcome::Applied(execution) => *execution,
            MergeOutcome::Unchanged => panic!("first delivery must apply"),
        };
        let r = Reconciler::new().reconcile(&f, &execution);
        assert_eq!(dispatched(&r), vec!["b"]);

        assert_eq!(
            r.execution.merge_task_run(&done).unwrap(),
            MergeOutcome::Unchanged
        );
        let again = Reconciler::new().reconcile(&f, &r.execution);
        assert!(!again.changed);
        assert!(again.worker_tasks.is_empty());
        assert_eq!(runs_of(&again.execution, "b").len(), 1);
    }

    #[test]
    fn test_terminal_execution_untouched() {
        let f = flow(
            r#"
id: done
namespace: ns
tasks:
  - id: a
    type: log
"#,
        );

        let r = start(&f);
        let r = step(&f, &r.execution, "a", Success);
        assert_eq!(r.execution.current(), Success);

        let again = Reconciler::new().reconcile(&f, &r.execution);
        assert!(!again.changed);
        assert_eq!(again.execution, r.execution);
    }

    #[test]
    fn test_subflow_request() {
        let f = flow(
            r#"
id: parent
namespace: ns
inputs:
  size: 3
tasks:
  - id: call
    type: subflow
    namespace: ns
    flowId: child
    inputs:
      count: "{{ inputs.size }}"
"#,
        );

        let r = start(&f);
        assert!(r.worker_tasks.is_empty());
        assert_eq!(r.subflow_executions.len(), 1);

        let request = &r.subflow_executions[0];
        assert_eq!(request.flow_id, "child");
        assert_eq!(request.parent_execution_id, r.execution.id);
        assert_eq!(request.inputs["count"], 3);
        assert!(request.wait);

        let call = runs_of(&r.execution, "call")[0];
        assert_eq!(call.current(), Running);

        // no second request while the child runs
        let again = Reconciler::new().reconcile(&f, &r.execution);
        assert!(again.subflow_executions.is_empty());
        assert!(!again.changed);
    }

    #[test]
    fn test_transitions_are_recorded() {
        let f = flow(
            r#"
id: events
namespace: ns
tasks:
  - id: a
    type: log
"#,
        );

        let r = start(&f);
        assert_eq!(r.transitions.len(), 1);
        assert_eq!(r.transitions[0].task_id, "a");
        assert_eq!(r.transitions[0].state, Created);
        assert_eq!(r.execution_transitions, vec![Running]);
    }
}
