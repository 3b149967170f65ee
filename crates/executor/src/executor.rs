//! Executor loop.
//!
//! Every message on the executor topic is handled under the lock of the
//! execution it names:
//!
//! 1. load the stored snapshot
//! 2. merge the worker result, apply the kill or the subflow result
//! 3. run one reconciliation pass
//! 4. stage the new snapshot
//! 5. publish the side effects (worker tasks, kills, subflow results,
//!    subflow executions)
//! 6. commit and release the lock
//!
//! A failed publish drops the lock without committing and the message is
//! redelivered, so no effect is lost. Effects published before the failure
//! may be published again; worker results for runs the store never committed
//! are dropped as unknown. A worker reporting before the commit waits on the
//! lock. Execution events are best effort.

use std::sync::Arc;

use async_trait::async_trait;
use floe_core::engine::{apply_subflow_result, child_outputs, kill, subflow_result, Reconciler};
use floe_core::flow::Flow;
use floe_core::models::{
    Execution, ExecutionKilled, ExecutorMessage, MergeOutcome, ParentExecution, SubflowExecution,
    SubflowExecutionResult, TaskRunTransition, WorkerKill, WorkerTask,
};
use floe_core::state::StateType;
use floe_core::CoreError;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::{ExecutorError, ExecutorResult};
use crate::metrics::{self, MessageOutcome};
use crate::queue::{
    publish_json, MessageHandler, Queue, Subscription, EXECUTION_EVENTS_TOPIC, EXECUTOR_TOPIC,
    WORKER_KILLS_TOPIC, WORKER_TASKS_TOPIC,
};
use crate::repository::FlowRepository;
use crate::result_ext::ResultExt;
use crate::store::ExecutionStore;

/// The reconciliation loop service.
pub struct Executor {
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn Queue>,
    flows: Arc<dyn FlowRepository>,
    reconciler: Reconciler,
}

/// Side effects gathered under the lock.
#[derive(Default)]
struct Effects {
    worker_tasks: Vec<WorkerTask>,
    worker_kills: Vec<WorkerKill>,
    subflows: Vec<SubflowExecution>,
    transitions: Vec<TaskRunTransition>,
    execution_transitions: Vec<StateType>,
    subflow_result: Option<SubflowExecutionResult>,
}

enum Step {
    Changed(Box<Execution>, Effects),
    Unchanged,
    Dropped,
}

impl Executor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        queue: Arc<dyn Queue>,
        flows: Arc<dyn FlowRepository>,
    ) -> Self {
        Self {
            store,
            queue,
            flows,
            reconciler: Reconciler::new(),
        }
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    /// Consume the executor topic as `group` until the subscription is shut
    /// down.
    pub async fn run(self: Arc<Self>, group: &str) -> ExecutorResult<Subscription> {
        let handler = Arc::new(ExecutorHandler {
            executor: self.clone(),
        });
        let subscription = self.queue.subscribe(EXECUTOR_TOPIC, group, handler).await?;
        info!(group = %group, "Executor loop started");
        Ok(subscription)
    }

    /// Store a new CREATED execution and hand it to the loop.
    pub async fn submit(&self, execution: Execution) -> ExecutorResult<Execution> {
        self.store.insert(&execution).await?;

        info!(
            execution_id = %execution.id,
            namespace = %execution.namespace,
            flow_id = %execution.flow_id,
            revision = execution.flow_revision,
            "Execution submitted"
        );

        self.send(&ExecutorMessage::Execution(execution.clone())).await?;
        Ok(execution)
    }

    /// Create and submit an execution of the latest revision of a flow.
    pub async fn submit_flow(
        &self,
        tenant_id: Option<&str>,
        namespace: &str,
        flow_id: &str,
        inputs: Map<String, Value>,
    ) -> ExecutorResult<Execution> {
        let flow = self
            .flows
            .find_by_id(tenant_id, namespace, flow_id, None)
            .await?
            .ok_or_else(|| ExecutorError::FlowNotFound(format!("{}.{}", namespace, flow_id)))?;

        if flow.disabled {
            return Err(CoreError::Validation(format!("flow '{}' is disabled", flow.uid())).into());
        }

        self.submit(Execution::new(&flow, inputs)).await
    }

    /// Ask the loop to kill an execution, or one task run and its subtree.
    pub async fn kill(&self, execution_id: &str, task_run_id: Option<&str>) -> ExecutorResult<()> {
        self.send(&ExecutorMessage::Kill(ExecutionKilled {
            execution_id: execution_id.to_string(),
            task_run_id: task_run_id.map(str::to_string),
        }))
        .await
    }

    /// Handle one executor message.
    ///
    /// Errors are storage or queue failures worth a redelivery; everything
    /// else ends as [`MessageOutcome::Dropped`].
    pub async fn handle(&self, message: ExecutorMessage) -> ExecutorResult<MessageOutcome> {
        let kind = message.kind();
        let execution_id = message.execution_id().to_string();

        debug!(execution_id = %execution_id, kind, "Handling message");

        let outcome = self.process(&execution_id, message).await?;
        metrics::record_message(kind, outcome);
        Ok(outcome)
    }

    async fn process(
        &self,
        execution_id: &str,
        message: ExecutorMessage,
    ) -> ExecutorResult<MessageOutcome> {
        let Some(mut lock) = self.store.lock(execution_id).await? else {
            warn!(execution_id = %execution_id, kind = message.kind(), "Message for unknown execution dropped");
            return Ok(MessageOutcome::Dropped);
        };

        let current = lock.execution().clone();
        let Some(flow) = self.flows.find_by_execution(&current).await? else {
            error!(
                execution_id = %execution_id,
                namespace = %current.namespace,
                flow_id = %current.flow_id,
                revision = current.flow_revision,
                "Flow of execution not found"
            );
            lock.release().await?;
            return Ok(MessageOutcome::Dropped);
        };

        let (next, effects) = match self.apply(&flow, current, message) {
            Step::Changed(next, effects) => (*next, effects),
            Step::Unchanged => {
                lock.release().await?;
                return Ok(MessageOutcome::Unchanged);
            }
            Step::Dropped => {
                lock.release().await?;
                return Ok(MessageOutcome::Dropped);
            }
        };

        lock.save(next.clone()).await?;
        // an error drops the lock uncommitted
        self.publish(&next, &effects).await?;
        lock.release().await?;

        record_transitions(&next, &effects);
        Ok(MessageOutcome::Applied)
    }

    /// Apply `message` to `execution` and reconcile. Pure apart from logging.
    fn apply(&self, flow: &Flow, execution: Execution, message: ExecutorMessage) -> Step {
        let was_terminal = execution.is_terminal();
        let mut effects = Effects::default();
        let mut changed = false;

        let base = match message {
            ExecutorMessage::Execution(_) => {
                if was_terminal {
                    return Step::Unchanged;
                }
                execution
            }
            ExecutorMessage::WorkerTaskResult(result) => {
                let run = &result.task_run;
                // composites end only through their children
                if flow.find_task(&run.task_id).map_or(true, |task| task.is_flowable()) {
                    error!(
                        target: "floe.defect",
                        execution_id = %execution.id,
                        task_run_id = %run.id,
                        task_id = %run.task_id,
                        "Worker result for a task that is not runnable"
                    );
                    return Step::Dropped;
                }
                let known = execution
                    .find_task_run(&run.id)
                    .map_or(0, |stored| stored.state.histories().len());

                match execution.merge_task_run(run) {
                    Ok(MergeOutcome::Applied(merged)) => {
                        for history in run.state.histories().iter().skip(known) {
                            effects.transitions.push(TaskRunTransition {
                                state: history.state,
                                ..TaskRunTransition::of(run)
                            });
                        }
                        changed = true;
                        *merged
                    }
                    Ok(MergeOutcome::Unchanged) => {
                        debug!(
                            execution_id = %execution.id,
                            task_run_id = %run.id,
                            state = %run.current(),
                            "Duplicate or stale worker result"
                        );
                        return Step::Unchanged;
                    }
                    Err(CoreError::UnknownTaskRun(id)) => {
                        warn!(execution_id = %execution.id, task_run_id = %id, "Worker result for unknown task run dropped");
                        return Step::Dropped;
                    }
                    Err(e) => {
                        error!(
                            target: "floe.defect",
                            execution_id = %execution.id,
                            task_run_id = %run.id,
                            error = %e,
                            "Worker result rejected"
                        );
                        return Step::Dropped;
                    }
                }
            }
            ExecutorMessage::Kill(killed) => {
                match kill(flow, &execution, killed.task_run_id.as_deref()) {
                    Ok(outcome) if outcome.changed => {
                        effects.worker_kills = outcome.worker_kills;
                        effects.transitions = outcome.transitions;
                        if outcome.execution.is_terminal() {
                            effects.execution_transitions.push(StateType::Killed);
                        }
                        changed = true;
                        outcome.execution
                    }
                    Ok(_) => return Step::Unchanged,
                    Err(e) => {
                        warn!(execution_id = %execution.id, error = %e, "Kill request dropped");
                        return Step::Dropped;
                    }
                }
            }
            ExecutorMessage::SubflowResult(result) => {
                match apply_subflow_result(&execution, &result) {
                    Ok(Some((next, transition))) => {
                        effects.transitions.push(transition);
                        changed = true;
                        next
                    }
                    Ok(None) => return Step::Unchanged,
                    Err(e) => {
                        warn!(execution_id = %execution.id, error = %e, "Subflow result dropped");
                        return Step::Dropped;
                    }
                }
            }
        };

        let pass = self.reconciler.reconcile(flow, &base);
        if !(changed || pass.changed) {
            return Step::Unchanged;
        }

        effects.worker_tasks = pass.worker_tasks;
        effects.subflows = pass.subflow_executions;
        effects.transitions.extend(pass.transitions);
        effects.execution_transitions.extend(pass.execution_transitions);

        let next = pass.execution;
        if !was_terminal && next.is_terminal() {
            info!(
                execution_id = %next.id,
                state = %next.current(),
                duration_ms = next.state.duration().num_milliseconds(),
                "Execution finished"
            );
            if next.parent.as_ref().is_some_and(|parent| parent.wait) {
                effects.subflow_result = subflow_result(&next);
            }
        }

        Step::Changed(Box::new(next), effects)
    }

    /// Publish side effects while the lock is held. Child executions are
    /// created last since they cannot be taken back.
    async fn publish(&self, execution: &Execution, effects: &Effects) -> ExecutorResult<()> {
        for task in &effects.worker_tasks {
            publish_json(&*self.queue, WORKER_TASKS_TOPIC, &task.execution_id, task)
                .await
                .log(format!("publishing worker task {}", task.task_run_id))?;
        }
        for notice in &effects.worker_kills {
            publish_json(&*self.queue, WORKER_KILLS_TOPIC, &notice.execution_id, notice)
                .await
                .log(format!("publishing kill of {}", notice.task_run_id))?;
        }

        if let Some(result) = &effects.subflow_result {
            self.send(&ExecutorMessage::SubflowResult(result.clone()))
                .await
                .log("sending subflow result to parent")?;
        }

        for request in &effects.subflows {
            self.start_subflow(request.clone())
                .await
                .log("starting subflow execution")?;
        }

        let _ = publish_json(&*self.queue, EXECUTION_EVENTS_TOPIC, &execution.id, execution)
            .await
            .log("publishing execution event");

        Ok(())
    }

    /// Create the child execution a subflow task asked for.
    async fn start_subflow(&self, request: SubflowExecution) -> ExecutorResult<()> {
        let flow = self
            .flows
            .find_by_id(
                request.tenant_id.as_deref(),
                &request.namespace,
                &request.flow_id,
                request.revision,
            )
            .await?;

        let Some(flow) = flow.filter(|flow| !flow.disabled) else {
            warn!(
                execution_id = %request.parent_execution_id,
                task_run_id = %request.parent_task_run_id,
                namespace = %request.namespace,
                flow_id = %request.flow_id,
                "Subflow not found, failing the subflow task"
            );
            return self
                .send(&ExecutorMessage::SubflowResult(SubflowExecutionResult {
                    execution_id: request.parent_execution_id,
                    task_run_id: request.parent_task_run_id,
                    state: StateType::Failed,
                    outputs: Map::new(),
                }))
                .await;
        };

        let mut child = Execution::new(&flow, request.inputs).with_parent(ParentExecution {
            execution_id: request.parent_execution_id.clone(),
            task_run_id: request.parent_task_run_id.clone(),
            namespace: request.parent_namespace,
            flow_id: request.parent_flow_id,
            wait: request.wait,
            transmit_failed: request.transmit_failed,
        });
        child.labels.extend(request.labels);

        let child = self.submit(child).await?;

        if !request.wait {
            self.send(&ExecutorMessage::SubflowResult(SubflowExecutionResult {
                execution_id: request.parent_execution_id,
                task_run_id: request.parent_task_run_id,
                state: StateType::Success,
                outputs: child_outputs(&child.id, None),
            }))
            .await?;
        }

        Ok(())
    }

    async fn send(&self, message: &ExecutorMessage) -> ExecutorResult<()> {
        publish_json(&*self.queue, EXECUTOR_TOPIC, message.execution_id(), message).await
    }
}

fn record_transitions(execution: &Execution, effects: &Effects) {
    for transition in &effects.transitions {
        metrics::record_task_run_transition(transition);
    }
    for state in &effects.execution_transitions {
        metrics::record_execution_transition(execution, *state);
    }
}

/// Queue adapter for the executor topic.
struct ExecutorHandler {
    executor: Arc<Executor>,
}

#[async_trait]
impl MessageHandler for ExecutorHandler {
    async fn handle(&self, key: &str, payload: &[u8]) -> ExecutorResult<()> {
        let message: ExecutorMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(key = %key, error = %e, "Malformed executor message dropped");
                metrics::record_message("malformed", MessageOutcome::Dropped);
                return Ok(());
            }
        };

        match self.executor.handle(message).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                error!(key = %key, error = %e, "Executor message dropped");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::repository::MemoryFlowRepository;
    use crate::store::MemoryExecutionStore;
    use floe_core::flow::parse_flow;
    use floe_core::models::{TaskRun, WorkerTaskResult};
    use metrics_util::debugging::DebuggingRecorder;
    use serde::de::DeserializeOwned;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Queue double that records every publish.
    #[derive(Default)]
    struct RecordingQueue {
        published: Mutex<Vec<(String, String, Vec<u8>)>>,
        failing: Mutex<Vec<String>>,
    }

    impl RecordingQueue {
        /// Fail the next publish to `topic`.
        fn fail_next(&self, topic: &str) {
            self.failing.lock().unwrap().push(topic.to_string());
        }

        fn take<T: DeserializeOwned>(&self, topic: &str) -> Vec<T> {
            let mut published = self.published.lock().unwrap();
            let (matching, rest): (Vec<_>, Vec<_>) =
                published.drain(..).partition(|(t, _, _)| t == topic);
            *published = rest;
            matching
                .into_iter()
                .map(|(_, _, payload)| serde_json::from_slice(&payload).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Queue for RecordingQueue {
        async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> ExecutorResult<()> {
            {
                let mut failing = self.failing.lock().unwrap();
                if let Some(pos) = failing.iter().position(|t| t == topic) {
                    failing.remove(pos);
                    return Err(ExecutorError::Queue(format!("broker refused '{}'", topic)));
                }
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), key.to_string(), payload));
            Ok(())
        }

        async fn subscribe(
            &self,
            _topic: &str,
            _group: &str,
            _handler: Arc<dyn MessageHandler>,
        ) -> ExecutorResult<Subscription> {
            Ok(Subscription::new(Vec::new()))
        }
    }

    struct Harness {
        executor: Arc<Executor>,
        store: Arc<MemoryExecutionStore>,
        queue: Arc<RecordingQueue>,
        flows: Arc<MemoryFlowRepository>,
    }

    impl Harness {
        async fn new(flows: &[&str]) -> Self {
            let store = Arc::new(MemoryExecutionStore::new());
            let queue = Arc::new(RecordingQueue::default());
            let repository = Arc::new(MemoryFlowRepository::new());
            for yaml in flows {
                repository.save(parse_flow(yaml).unwrap()).await.unwrap();
            }
            let executor = Arc::new(Executor::new(store.clone(), queue.clone(), repository.clone()));
            Self {
                executor,
                store,
                queue,
                flows: repository,
            }
        }

        /// Handle executor messages until none are left.
        async fn drain(&self) {
            loop {
                let messages: Vec<ExecutorMessage> = self.queue.take(EXECUTOR_TOPIC);
                if messages.is_empty() {
                    return;
                }
                for message in messages {
                    self.executor.handle(message).await.unwrap();
                }
            }
        }

        /// Complete every dispatched worker task with `state`.
        async fn work(&self, state: StateType) -> usize {
            let tasks: Vec<WorkerTask> = self.queue.take(WORKER_TASKS_TOPIC);
            for task in &tasks {
                self.executor
                    .handle(ExecutorMessage::WorkerTaskResult(WorkerTaskResult {
                        task_run: finished(&task.task_run, state),
                    }))
                    .await
                    .unwrap();
            }
            tasks.len()
        }

        async fn execution(&self, id: &str) -> Execution {
            self.store.find(id).await.unwrap().unwrap()
        }
    }

    fn finished(run: &TaskRun, state: StateType) -> TaskRun {
        run.with_state(StateType::Running).unwrap().with_state(state).unwrap()
    }

    const SEQUENTIAL: &str = r#"
id: seq
namespace: ns
tasks:
  - id: a
    type: log
  - id: b
    type: log
"#;

    #[tokio::test]
    async fn test_submit_and_run_to_success() {
        let h = Harness::new(&[SEQUENTIAL]).await;
        let execution = h
            .executor
            .submit_flow(None, "ns", "seq", Map::new())
            .await
            .unwrap();
        assert_eq!(execution.flow_revision, 1);

        h.drain().await;
        assert_eq!(h.work(StateType::Success).await, 1);
        assert_eq!(h.work(StateType::Success).await, 1);
        assert_eq!(h.work(StateType::Success).await, 0);

        let stored = h.execution(&execution.id).await;
        assert_eq!(stored.current(), StateType::Success);

        let events: Vec<Execution> = h.queue.take(EXECUTION_EVENTS_TOPIC);
        assert_eq!(events.last().map(Execution::current), Some(StateType::Success));
    }

    #[tokio::test]
    async fn test_unknown_execution_dropped() {
        let h = Harness::new(&[SEQUENTIAL]).await;
        let outcome = h
            .executor
            .handle(ExecutorMessage::Kill(ExecutionKilled {
                execution_id: "missing".to_string(),
                task_run_id: None,
            }))
            .await
            .unwrap();
        assert_eq!(outcome, MessageOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_duplicate_worker_result_is_unchanged() {
        let h = Harness::new(&[SEQUENTIAL]).await;
        let execution = h.executor.submit_flow(None, "ns", "seq", Map::new()).await.unwrap();
        h.drain().await;

        let tasks: Vec<WorkerTask> = h.queue.take(WORKER_TASKS_TOPIC);
        let result = ExecutorMessage::WorkerTaskResult(WorkerTaskResult {
            task_run: finished(&tasks[0].task_run, StateType::Success),
        });

        let first = h.executor.handle(result.clone()).await.unwrap();
        let second = h.executor.handle(result).await.unwrap();
        assert_eq!(first, MessageOutcome::Applied);
        assert_eq!(second, MessageOutcome::Unchanged);

        // b was dispatched exactly once
        let dispatched: Vec<WorkerTask> = h.queue.take(WORKER_TASKS_TOPIC);
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].task_id, "b");
        assert_eq!(h.execution(&execution.id).await.task_run_list.len(), 2);
    }

    #[tokio::test]
    async fn test_mismatched_result_is_dropped() {
        let h = Harness::new(&[SEQUENTIAL]).await;
        let execution = h.executor.submit_flow(None, "ns", "seq", Map::new()).await.unwrap();
        h.drain().await;

        let tasks: Vec<WorkerTask> = h.queue.take(WORKER_TASKS_TOPIC);
        let before = h.execution(&execution.id).await;

        // same run id, different task
        let mut forged = finished(&tasks[0].task_run, StateType::Success);
        forged.task_id = "b".to_string();
        let outcome = h
            .executor
            .handle(ExecutorMessage::WorkerTaskResult(WorkerTaskResult { task_run: forged }))
            .await
            .unwrap();

        assert_eq!(outcome, MessageOutcome::Dropped);
        assert_eq!(h.execution(&execution.id).await, before);
        assert!(h.queue.take::<WorkerTask>(WORKER_TASKS_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_failed_dispatch_is_rolled_back_and_redelivered() {
        let h = Harness::new(&[SEQUENTIAL]).await;
        let execution = h.executor.submit_flow(None, "ns", "seq", Map::new()).await.unwrap();
        let messages: Vec<ExecutorMessage> = h.queue.take(EXECUTOR_TOPIC);
        assert_eq!(messages.len(), 1);
        let payload = serde_json::to_vec(&messages[0]).unwrap();

        h.queue.fail_next(WORKER_TASKS_TOPIC);
        let handler = ExecutorHandler {
            executor: h.executor.clone(),
        };
        // a transient error asks the queue for a redelivery
        assert!(handler.handle(&execution.id, &payload).await.is_err());

        let stored = h.execution(&execution.id).await;
        assert_eq!(stored.current(), StateType::Created);
        assert!(stored.task_run_list.is_empty());
        assert!(h.queue.take::<WorkerTask>(WORKER_TASKS_TOPIC).is_empty());
        assert!(h.queue.take::<Execution>(EXECUTION_EVENTS_TOPIC).is_empty());

        handler.handle(&execution.id, &payload).await.unwrap();

        let stored = h.execution(&execution.id).await;
        let tasks: Vec<WorkerTask> = h.queue.take(WORKER_TASKS_TOPIC);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, "a");
        assert_eq!(stored.task_run_list.len(), 1);
        assert_eq!(tasks[0].task_run_id, stored.task_run_list[0].id);

        assert_eq!(h.work(StateType::Success).await, 1);
        assert_eq!(h.work(StateType::Success).await, 1);
        assert_eq!(h.execution(&execution.id).await.current(), StateType::Success);
    }

    #[tokio::test]
    async fn test_worker_result_for_composite_is_dropped() {
        let h = Harness::new(&[r#"
id: blocky
namespace: ns
tasks:
  - id: block
    type: sequential
    tasks:
      - id: a
        type: log
"#])
        .await;
        let execution = h.executor.submit_flow(None, "ns", "blocky", Map::new()).await.unwrap();
        h.drain().await;
        let _: Vec<WorkerTask> = h.queue.take(WORKER_TASKS_TOPIC);

        let before = h.execution(&execution.id).await;
        let block = before
            .task_run_list
            .iter()
            .find(|run| run.task_id == "block")
            .unwrap();
        assert_eq!(block.current(), StateType::Running);

        let forged = block.with_state(StateType::Success).unwrap();
        let outcome = h
            .executor
            .handle(ExecutorMessage::WorkerTaskResult(WorkerTaskResult { task_run: forged }))
            .await
            .unwrap();

        assert_eq!(outcome, MessageOutcome::Dropped);
        let after = h.execution(&execution.id).await;
        assert_eq!(after, before);
        assert_eq!(after.current(), StateType::Running);
    }

    #[tokio::test]
    async fn test_kill_execution() {
        let h = Harness::new(&[SEQUENTIAL]).await;
        let execution = h.executor.submit_flow(None, "ns", "seq", Map::new()).await.unwrap();
        h.drain().await;
        let _: Vec<WorkerTask> = h.queue.take(WORKER_TASKS_TOPIC);

        h.executor.kill(&execution.id, None).await.unwrap();
        h.drain().await;

        let kills: Vec<WorkerKill> = h.queue.take(WORKER_KILLS_TOPIC);
        assert_eq!(kills.len(), 1);
        assert_eq!(h.execution(&execution.id).await.current(), StateType::Killed);

        // late worker result for the killed run changes nothing
        assert_eq!(h.work(StateType::Success).await, 0);
        h.executor.kill(&execution.id, None).await.unwrap();
        let messages: Vec<ExecutorMessage> = h.queue.take(EXECUTOR_TOPIC);
        let outcome = h.executor.handle(messages[0].clone()).await.unwrap();
        assert_eq!(outcome, MessageOutcome::Unchanged);
    }

    const PARENT: &str = r#"
id: parent
namespace: ns
tasks:
  - id: call
    type: subflow
    namespace: ns
    flowId: child
    inputs:
      who: "{{ flow.id }}"
"#;

    const CHILD: &str = r#"
id: child
namespace: ns
inputs:
  who: nobody
tasks:
  - id: greet
    type: log
    message: "hello {{ inputs.who }}"
"#;

    #[tokio::test]
    async fn test_subflow_waits_for_child() {
        let h = Harness::new(&[PARENT, CHILD]).await;
        let parent = h.executor.submit_flow(None, "ns", "parent", Map::new()).await.unwrap();
        h.drain().await;

        let tasks: Vec<WorkerTask> = h.queue.take(WORKER_TASKS_TOPIC);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].rendered_context["message"], "hello parent");
        assert_ne!(tasks[0].execution_id, parent.id);

        let child = h.execution(&tasks[0].execution_id).await;
        assert_eq!(child.parent.as_ref().map(|p| p.execution_id.as_str()), Some(parent.id.as_str()));
        assert_eq!(h.execution(&parent.id).await.current(), StateType::Running);

        h.executor
            .handle(ExecutorMessage::WorkerTaskResult(WorkerTaskResult {
                task_run: finished(&tasks[0].task_run, StateType::Success),
            }))
            .await
            .unwrap();
        h.drain().await;

        assert_eq!(h.execution(&child.id).await.current(), StateType::Success);
        let parent = h.execution(&parent.id).await;
        assert_eq!(parent.current(), StateType::Success);
        assert_eq!(parent.task_run_list[0].outputs["executionId"], child.id.as_str());
    }

    #[tokio::test]
    async fn test_subflow_failure_propagates() {
        let h = Harness::new(&[PARENT, CHILD]).await;
        let parent = h.executor.submit_flow(None, "ns", "parent", Map::new()).await.unwrap();
        h.drain().await;
        h.work(StateType::Failed).await;
        h.drain().await;

        assert_eq!(h.execution(&parent.id).await.current(), StateType::Failed);
    }

    #[tokio::test]
    async fn test_subflow_without_wait() {
        let no_wait = PARENT.replace("flowId: child", "flowId: child\n    wait: false");
        let h = Harness::new(&[no_wait.as_str(), CHILD]).await;
        let parent = h.executor.submit_flow(None, "ns", "parent", Map::new()).await.unwrap();
        h.drain().await;

        assert_eq!(h.execution(&parent.id).await.current(), StateType::Success);
        // the child still runs on its own
        assert_eq!(h.queue.take::<WorkerTask>(WORKER_TASKS_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_subflow_fails_task() {
        let h = Harness::new(&[PARENT]).await;
        let parent = h.executor.submit_flow(None, "ns", "parent", Map::new()).await.unwrap();
        h.drain().await;

        let parent = h.execution(&parent.id).await;
        assert_eq!(parent.task_run_list[0].current(), StateType::Failed);
        assert_eq!(parent.current(), StateType::Failed);
    }

    #[tokio::test]
    async fn test_submit_disabled_flow_rejected() {
        let disabled = SEQUENTIAL.replace("namespace: ns", "namespace: ns\ndisabled: true");
        let h = Harness::new(&[disabled.as_str()]).await;
        assert!(h.executor.submit_flow(None, "ns", "seq", Map::new()).await.is_err());
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_flow_rejected() {
        let h = Harness::new(&[]).await;
        assert!(matches!(
            h.executor.submit_flow(None, "ns", "nope", Map::new()).await,
            Err(ExecutorError::FlowNotFound(_))
        ));
        assert!(h.flows.find_by_id(None, "ns", "nope", None).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_results_single_reconciler() {
        let mut yaml = String::from("id: wide\nnamespace: ns\ntasks:\n  - id: fan\n    type: parallel\n    tasks:\n");
        for i in 0..16 {
            yaml.push_str(&format!("      - id: t{}\n        type: log\n", i));
        }
        let h = Harness::new(&[yaml.as_str()]).await;
        let execution = h.executor.submit_flow(None, "ns", "wide", Map::new()).await.unwrap();
        h.drain().await;

        let tasks: Vec<WorkerTask> = h.queue.take(WORKER_TASKS_TOPIC);
        assert_eq!(tasks.len(), 16);

        let mut handles = Vec::new();
        for task in tasks {
            let executor = h.executor.clone();
            handles.push(tokio::spawn(async move {
                let message = ExecutorMessage::WorkerTaskResult(WorkerTaskResult {
                    task_run: finished(&task.task_run, StateType::Success),
                });
                // deliver twice to mix redeliveries into the race
                executor.handle(message.clone()).await.unwrap();
                executor.handle(message).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = h.execution(&execution.id).await;
        assert_eq!(stored.current(), StateType::Success);
        assert_eq!(stored.task_run_list.len(), 17);
        assert!(stored
            .task_run_list
            .iter()
            .all(|run| run.current() == StateType::Success));

        let events: Vec<Execution> = h.queue.take(EXECUTION_EVENTS_TOPIC);
        let finished_events = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(finished_events, 1);
    }

    #[test]
    fn test_metrics_recorded() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        ::metrics::with_local_recorder(&recorder, || {
            tokio_test::block_on(async {
                let h = Harness::new(&[SEQUENTIAL]).await;
                h.executor.submit_flow(None, "ns", "seq", Map::new()).await.unwrap();
                h.drain().await;
                h.work(StateType::Success).await;
                h.work(StateType::Success).await;
            })
        });

        use crate::metrics::testing::counter;
        assert_eq!(
            counter(&snapshotter, crate::metrics::MESSAGES, &[("kind", "execution"), ("outcome", "applied")]),
            1
        );
        assert_eq!(
            counter(&snapshotter, crate::metrics::MESSAGES, &[("kind", "worker_task_result")]),
            2
        );
        assert_eq!(
            counter(&snapshotter, crate::metrics::TASKRUN_TRANSITIONS, &[("task", "a"), ("state", "SUCCESS")]),
            1
        );
        assert_eq!(
            counter(&snapshotter, crate::metrics::EXECUTION_TRANSITIONS, &[("state", "SUCCESS")]),
            1
        );
    }

    #[tokio::test]
    async fn test_loop_over_memory_queue() {
        struct EchoWorker {
            queue: Arc<MemoryQueue>,
        }

        #[async_trait]
        impl MessageHandler for EchoWorker {
            async fn handle(&self, key: &str, payload: &[u8]) -> ExecutorResult<()> {
                let task: WorkerTask = serde_json::from_slice(payload)?;
                let message = ExecutorMessage::WorkerTaskResult(WorkerTaskResult {
                    task_run: finished(&task.task_run, StateType::Success),
                });
                publish_json(&*self.queue, EXECUTOR_TOPIC, key, &message).await
            }
        }

        let store = Arc::new(MemoryExecutionStore::new());
        let queue = Arc::new(MemoryQueue::new(4));
        let flows = Arc::new(MemoryFlowRepository::new());
        flows.save(parse_flow(SEQUENTIAL).unwrap()).await.unwrap();

        let executor = Arc::new(Executor::new(store.clone(), queue.clone(), flows));
        let loop_subscription = executor.clone().run("test").await.unwrap();
        let worker_subscription = queue
            .subscribe(
                WORKER_TASKS_TOPIC,
                "workers",
                Arc::new(EchoWorker {
                    queue: queue.clone(),
                }),
            )
            .await
            .unwrap();

        let execution = executor.submit_flow(None, "ns", "seq", Map::new()).await.unwrap();

        let mut state = StateType::Created;
        for _ in 0..200 {
            state = store.find(&execution.id).await.unwrap().unwrap().current();
            if state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, StateType::Success);

        loop_subscription.shutdown();
        worker_subscription.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_payload_is_acked() {
        let h = Harness::new(&[]).await;
        let handler = ExecutorHandler {
            executor: h.executor.clone(),
        };
        assert!(handler.handle("k", b"not json").await.is_ok());
    }
}
