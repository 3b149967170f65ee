//! Execution data model and messages.

pub mod execution;
pub mod messages;
pub mod task_run;

pub use execution::{Execution, MergeOutcome, ParentExecution};
pub use messages::{
    ExecutionKilled, ExecutorMessage, SubflowExecution, SubflowExecutionResult, TaskRunTransition,
    WorkerKill, WorkerTask, WorkerTaskResult,
};
pub use task_run::{TaskRun, TaskRunAttempt};
