//! Execution engine.
//!
//! - **Aggregate**: Folds child states into a parent state
//! - **Resolver**: Decides which children a composite schedules next
//! - **Reconciler**: One pure pass over an execution snapshot
//! - **Kill**: Propagates kill requests down the task run tree
//! - **Subflow**: Maps child executions back onto their parent task
//! - **Commands**: Builds worker tasks for runnable leaves

pub mod aggregate;
pub mod commands;
pub mod kill;
pub mod reconciler;
pub mod resolver;
pub mod subflow;
pub mod variables;

pub use aggregate::{aggregate, ChildState};
pub use commands::WorkerTaskBuilder;
pub use kill::{kill, KillOutcome};
pub use reconciler::{Reconciler, Reconciliation};
pub use resolver::{is_truthy, Ordering, ResolvedTask, Scope, ScopeDecision};
pub use subflow::{apply_subflow_result, child_outputs, subflow_result, subflow_state};
pub use variables::run_variables;
