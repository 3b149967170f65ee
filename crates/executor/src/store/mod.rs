//! Execution storage.
//!
//! The executor reads and writes executions only through
//! [`ExecutionStore`]. [`ExecutionStore::lock`] hands out exclusive access to
//! one execution: while an [`ExecutionLock`] is held, no other holder can
//! observe or change that execution, which is what keeps a single reconciler
//! per execution across threads and processes.

mod memory;
mod postgres;

pub use memory::MemoryExecutionStore;
pub use postgres::PostgresExecutionStore;

use async_trait::async_trait;
use floe_core::models::Execution;

use crate::error::ExecutorResult;

/// Storage for executions.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Store a new execution. Fails with a conflict when the id exists.
    async fn insert(&self, execution: &Execution) -> ExecutorResult<()>;

    /// Latest committed snapshot, without locking.
    async fn find(&self, id: &str) -> ExecutorResult<Option<Execution>>;

    /// Wait for exclusive access to an execution.
    ///
    /// Returns `None` when the execution does not exist.
    async fn lock(&self, id: &str) -> ExecutorResult<Option<Box<dyn ExecutionLock>>>;
}

/// Exclusive access to one execution.
///
/// Dropping the lock without [`ExecutionLock::release`] discards unsaved work
/// for transactional stores.
#[async_trait]
pub trait ExecutionLock: Send {
    /// Snapshot as of the last save.
    fn execution(&self) -> &Execution;

    /// Replace the stored snapshot.
    async fn save(&mut self, execution: Execution) -> ExecutorResult<()>;

    /// Commit and give up the lock.
    async fn release(self: Box<Self>) -> ExecutorResult<()>;
}
