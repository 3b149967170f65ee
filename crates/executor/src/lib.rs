//! Floe Executor
//!
//! The reconciliation loop service for flow executions. It consumes the
//! executor topic, keeps a single reconciler per execution through the
//! execution store lock, and publishes worker tasks, kill notices, subflow
//! executions and execution events.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: PostgreSQL connection pool
//! - [`error`]: Error types
//! - [`executor`]: The executor loop
//! - [`metrics`]: Transition and message counters
//! - [`queue`]: Partitioned queues (NATS JetStream; in-memory for development)
//! - [`repository`]: Flow definitions
//! - [`store`]: Execution storage (PostgreSQL; in-memory for development)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use floe_executor::{
//!     queue::MemoryQueue, repository::MemoryFlowRepository, store::MemoryExecutionStore, Executor,
//! };
//!
//! let executor = Arc::new(Executor::new(
//!     Arc::new(MemoryExecutionStore::new()),
//!     Arc::new(MemoryQueue::default()),
//!     Arc::new(MemoryFlowRepository::new()),
//! ));
//! let subscription = executor.clone().run("floe-executor").await?;
//! executor.submit_flow(None, "company.team", "hello", serde_json::Map::new()).await?;
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod queue;
pub mod repository;
pub mod result_ext;
pub mod store;

pub use error::{ExecutorError, ExecutorResult};
pub use executor::Executor;
pub use result_ext::ResultExt;
