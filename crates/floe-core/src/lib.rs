//! Floe Core Library
//!
//! Pure building blocks of the Floe execution engine:
//!
//! - **Flow model**: Parse and validate YAML flow definitions
//! - **State machine**: Append-only state histories with checked transitions
//! - **Execution model**: Executions, task runs and the messages around them
//! - **Reconciliation**: Compute the next execution snapshot and its side effects
//!
//! Nothing in this crate performs I/O. The executor service owns storage,
//! queues and locking, and calls into [`engine::Reconciler`] under the
//! per-execution lock.
//!
//! ## Modules
//!
//! - [`flow`]: Flow and task definitions, parser and validation
//! - [`state`]: State types and histories
//! - [`models`]: Executions, task runs and executor messages
//! - [`engine`]: Resolver, reconciler, kill propagation and subflows
//! - [`template`]: Expression rendering
//! - [`error`]: Core error types
//!
//! ## Example
//!
//! ```ignore
//! use floe_core::{engine::Reconciler, flow::parse_flow, models::Execution};
//!
//! let flow = parse_flow(yaml)?;
//! let execution = Execution::new(&flow, Default::default());
//! let pass = Reconciler::new().reconcile(&flow, &execution);
//! for task in pass.worker_tasks {
//!     // publish to the worker queue
//! }
//! ```

pub mod engine;
pub mod error;
pub mod flow;
pub mod models;
pub mod state;
pub mod template;

pub use error::{CoreError, CoreResult};
