//! Configuration for the Floe executor.
//!
//! Loaded from environment variables with the `envy` crate; a `.env` file is
//! honoured by the binary through `dotenvy`.

mod app;
mod database;

pub use app::{ExecutorConfig, LogFormat, QueueBackend, StoreBackend};
pub use database::DatabaseConfig;
