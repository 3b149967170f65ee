//! PostgreSQL connectivity.

mod pool;

pub use pool::{create_pool, health_check, DbPool};
