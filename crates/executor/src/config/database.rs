//! PostgreSQL settings for the execution store.

use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;

/// Store database settings, read from `POSTGRES_*` variables.
///
/// - `POSTGRES_HOST` (default "localhost"), `POSTGRES_PORT` (default 5432)
/// - `POSTGRES_USER` and `POSTGRES_DATABASE` (default "floe"), `POSTGRES_PASSWORD`
/// - `POSTGRES_POOL_SIZE`: connections held by the executor (default 10)
/// - `POSTGRES_ACQUIRE_TIMEOUT_SECS`: wait for a free connection (default 30)
/// - `POSTGRES_LOCK_TIMEOUT_MS`: wait for an execution row lock before the
///   message is redelivered (default 5000)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub pool_size: u32,
    pub acquire_timeout_secs: u64,
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "floe".to_string(),
            password: String::new(),
            database: "floe".to_string(),
            pool_size: 10,
            acquire_timeout_secs: 30,
            lock_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("POSTGRES_").from_env::<DatabaseConfig>()
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Connection URL with the password masked, for logs.
    pub fn redacted_url(&self) -> String {
        format!(
            "postgres://{}:***@{}:{}/{}",
            self.user, self.host, self.port, self.database
        )
    }
}
