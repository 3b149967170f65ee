//! Connection pool for the PostgreSQL execution store.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;

pub type DbPool = PgPool;

/// Connect and verify the database answers.
///
/// Every reconciliation holds one connection for the lifetime of its
/// execution lock, so the pool size bounds concurrent reconciliations.
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(config.acquire_timeout())
        .connect_with(config.connect_options())
        .await?;

    health_check(&pool).await?;

    tracing::info!(
        url = %config.redacted_url(),
        pool_size = config.pool_size,
        "Execution store database connected"
    );

    Ok(pool)
}

pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}
