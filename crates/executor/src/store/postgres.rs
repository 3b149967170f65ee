//! PostgreSQL execution store.
//!
//! Executions are kept as JSONB documents. Locking is a row lock taken with
//! `SELECT ... FOR UPDATE` inside a transaction that lives as long as the
//! [`ExecutionLock`].

use std::time::Duration;

use async_trait::async_trait;
use floe_core::models::Execution;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};

use super::{ExecutionLock, ExecutionStore};
use crate::db::DbPool;
use crate::error::{ExecutorError, ExecutorResult};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS floe_executions (
    id TEXT PRIMARY KEY,
    namespace TEXT NOT NULL,
    flow_id TEXT NOT NULL,
    state TEXT NOT NULL,
    body JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS floe_executions_flow_idx
    ON floe_executions (namespace, flow_id)
"#;

/// Executions stored in PostgreSQL.
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: DbPool,
    lock_timeout: Duration,
}

impl PostgresExecutionStore {
    /// `lock_timeout` bounds the wait for a row lock held by another
    /// reconciler; the message fails and is redelivered when it expires.
    pub fn new(pool: DbPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Create the executions table if needed.
    pub async fn migrate(&self) -> ExecutorResult<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        tracing::info!("Execution store schema ready");
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    async fn insert(&self, execution: &Execution) -> ExecutorResult<()> {
        let result = sqlx::query(
            "INSERT INTO floe_executions (id, namespace, flow_id, state, body) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO NOTHING",
        )
        .bind(&execution.id)
        .bind(&execution.namespace)
        .bind(&execution.flow_id)
        .bind(execution.current().as_str())
        .bind(Json(execution))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ExecutorError::Conflict(format!(
                "execution '{}' already exists",
                execution.id
            )));
        }
        Ok(())
    }

    async fn find(&self, id: &str) -> ExecutorResult<Option<Execution>> {
        let row: Option<Json<Execution>> =
            sqlx::query_scalar("SELECT body FROM floe_executions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|Json(execution)| execution))
    }

    async fn lock(&self, id: &str) -> ExecutorResult<Option<Box<dyn ExecutionLock>>> {
        let mut tx = self.pool.begin().await?;

        // SET does not take bind parameters
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = {}",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        let row: Option<Json<Execution>> =
            sqlx::query_scalar("SELECT body FROM floe_executions WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        match row {
            Some(Json(execution)) => Ok(Some(Box::new(PostgresLock { tx, execution }))),
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }
}

struct PostgresLock {
    tx: Transaction<'static, Postgres>,
    execution: Execution,
}

#[async_trait]
impl ExecutionLock for PostgresLock {
    fn execution(&self) -> &Execution {
        &self.execution
    }

    async fn save(&mut self, execution: Execution) -> ExecutorResult<()> {
        sqlx::query(
            "UPDATE floe_executions SET state = $2, body = $3, updated_at = now() WHERE id = $1",
        )
        .bind(&execution.id)
        .bind(execution.current().as_str())
        .bind(Json(&execution))
        .execute(&mut *self.tx)
        .await?;

        self.execution = execution;
        Ok(())
    }

    async fn release(self: Box<Self>) -> ExecutorResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
