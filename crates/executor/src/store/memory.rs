//! In-memory execution store.
//!
//! Meant for development and tests. Everything lives in process memory and is
//! lost on restart; terminal executions stay until [`MemoryExecutionStore::evict_terminal`]
//! removes them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use floe_core::models::Execution;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{ExecutionLock, ExecutionStore};
use crate::error::{ExecutorError, ExecutorResult};

/// Executions held in process memory, one mutex per execution.
#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: RwLock<HashMap<String, Arc<Mutex<Execution>>>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.is_empty()
    }

    /// Drop terminal executions that ended before `before`. Returns how many
    /// were removed. Locked executions are kept.
    pub async fn evict_terminal(&self, before: DateTime<Utc>) -> usize {
        let mut executions = self.executions.write().await;
        let size = executions.len();
        executions.retain(|_, entry| match entry.try_lock() {
            Ok(execution) => {
                let ended = execution.state.end_date().is_some_and(|end| end < before);
                !(execution.is_terminal() && ended)
            }
            Err(_) => true,
        });
        size - executions.len()
    }

    async fn entry(&self, id: &str) -> Option<Arc<Mutex<Execution>>> {
        self.executions.read().await.get(id).cloned()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, execution: &Execution) -> ExecutorResult<()> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(ExecutorError::Conflict(format!(
                "execution '{}' already exists",
                execution.id
            )));
        }
        executions.insert(
            execution.id.clone(),
            Arc::new(Mutex::new(execution.clone())),
        );
        Ok(())
    }

    async fn find(&self, id: &str) -> ExecutorResult<Option<Execution>> {
        let Some(entry) = self.entry(id).await else {
            return Ok(None);
        };
        let execution = entry.lock().await.clone();
        Ok(Some(execution))
    }

    async fn lock(&self, id: &str) -> ExecutorResult<Option<Box<dyn ExecutionLock>>> {
        let Some(entry) = self.entry(id).await else {
            return Ok(None);
        };
        let guard = entry.lock_owned().await;
        Ok(Some(Box::new(MemoryLock {
            guard,
            pending: None,
        })))
    }
}

/// Saves are staged and only written through on release, so a lock dropped
/// early leaves the stored snapshot untouched.
struct MemoryLock {
    guard: OwnedMutexGuard<Execution>,
    pending: Option<Execution>,
}

#[async_trait]
impl ExecutionLock for MemoryLock {
    fn execution(&self) -> &Execution {
        self.pending.as_ref().unwrap_or(&self.guard)
    }

    async fn save(&mut self, execution: Execution) -> ExecutorResult<()> {
        self.pending = Some(execution);
        Ok(())
    }

    async fn release(mut self: Box<Self>) -> ExecutorResult<()> {
        if let Some(execution) = self.pending.take() {
            *self.guard = execution;
        }
        Ok(())
    }
}
