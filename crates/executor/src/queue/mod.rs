//! Message queues.
//!
//! Topics are split into partitions by a stable hash of the message key, and
//! each partition is consumed by exactly one sequential consumer per group.
//! Messages sharing a key are therefore handled one at a time and in publish
//! order. Delivery is at-least-once: a message whose handler fails is offered
//! again.

mod memory;
mod nats;

pub use memory::MemoryQueue;
pub use nats::{NatsError, NatsQueue};

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::ExecutorResult;

/// Executor input: [`floe_core::models::ExecutorMessage`] keyed by execution id.
pub const EXECUTOR_TOPIC: &str = "executor";
/// Worker tasks to run.
pub const WORKER_TASKS_TOPIC: &str = "worker_tasks";
/// Kill notices for running worker tasks.
pub const WORKER_KILLS_TOPIC: &str = "worker_kills";
/// Execution snapshots after every persisted change.
pub const EXECUTION_EVENTS_TOPIC: &str = "execution_events";

/// Consumer callback.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message. An error asks for redelivery.
    async fn handle(&self, key: &str, payload: &[u8]) -> ExecutorResult<()>;
}

/// Partitioned, keyed message queue.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> ExecutorResult<()>;

    /// Start consuming `topic` as `group`.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> ExecutorResult<Subscription>;
}

/// Serialize `message` as JSON and publish it.
pub async fn publish_json<T: Serialize + Sync>(
    queue: &dyn Queue,
    topic: &str,
    key: &str,
    message: &T,
) -> ExecutorResult<()> {
    let payload = serde_json::to_vec(message)?;
    queue.publish(topic, key, payload).await
}

/// Running consumers of one subscription.
pub struct Subscription {
    handles: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(handles: Vec<JoinHandle<()>>) -> Self {
        Self { handles }
    }

    /// Stop every consumer of this subscription.
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Partition of `key` among `partitions` (FNV-1a, stable across processes).
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % partitions.max(1) as u64) as usize
}
