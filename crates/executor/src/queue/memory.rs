//! In-process queue.
//!
//! Every topic owns one unbounded channel per partition. Messages published
//! before anyone subscribes are buffered. A topic is consumed by a single
//! group; subscribing a second group fails.
//!
//! Meant for development and tests: channels are unbounded, so a topic nobody
//! consumes grows until the process exits unless it is marked with
//! [`MemoryQueue::discard`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{partition_for, MessageHandler, Queue, Subscription};
use crate::error::{ExecutorError, ExecutorResult};

type Envelope = (String, Vec<u8>);

/// Deliveries of one message before it is dropped.
const MAX_DELIVERIES: u32 = 5;

struct Topic {
    senders: Vec<mpsc::UnboundedSender<Envelope>>,
    receivers: Option<Vec<mpsc::UnboundedReceiver<Envelope>>>,
    discarded: bool,
}

impl Topic {
    fn new(partitions: usize) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..partitions).map(|_| mpsc::unbounded_channel()).unzip();
        Self {
            senders,
            receivers: Some(receivers),
            discarded: false,
        }
    }
}

/// In-memory [`Queue`].
pub struct MemoryQueue {
    partitions: usize,
    retry_delay: Duration,
    topics: Mutex<HashMap<String, Topic>>,
}

impl MemoryQueue {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            retry_delay: Duration::from_millis(50),
            topics: Mutex::new(HashMap::new()),
        }
    }
}

impl MemoryQueue {
    /// Drop everything published to `topic` from now on, buffered messages
    /// included. For topics this process never consumes.
    pub async fn discard(&self, topic: &str) {
        let mut topics = self.topics.lock().await;
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(self.partitions));
        entry.discarded = true;
        entry.receivers = None;
        tracing::debug!(topic = %topic, "Topic discarded");
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> ExecutorResult<()> {
        let mut topics = self.topics.lock().await;
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(self.partitions));
        if entry.discarded {
            return Ok(());
        }

        let partition = partition_for(key, self.partitions);
        entry.senders[partition]
            .send((key.to_string(), payload))
            .map_err(|_| ExecutorError::Queue(format!("topic '{}' is closed", topic)))
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> ExecutorResult<Subscription> {
        let receivers = {
            let mut topics = self.topics.lock().await;
            let entry = topics
                .entry(topic.to_string())
                .or_insert_with(|| Topic::new(self.partitions));
            if entry.discarded {
                return Err(ExecutorError::Queue(format!("topic '{}' is discarded", topic)));
            }
            entry.receivers.take().ok_or_else(|| {
                ExecutorError::Queue(format!("topic '{}' already has a consumer", topic))
            })?
        };

        let handles = receivers
            .into_iter()
            .enumerate()
            .map(|(partition, mut rx)| {
                let handler = handler.clone();
                let topic = topic.to_string();
                let group = group.to_string();
                let retry_delay = self.retry_delay;

                tokio::spawn(async move {
                    while let Some((key, payload)) = rx.recv().await {
                        deliver(&*handler, &topic, &group, partition, &key, &payload, retry_delay)
                            .await;
                    }
                })
            })
            .collect();

        tracing::debug!(topic = %topic, group = %group, partitions = self.partitions, "Subscribed");

        Ok(Subscription::new(handles))
    }
}

async fn deliver(
    handler: &dyn MessageHandler,
    topic: &str,
    group: &str,
    partition: usize,
    key: &str,
    payload: &[u8],
    retry_delay: Duration,
) {
    for attempt in 1..=MAX_DELIVERIES {
        match handler.handle(key, payload).await {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(
                    topic = %topic,
                    group = %group,
                    partition,
                    key = %key,
                    attempt,
                    error = %e,
                    "Message handling failed"
                );
                tokio::time::sleep(retry_delay).await;
            }
        }
    }

    tracing::error!(
        topic = %topic,
        group = %group,
        key = %key,
        "Message dropped after {} deliveries",
        MAX_DELIVERIES
    );
}
