//! NATS JetStream queue.
//!
//! Topic `t` partition `p` maps to subject `{prefix}.t.{p}`. One stream
//! captures `{prefix}.>`; each subscription creates one durable pull
//! consumer per partition, consumed by its own task, so a partition is never
//! processed concurrently within a group.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull::Config as ConsumerConfig, AckKind, Context};
use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;

use super::{partition_for, MessageHandler, Queue, Subscription};
use crate::error::{ExecutorError, ExecutorResult};

/// Header carrying the message key.
const KEY_HEADER: &str = "Floe-Key";

/// Redeliveries before JetStream gives up on a message.
const MAX_DELIVER: i64 = 10;

/// Errors that can occur during NATS operations.
#[derive(Debug, Error)]
pub enum NatsError {
    #[error("NATS connection error: {0}")]
    Connection(String),

    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Consumer error: {0}")]
    Consumer(String),
}

impl From<NatsError> for ExecutorError {
    fn from(err: NatsError) -> Self {
        ExecutorError::Queue(err.to_string())
    }
}

/// JetStream-backed [`Queue`].
#[derive(Clone)]
pub struct NatsQueue {
    js: Context,
    stream: String,
    prefix: String,
    partitions: usize,
}

impl NatsQueue {
    /// Connect and make sure the stream exists.
    pub async fn connect(
        nats_url: &str,
        stream: &str,
        prefix: &str,
        partitions: usize,
    ) -> Result<Self, NatsError> {
        let client = async_nats::connect(nats_url)
            .await
            .map_err(|e| NatsError::Connection(e.to_string()))?;
        tracing::info!(url = %nats_url, "Connected to NATS");

        let js = jetstream::new(client);
        Self::ensure_stream(&js, stream, prefix).await?;

        Ok(Self {
            js,
            stream: stream.to_string(),
            prefix: prefix.to_string(),
            partitions: partitions.max(1),
        })
    }

    async fn ensure_stream(js: &Context, stream: &str, prefix: &str) -> Result<(), NatsError> {
        match js.get_stream(stream).await {
            Ok(_) => {
                tracing::debug!(stream = %stream, "Using existing NATS stream");
                Ok(())
            }
            Err(_) => {
                let config = jetstream::stream::Config {
                    name: stream.to_string(),
                    subjects: vec![format!("{}.>", prefix)],
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                };

                js.create_stream(config)
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;

                tracing::info!(stream = %stream, prefix = %prefix, "Created NATS stream");
                Ok(())
            }
        }
    }

    fn subject(&self, topic: &str, partition: usize) -> String {
        format!("{}.{}.{}", self.prefix, topic, partition)
    }

    async fn ensure_consumer(
        &self,
        name: &str,
        subject: &str,
    ) -> Result<jetstream::consumer::Consumer<ConsumerConfig>, NatsError> {
        let stream = self
            .js
            .get_stream(&self.stream)
            .await
            .map_err(|e| NatsError::JetStream(e.to_string()))?;

        match stream.get_consumer(name).await {
            Ok(consumer) => Ok(consumer),
            Err(_) => {
                let config = ConsumerConfig {
                    durable_name: Some(name.to_string()),
                    filter_subject: subject.to_string(),
                    max_deliver: MAX_DELIVER,
                    ..Default::default()
                };
                let consumer = stream
                    .create_consumer(config)
                    .await
                    .map_err(|e| NatsError::Consumer(e.to_string()))?;
                tracing::info!(consumer = %name, subject = %subject, "Created NATS consumer");
                Ok(consumer)
            }
        }
    }
}

#[async_trait]
impl Queue for NatsQueue {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> ExecutorResult<()> {
        let subject = self.subject(topic, partition_for(key, self.partitions));

        let mut headers = HeaderMap::new();
        headers.insert(KEY_HEADER, key);

        self.js
            .publish_with_headers(subject, headers, payload.into())
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> ExecutorResult<Subscription> {
        let mut handles = Vec::with_capacity(self.partitions);

        for partition in 0..self.partitions {
            let subject = self.subject(topic, partition);
            let name = format!("{}-{}-{}", group, topic, partition);
            let consumer = self.ensure_consumer(&name, &subject).await?;
            let handler = handler.clone();

            handles.push(tokio::spawn(async move {
                consume(consumer, handler, name).await;
            }));
        }

        tracing::debug!(topic = %topic, group = %group, partitions = self.partitions, "Subscribed");

        Ok(Subscription::new(handles))
    }
}

/// Pull messages for one partition, one at a time.
async fn consume(
    consumer: jetstream::consumer::Consumer<ConsumerConfig>,
    handler: Arc<dyn MessageHandler>,
    name: String,
) {
    loop {
        let batch = consumer
            .batch()
            .max_messages(1)
            .expires(Duration::from_secs(5))
            .messages()
            .await;

        let mut messages = match batch {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(consumer = %name, error = %e, "Fetch failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(consumer = %name, error = %e, "Failed to receive message");
                    continue;
                }
            };

            let key = message
                .headers
                .as_ref()
                .and_then(|headers| headers.get(KEY_HEADER))
                .map(|value| value.as_str().to_string())
                .unwrap_or_default();

            let ack = match handler.handle(&key, &message.payload).await {
                Ok(()) => message.ack().await,
                Err(e) => {
                    tracing::warn!(consumer = %name, key = %key, error = %e, "Message handling failed");
                    message.ack_with(AckKind::Nak(None)).await
                }
            };

            if let Err(e) = ack {
                tracing::warn!(consumer = %name, error = %e, "Failed to acknowledge message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nats_error_into_queue_error() {
        let err: ExecutorError = NatsError::Publish("no responders".to_string()).into();
        assert!(matches!(err, ExecutorError::Queue(_)));
        assert!(err.is_transient());
    }
}
