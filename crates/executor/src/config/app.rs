//! Executor service configuration.

use serde::Deserialize;

/// Execution store implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

/// Queue implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    Nats,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Executor configuration loaded from environment variables.
///
/// Environment variables are prefixed with `FLOE_`:
/// - `FLOE_NATS_URL`: NATS server URL (default: "nats://localhost:4222")
/// - `FLOE_STREAM`: JetStream stream name (default: "floe")
/// - `FLOE_SUBJECT_PREFIX`: Subject prefix for every topic (default: "floe")
/// - `FLOE_PARTITIONS`: Partitions per topic (default: 8)
/// - `FLOE_STORE`: `memory` or `postgres` (default: memory)
/// - `FLOE_QUEUE`: `memory` or `nats` (default: memory)
/// - `FLOE_FLOWS_DIR`: Directory of flow YAML files loaded at startup
/// - `FLOE_CONSUMER_GROUP`: Durable consumer group name (default: "floe-executor")
/// - `FLOE_LOG_FORMAT`: `text` or `json` (default: text)
/// - `FLOE_MEMORY_RETENTION_SECS`: How long the memory store keeps finished
///   executions (default: 3600)
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    #[serde(default = "default_stream")]
    pub stream: String,

    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    /// Number of partitions per topic; messages with the same key always
    /// land on the same partition.
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    #[serde(default)]
    pub store: StoreBackend,

    #[serde(default)]
    pub queue: QueueBackend,

    #[serde(default)]
    pub flows_dir: Option<String>,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default = "default_memory_retention_secs")]
    pub memory_retention_secs: u64,
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_stream() -> String {
    "floe".to_string()
}

fn default_subject_prefix() -> String {
    "floe".to_string()
}

fn default_partitions() -> usize {
    8
}

fn default_memory_retention_secs() -> u64 {
    3600
}

fn default_consumer_group() -> String {
    "floe-executor".to_string()
}

impl ExecutorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `FLOE_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("FLOE_").from_env::<ExecutorConfig>()
    }

    /// Partition count, never zero.
    pub fn partition_count(&self) -> usize {
        self.partitions.max(1)
    }

    pub fn memory_retention(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.memory_retention_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            nats_url: default_nats_url(),
            stream: default_stream(),
            subject_prefix: default_subject_prefix(),
            partitions: default_partitions(),
            store: StoreBackend::default(),
            queue: QueueBackend::default(),
            flows_dir: None,
            consumer_group: default_consumer_group(),
            log_format: LogFormat::default(),
            memory_retention_secs: default_memory_retention_secs(),
        }
    }
}
