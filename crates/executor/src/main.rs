//! Floe Executor
//!
//! Runs the reconciliation loop, validates flow files and submits
//! executions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use floe_core::flow::parse_flow;
use floe_executor::{
    config::{DatabaseConfig, ExecutorConfig, LogFormat, QueueBackend, StoreBackend},
    db::create_pool,
    queue::{
        MemoryQueue, NatsQueue, Queue, EXECUTION_EVENTS_TOPIC, WORKER_KILLS_TOPIC,
        WORKER_TASKS_TOPIC,
    },
    repository::{load_dir, FlowRepository, MemoryFlowRepository},
    store::{ExecutionStore, MemoryExecutionStore, PostgresExecutionStore},
    Executor,
};

#[derive(Parser)]
#[command(name = "floe-executor")]
#[command(version, about = "Floe flow execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the executor loop until Ctrl+C or SIGTERM
    Serve,

    /// Parse and validate a flow file
    Validate {
        /// Flow YAML file
        file: PathBuf,
    },

    /// Submit an execution of the latest revision of a flow
    ///
    /// Examples:
    ///     floe-executor submit --namespace company.team --flow-id hello
    ///     floe-executor submit --namespace company.team --flow-id hello --input who=world
    #[command(verbatim_doc_comment)]
    Submit {
        #[arg(long)]
        namespace: String,

        #[arg(long)]
        flow_id: String,

        /// Input as KEY=VALUE; VALUE is parsed as JSON when possible
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },
}

/// Initialize tracing/logging.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,floe_executor=debug,floe_core=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

fn parse_inputs(raw: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("input '{}' is not KEY=VALUE", pair);
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}

async fn build_store(config: &ExecutorConfig) -> anyhow::Result<Arc<dyn ExecutionStore>> {
    match config.store {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory execution store, executions are lost on exit");
            let store = Arc::new(MemoryExecutionStore::new());
            spawn_eviction(store.clone(), config.memory_retention());
            Ok(store)
        }
        StoreBackend::Postgres => {
            let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load database config, using defaults");
                DatabaseConfig::default()
            });
            let pool = create_pool(&db_config).await?;
            let store = PostgresExecutionStore::new(pool, db_config.lock_timeout());
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Periodically drop finished executions older than `retention`.
fn spawn_eviction(store: Arc<MemoryExecutionStore>, retention: std::time::Duration) {
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        tracing::warn!("Memory retention out of range, eviction disabled");
        return;
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let evicted = store.evict_terminal(chrono::Utc::now() - retention).await;
            if evicted > 0 {
                tracing::debug!(evicted, "Evicted finished executions");
            }
        }
    });
}

async fn build_queue(config: &ExecutorConfig) -> anyhow::Result<Arc<dyn Queue>> {
    match config.queue {
        QueueBackend::Memory => {
            let queue = MemoryQueue::new(config.partition_count());
            // no worker or listener runs in this process
            for topic in [WORKER_TASKS_TOPIC, WORKER_KILLS_TOPIC, EXECUTION_EVENTS_TOPIC] {
                queue.discard(topic).await;
            }
            tracing::warn!("Using the in-memory queue, worker tasks and events are dropped");
            Ok(Arc::new(queue))
        }
        QueueBackend::Nats => {
            let queue = NatsQueue::connect(
                &config.nats_url,
                &config.stream,
                &config.subject_prefix,
                config.partition_count(),
            )
            .await?;
            Ok(Arc::new(queue))
        }
    }
}

async fn build_repository(config: &ExecutorConfig) -> anyhow::Result<Arc<dyn FlowRepository>> {
    let repository = Arc::new(MemoryFlowRepository::new());
    if let Some(ref dir) = config.flows_dir {
        let count = load_dir(repository.as_ref(), dir)
            .await
            .with_context(|| format!("loading flows from {}", dir))?;
        tracing::info!(dir = %dir, count, "Flows loaded");
    } else {
        tracing::warn!("FLOE_FLOWS_DIR not set, no flows loaded");
    }
    Ok(repository)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = ExecutorConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Failed to load executor config, using defaults: {}", e);
        ExecutorConfig::default()
    });

    init_tracing(config.log_format);

    match cli.command {
        Command::Validate { file } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let flow = parse_flow(&content)?;
            println!(
                "{}.{}: valid, {} tasks",
                flow.namespace,
                flow.id,
                flow.all_tasks().len()
            );
        }

        Command::Submit {
            namespace,
            flow_id,
            inputs,
        } => {
            if config.store == StoreBackend::Memory || config.queue == QueueBackend::Memory {
                tracing::warn!("Submitting against in-memory backends, nothing else will see this execution");
            }
            let inputs = parse_inputs(&inputs)?;
            let executor = Executor::new(
                build_store(&config).await?,
                build_queue(&config).await?,
                build_repository(&config).await?,
            );
            let execution = executor
                .submit_flow(None, &namespace, &flow_id, inputs)
                .await?;
            println!("{}", execution.id);
        }

        Command::Serve => {
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                store = ?config.store,
                queue = ?config.queue,
                partitions = config.partition_count(),
                "Starting Floe executor"
            );

            let executor = Arc::new(Executor::new(
                build_store(&config).await?,
                build_queue(&config).await?,
                build_repository(&config).await?,
            ));

            let subscription = executor.run(&config.consumer_group).await?;

            shutdown_signal().await;
            subscription.shutdown();

            tracing::info!("Executor shutdown complete");
        }
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
