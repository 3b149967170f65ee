//! In-memory flow repository and directory loader.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use floe_core::flow::{parse_flow, Flow};
use tokio::sync::RwLock;

use super::FlowRepository;
use crate::error::{ExecutorError, ExecutorResult};

type FlowKey = (Option<String>, String, String);

/// Every revision of every flow, in memory.
#[derive(Default)]
pub struct MemoryFlowRepository {
    flows: RwLock<HashMap<FlowKey, BTreeMap<u32, Arc<Flow>>>>,
}

impl MemoryFlowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(tenant_id: Option<&str>, namespace: &str, flow_id: &str) -> FlowKey {
    (
        tenant_id.map(str::to_string),
        namespace.to_string(),
        flow_id.to_string(),
    )
}

#[async_trait]
impl FlowRepository for MemoryFlowRepository {
    async fn find_by_id(
        &self,
        tenant_id: Option<&str>,
        namespace: &str,
        flow_id: &str,
        revision: Option<u32>,
    ) -> ExecutorResult<Option<Arc<Flow>>> {
        let flows = self.flows.read().await;
        let Some(revisions) = flows.get(&key(tenant_id, namespace, flow_id)) else {
            return Ok(None);
        };

        let flow = match revision {
            Some(revision) => revisions.get(&revision),
            None => revisions.values().next_back(),
        };
        Ok(flow.cloned())
    }

    async fn save(&self, mut flow: Flow) -> ExecutorResult<Arc<Flow>> {
        let mut flows = self.flows.write().await;
        let revisions = flows
            .entry(key(flow.tenant_id.as_deref(), &flow.namespace, &flow.id))
            .or_default();

        let revision = match flow.revision {
            Some(revision) if revisions.contains_key(&revision) => {
                return Err(ExecutorError::Conflict(format!(
                    "flow '{}' revision {} already exists",
                    flow.uid_without_revision(),
                    revision
                )));
            }
            Some(revision) => revision,
            None => revisions.keys().next_back().map_or(1, |last| last + 1),
        };

        flow.revision = Some(revision);
        let flow = Arc::new(flow);
        revisions.insert(revision, flow.clone());

        tracing::debug!(
            namespace = %flow.namespace,
            flow_id = %flow.id,
            revision,
            "Flow saved"
        );

        Ok(flow)
    }
}

/// Parse and save every `*.yml` / `*.yaml` file of `dir`, in file name order.
///
/// Returns the number of flows loaded. A file that does not parse aborts the
/// load.
pub async fn load_dir(repository: &dyn FlowRepository, dir: impl AsRef<Path>) -> ExecutorResult<usize> {
    let dir = dir.as_ref();
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yml" || ext == "yaml");
        if is_yaml {
            paths.push(path);
        }
    }
    paths.sort();

    for path in &paths {
        let source = tokio::fs::read_to_string(path).await?;
        let flow = parse_flow(&source).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Invalid flow file");
            e
        })?;
        let saved = repository.save(flow).await?;
        tracing::info!(
            path = %path.display(),
            flow = %saved.uid(),
            "Loaded flow"
        );
    }

    Ok(paths.len())
}
