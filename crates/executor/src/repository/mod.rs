//! Flow definitions.
//!
//! Executions pin the flow revision they were created from; the loop looks
//! the exact revision up on every message.

mod memory;

pub use memory::{load_dir, MemoryFlowRepository};

use std::sync::Arc;

use async_trait::async_trait;
use floe_core::flow::Flow;
use floe_core::models::Execution;

use crate::error::ExecutorResult;

/// Read access to flow definitions.
#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// A flow by id; the latest revision when `revision` is `None`.
    async fn find_by_id(
        &self,
        tenant_id: Option<&str>,
        namespace: &str,
        flow_id: &str,
        revision: Option<u32>,
    ) -> ExecutorResult<Option<Arc<Flow>>>;

    /// The flow revision `execution` was created from.
    async fn find_by_execution(&self, execution: &Execution) -> ExecutorResult<Option<Arc<Flow>>> {
        self.find_by_id(
            execution.tenant_id.as_deref(),
            &execution.namespace,
            &execution.flow_id,
            Some(execution.flow_revision),
        )
        .await
    }

    /// Store a flow. A missing revision becomes the next one.
    async fn save(&self, flow: Flow) -> ExecutorResult<Arc<Flow>>;
}
