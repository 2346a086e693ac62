//! Graph store contract
//!
//! The flow graph needs a small capability set from its store: idempotent
//! node/edge upserts, the highest materialized output id, per-node edge
//! lookups in either direction, and bounded deletions. Everything is keyed
//! by ledger output id.
//!
//! # Consistency rules enforced by every implementation
//!
//! - Upserting an existing node or edge is a no-op
//! - An existing node upserted with different attributes is a
//!   `GraphConsistency` error
//! - Edge endpoints must exist (in the store or earlier in the same batch)
//! - Edges point forward: `from < to`
//! - `apply_batch` writes all or nothing

mod memory;
mod rocks;

pub use memory::MemoryFlowStore;
pub use rocks::RocksFlowStore;

use crate::{
    types::{Direction, FlowEdge, ValueNode},
    Error, Result,
};
use async_trait::async_trait;
use ledger_model::{AddressId, OutputId};

/// Buffered writes for one flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowBatch {
    /// Nodes to find-or-create
    pub nodes: Vec<ValueNode>,
    /// Edges to find-or-create, applied after all nodes
    pub edges: Vec<FlowEdge>,
}

impl FlowBatch {
    /// Create empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether there is nothing to write
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Total number of writes
    pub fn len(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }

    /// Drop all buffered writes
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
    }
}

/// Result of applying a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Nodes that did not exist before
    pub nodes_created: usize,
    /// Edges that did not exist before
    pub edges_created: usize,
}

/// Store statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Materialized nodes
    pub total_nodes: u64,
    /// Materialized edges
    pub total_edges: u64,
}

/// Value-flow graph storage
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Create the node unless it exists; true when created
    async fn upsert_node(&self, node: &ValueNode) -> Result<bool>;

    /// Create the edge unless the `(from, to)` pair exists; true when created
    async fn upsert_edge(&self, edge: &FlowEdge) -> Result<bool>;

    /// Apply nodes, then edges, atomically
    async fn apply_batch(&self, batch: &FlowBatch) -> Result<BatchOutcome>;

    /// Node by output id
    async fn node(&self, id: OutputId) -> Result<Option<ValueNode>>;

    /// Highest materialized output id
    async fn max_node_id(&self) -> Result<Option<OutputId>>;

    /// Edges of a node: incoming for `Sources`, outgoing for `Destinations`
    async fn edges(&self, id: OutputId, direction: Direction) -> Result<Vec<FlowEdge>>;

    /// All nodes owned by an address
    async fn nodes_of_address(&self, address: AddressId) -> Result<Vec<ValueNode>>;

    /// Remove every edge ending at `id`; returns the number removed
    async fn delete_edges_into(&self, id: OutputId) -> Result<usize>;

    /// Remove up to `limit` nodes (highest ids first) with their edges
    async fn delete_node_batch(&self, limit: usize) -> Result<usize>;

    /// Node and edge counts
    async fn stats(&self) -> Result<StoreStats>;

    /// Remove all nodes, `batch_size` at a time
    async fn delete_all_nodes(&self, batch_size: usize) -> Result<usize> {
        if batch_size == 0 {
            return Err(Error::Config("delete batch size must be positive".into()));
        }

        let mut total = 0;
        loop {
            let removed = self.delete_node_batch(batch_size).await?;
            total += removed;
            tracing::debug!(removed, total, "Deleted node batch");
            if removed < batch_size {
                return Ok(total);
            }
        }
    }
}

/// Reject edges that cannot belong to a ledger-ordered graph
pub(crate) fn check_edge_shape(edge: &FlowEdge) -> Result<()> {
    if edge.from == edge.to {
        return Err(Error::GraphConsistency(format!("self-loop on {}", edge.from)));
    }
    if edge.from > edge.to {
        return Err(Error::GraphConsistency(format!(
            "edge {} -> {} points backwards in ledger order",
            edge.from, edge.to
        )));
    }
    if edge.value.is_sign_negative() {
        return Err(Error::GraphConsistency(format!(
            "edge {} -> {} has negative value {}",
            edge.from, edge.to, edge.value
        )));
    }
    Ok(())
}

/// An existing node must match what is being upserted
pub(crate) fn check_same_node(existing: &ValueNode, incoming: &ValueNode) -> Result<()> {
    if existing != incoming {
        return Err(Error::GraphConsistency(format!(
            "{} already stored with different attributes ({:?} vs {:?})",
            incoming.output_id, existing, incoming
        )));
    }
    Ok(())
}
