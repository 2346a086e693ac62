//! In-memory flow graph
//!
//! Used as the snapshot a caller loads for tracing, and as the reference
//! implementation of `FlowStore` in tests.

use super::{check_edge_shape, check_same_node, BatchOutcome, FlowBatch, FlowStore, StoreStats};
use crate::{
    types::{Direction, FlowEdge, ValueNode},
    Error, Result,
};
use async_trait::async_trait;
use ledger_model::{AddressId, OutputId};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default)]
struct Graph {
    nodes: BTreeMap<OutputId, ValueNode>,
    /// from -> to -> value
    outgoing: HashMap<OutputId, BTreeMap<OutputId, Decimal>>,
    /// to -> from -> value
    incoming: HashMap<OutputId, BTreeMap<OutputId, Decimal>>,
    by_address: HashMap<AddressId, BTreeSet<OutputId>>,
    edge_count: u64,
}

impl Graph {
    fn insert_node(&mut self, node: &ValueNode) -> Result<bool> {
        if let Some(existing) = self.nodes.get(&node.output_id) {
            check_same_node(existing, node)?;
            return Ok(false);
        }
        if let Some(address) = node.address_id {
            self.by_address.entry(address).or_default().insert(node.output_id);
        }
        self.nodes.insert(node.output_id, node.clone());
        Ok(true)
    }

    fn insert_edge(&mut self, edge: &FlowEdge) -> Result<bool> {
        check_edge_shape(edge)?;
        for end in [edge.from, edge.to] {
            if !self.nodes.contains_key(&end) {
                return Err(dangling(edge, end));
            }
        }

        let out = self.outgoing.entry(edge.from).or_default();
        if out.contains_key(&edge.to) {
            return Ok(false);
        }
        out.insert(edge.to, edge.value);
        self.incoming.entry(edge.to).or_default().insert(edge.from, edge.value);
        self.edge_count += 1;
        Ok(true)
    }

    /// Everything `apply_batch` would reject, found before any write
    fn check_batch(&self, batch: &FlowBatch) -> Result<()> {
        let mut staged: HashMap<OutputId, &ValueNode> = HashMap::new();
        for node in &batch.nodes {
            let existing = self
                .nodes
                .get(&node.output_id)
                .or_else(|| staged.get(&node.output_id).copied());
            if let Some(existing) = existing {
                check_same_node(existing, node)?;
                continue;
            }
            staged.insert(node.output_id, node);
        }

        for edge in &batch.edges {
            check_edge_shape(edge)?;
            for end in [edge.from, edge.to] {
                if !self.nodes.contains_key(&end) && !staged.contains_key(&end) {
                    return Err(dangling(edge, end));
                }
            }
        }
        Ok(())
    }

    fn remove_edges_into(&mut self, id: OutputId) -> usize {
        let Some(sources) = self.incoming.remove(&id) else {
            return 0;
        };
        for from in sources.keys() {
            if let Some(out) = self.outgoing.get_mut(from) {
                out.remove(&id);
                if out.is_empty() {
                    self.outgoing.remove(from);
                }
            }
        }
        self.edge_count -= sources.len() as u64;
        sources.len()
    }

    fn remove_edges_from(&mut self, id: OutputId) {
        let Some(targets) = self.outgoing.remove(&id) else {
            return;
        };
        for to in targets.keys() {
            if let Some(inc) = self.incoming.get_mut(to) {
                inc.remove(&id);
                if inc.is_empty() {
                    self.incoming.remove(to);
                }
            }
        }
        self.edge_count -= targets.len() as u64;
    }

    fn edges(&self, id: OutputId, direction: Direction) -> Vec<FlowEdge> {
        match direction {
            Direction::Sources => self
                .incoming
                .get(&id)
                .map(|m| {
                    m.iter()
                        .map(|(from, value)| FlowEdge { from: *from, to: id, value: *value })
                        .collect()
                })
                .unwrap_or_default(),
            Direction::Destinations => self
                .outgoing
                .get(&id)
                .map(|m| {
                    m.iter()
                        .map(|(to, value)| FlowEdge { from: id, to: *to, value: *value })
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

fn dangling(edge: &FlowEdge, end: OutputId) -> Error {
    Error::GraphConsistency(format!(
        "edge {} -> {} references missing node {}",
        edge.from, edge.to, end
    ))
}

/// Flow graph held in memory
#[derive(Debug, Default)]
pub struct MemoryFlowStore {
    graph: RwLock<Graph>,
}

impl MemoryFlowStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from already-materialized nodes and edges
    pub fn from_parts(nodes: Vec<ValueNode>, edges: Vec<FlowEdge>) -> Result<Self> {
        let mut graph = Graph::default();
        for node in &nodes {
            graph.insert_node(node)?;
        }
        for edge in &edges {
            graph.insert_edge(edge)?;
        }
        Ok(Self {
            graph: RwLock::new(graph),
        })
    }

    /// Every edge, ordered by `(from, to)`
    pub fn all_edges(&self) -> Vec<FlowEdge> {
        let graph = self.graph.read();
        let mut edges: Vec<FlowEdge> = graph
            .outgoing
            .iter()
            .flat_map(|(from, targets)| {
                targets.iter().map(move |(to, value)| FlowEdge {
                    from: *from,
                    to: *to,
                    value: *value,
                })
            })
            .collect();
        edges.sort_by_key(|e| (e.from, e.to));
        edges
    }

    /// Every node, ordered by output id
    pub fn all_nodes(&self) -> Vec<ValueNode> {
        self.graph.read().nodes.values().cloned().collect()
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn upsert_node(&self, node: &ValueNode) -> Result<bool> {
        self.graph.write().insert_node(node)
    }

    async fn upsert_edge(&self, edge: &FlowEdge) -> Result<bool> {
        self.graph.write().insert_edge(edge)
    }

    async fn apply_batch(&self, batch: &FlowBatch) -> Result<BatchOutcome> {
        let mut graph = self.graph.write();
        graph.check_batch(batch)?;

        let mut outcome = BatchOutcome::default();
        for node in &batch.nodes {
            if graph.insert_node(node)? {
                outcome.nodes_created += 1;
            }
        }
        for edge in &batch.edges {
            if graph.insert_edge(edge)? {
                outcome.edges_created += 1;
            }
        }
        Ok(outcome)
    }

    async fn node(&self, id: OutputId) -> Result<Option<ValueNode>> {
        Ok(self.graph.read().nodes.get(&id).cloned())
    }

    async fn max_node_id(&self) -> Result<Option<OutputId>> {
        Ok(self.graph.read().nodes.keys().next_back().copied())
    }

    async fn edges(&self, id: OutputId, direction: Direction) -> Result<Vec<FlowEdge>> {
        Ok(self.graph.read().edges(id, direction))
    }

    async fn nodes_of_address(&self, address: AddressId) -> Result<Vec<ValueNode>> {
        let graph = self.graph.read();
        Ok(graph
            .by_address
            .get(&address)
            .map(|ids| ids.iter().filter_map(|id| graph.nodes.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn delete_edges_into(&self, id: OutputId) -> Result<usize> {
        Ok(self.graph.write().remove_edges_into(id))
    }

    async fn delete_node_batch(&self, limit: usize) -> Result<usize> {
        let mut graph = self.graph.write();
        let doomed: Vec<OutputId> = graph.nodes.keys().rev().take(limit).copied().collect();

        for id in &doomed {
            graph.remove_edges_into(*id);
            graph.remove_edges_from(*id);
            if let Some(node) = graph.nodes.remove(id) {
                if let Some(address) = node.address_id {
                    if let Some(set) = graph.by_address.get_mut(&address) {
                        set.remove(id);
                        if set.is_empty() {
                            graph.by_address.remove(&address);
                        }
                    }
                }
            }
        }

        Ok(doomed.len())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let graph = self.graph.read();
        Ok(StoreStats {
            total_nodes: graph.nodes.len() as u64,
            total_edges: graph.edge_count,
        })
    }
}
