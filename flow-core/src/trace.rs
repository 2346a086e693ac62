//! Fractional provenance traces
//!
//! A trace starts with the value of one or more outputs and pushes that
//! mass along flow edges in the requested direction. At every node the mass
//! is split across the node's same-direction edges in proportion to their
//! values. Mass stops at nodes with no further edges, at the depth limit, or
//! once it is negligible; the result maps each such node to the mass that
//! reached it.
//!
//! # Example
//!
//! ```text
//!   C --70--> B --70--> X <--30-- A
//!
//!   sources of X (value 100):  {A: 30, C: 70}
//! ```
//!
//! Edges always point from lower to higher output ids, so the walk pops its
//! worklist in id order (descending for sources, ascending for
//! destinations). Mass that reaches a node along several paths is merged
//! before the node is expanded, and each node is expanded once per depth.

use crate::{
    attribution::scale,
    config::Config,
    metrics::Metrics,
    store::FlowStore,
    types::{Direction, FlowEdge, NodeRef},
    Error, Result,
};
use ledger_model::OutputId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// What to trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRequest {
    /// Starting output or address
    pub start: NodeRef,

    /// Walk direction
    pub direction: Direction,

    /// Maximum number of edges followed from the start; engine default when None
    pub max_depth: Option<usize>,
}

impl TraceRequest {
    /// Where did the value of `start` come from
    pub fn sources(start: NodeRef) -> Self {
        Self {
            start,
            direction: Direction::Sources,
            max_depth: None,
        }
    }

    /// Where did the value of `start` go
    pub fn destinations(start: NodeRef) -> Self {
        Self {
            start,
            direction: Direction::Destinations,
            max_depth: None,
        }
    }

    /// Limit the walk depth
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }
}

/// Mass per reached output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceResult {
    /// Request that produced this result
    pub request: TraceRequest,

    /// Attributed amount per output
    pub contributions: BTreeMap<OutputId, Decimal>,

    /// Whether the depth limit stopped the walk somewhere
    pub truncated: bool,
}

impl TraceResult {
    /// Amount attributed to `id`, zero if unreached
    pub fn get(&self, id: OutputId) -> Decimal {
        self.contributions.get(&id).copied().unwrap_or_default()
    }

    /// Sum of all contributions
    pub fn total(&self) -> Decimal {
        self.contributions.values().sum()
    }

    /// Number of reached outputs
    pub fn len(&self) -> usize {
        self.contributions.len()
    }

    /// Whether nothing was reached
    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }
}

/// Read-only traversal over a flow store
pub struct TraceEngine<S: ?Sized> {
    store: Arc<S>,
    default_max_depth: Option<usize>,
    negligible_mass: Decimal,
    metrics: Option<Metrics>,
}

impl<S: ?Sized> fmt::Debug for TraceEngine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceEngine")
            .field("default_max_depth", &self.default_max_depth)
            .field("negligible_mass", &self.negligible_mass)
            .finish_non_exhaustive()
    }
}

/// Per-call edge cache
struct EdgeCache<'a, S: ?Sized> {
    store: &'a S,
    direction: Direction,
    edges: HashMap<OutputId, Arc<Vec<FlowEdge>>>,
}

impl<'a, S: FlowStore + ?Sized> EdgeCache<'a, S> {
    fn new(store: &'a S, direction: Direction) -> Self {
        Self {
            store,
            direction,
            edges: HashMap::new(),
        }
    }

    async fn get(&mut self, id: OutputId) -> Result<Arc<Vec<FlowEdge>>> {
        if let Some(edges) = self.edges.get(&id) {
            return Ok(edges.clone());
        }
        let edges = Arc::new(self.store.edges(id, self.direction).await?);
        self.edges.insert(id, edges.clone());
        Ok(edges)
    }
}

/// Worklist ordered so that every node is popped after all its predecessors
struct Worklist {
    direction: Direction,
    pending: BTreeMap<(OutputId, usize), Decimal>,
}

impl Worklist {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            pending: BTreeMap::new(),
        }
    }

    fn push(&mut self, id: OutputId, depth: usize, mass: Decimal) {
        *self.pending.entry((id, depth)).or_insert(Decimal::ZERO) += mass;
    }

    fn pop(&mut self) -> Option<(OutputId, usize, Decimal)> {
        let entry = match self.direction {
            Direction::Sources => self.pending.pop_last(),
            Direction::Destinations => self.pending.pop_first(),
        };
        entry.map(|((id, depth), mass)| (id, depth, mass))
    }
}

impl<S: FlowStore + ?Sized> TraceEngine<S> {
    /// Create engine
    pub fn new(store: Arc<S>, config: &Config) -> Self {
        Self {
            store,
            default_max_depth: config.trace.default_max_depth,
            negligible_mass: config.trace.negligible_mass,
            metrics: None,
        }
    }

    /// Record metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Evaluate a trace
    pub async fn trace(&self, request: &TraceRequest) -> Result<TraceResult> {
        let max_depth = request.max_depth.or(self.default_max_depth);
        let direction = request.direction;
        let mut cache = EdgeCache::new(&*self.store, direction);
        let mut work = Worklist::new(direction);

        for (id, mass) in self.starting_mass(request.start, direction).await? {
            work.push(id, 0, mass);
        }

        let mut contributions: BTreeMap<OutputId, Decimal> = BTreeMap::new();
        let mut truncated = false;
        let mut expanded = 0usize;

        while let Some((id, depth, mass)) = work.pop() {
            let edges = cache.get(id).await?;
            let total: Decimal = edges.iter().map(|e| e.value).sum();

            let at_limit = max_depth.is_some_and(|limit| depth >= limit);
            if edges.is_empty() || total.is_zero() || at_limit || mass <= self.negligible_mass {
                truncated |= at_limit && !edges.is_empty();
                *contributions.entry(id).or_insert(Decimal::ZERO) += mass;
                continue;
            }

            expanded += 1;
            for edge in edges.iter() {
                let share = scale(mass, edge.value, total);
                work.push(edge.neighbor(direction), depth + 1, share);
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_trace();
        }
        debug!(
            start = %request.start,
            direction = %direction,
            expanded,
            reached = contributions.len(),
            truncated,
            "Trace complete"
        );

        Ok(TraceResult {
            request: *request,
            contributions,
            truncated,
        })
    }

    /// Every output the start's value passed through on its way in
    ///
    /// Deduplicated, start excluded, bounded by the default depth limit.
    pub async fn history(&self, start: NodeRef) -> Result<BTreeSet<OutputId>> {
        let roots: Vec<OutputId> = self
            .starting_mass(start, Direction::Destinations)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        let mut cache = EdgeCache::new(&*self.store, Direction::Sources);
        let mut seen: BTreeSet<OutputId> = BTreeSet::new();
        let mut stack: Vec<(OutputId, usize)> = roots.iter().map(|id| (*id, 0)).collect();

        while let Some((id, depth)) = stack.pop() {
            if self.default_max_depth.is_some_and(|limit| depth >= limit) {
                continue;
            }
            for edge in cache.get(id).await?.iter() {
                if seen.insert(edge.from) {
                    stack.push((edge.from, depth + 1));
                }
            }
        }

        for root in &roots {
            seen.remove(root);
        }
        Ok(seen)
    }

    /// Outputs and values the walk starts from
    ///
    /// An address traced towards its sources only contributes unspent
    /// outputs; spent ones are already covered by whatever spent them.
    async fn starting_mass(
        &self,
        start: NodeRef,
        direction: Direction,
    ) -> Result<Vec<(OutputId, Decimal)>> {
        match start {
            NodeRef::Output(id) => {
                let node = self.store.node(id).await?.ok_or(Error::NodeNotFound(id))?;
                Ok(vec![(id, Decimal::from(node.value))])
            }
            NodeRef::Address(address) => {
                let mut roots = Vec::new();
                for node in self.store.nodes_of_address(address).await? {
                    if direction == Direction::Sources {
                        let spent = !self
                            .store
                            .edges(node.output_id, Direction::Destinations)
                            .await?
                            .is_empty();
                        if spent {
                            continue;
                        }
                    }
                    roots.push((node.output_id, Decimal::from(node.value)));
                }
                Ok(roots)
            }
        }
    }
}
