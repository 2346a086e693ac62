//! Metrics collection for observability
//!
//! Prometheus metrics for the flow graph. Each `Metrics` owns its registry so
//! several graphs (or tests) can live in one process.
//!
//! # Metrics
//!
//! - `flow_nodes_created_total` - Value nodes written
//! - `flow_edges_created_total` - Flow edges written
//! - `flow_edges_deleted_total` - Flow edges removed by override reconciliation
//! - `flow_flush_retries_total` - Store flushes retried after a transient error
//! - `flow_traces_total` - Traces evaluated
//! - `flow_flush_duration_seconds` - Histogram of flush latencies
//! - `flow_committed_height` - Highest block fully written to the graph

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Value nodes written
    pub nodes_created: IntCounter,

    /// Flow edges written
    pub edges_created: IntCounter,

    /// Flow edges removed
    pub edges_deleted: IntCounter,

    /// Flush retries
    pub flush_retries: IntCounter,

    /// Traces evaluated
    pub traces_total: IntCounter,

    /// Flush duration histogram
    pub flush_duration: Histogram,

    /// Last committed block height
    pub committed_height: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let nodes_created =
            IntCounter::new("flow_nodes_created_total", "Total number of value nodes written")?;
        registry.register(Box::new(nodes_created.clone()))?;

        let edges_created =
            IntCounter::new("flow_edges_created_total", "Total number of flow edges written")?;
        registry.register(Box::new(edges_created.clone()))?;

        let edges_deleted = IntCounter::new(
            "flow_edges_deleted_total",
            "Total number of flow edges removed by override reconciliation",
        )?;
        registry.register(Box::new(edges_deleted.clone()))?;

        let flush_retries = IntCounter::new(
            "flow_flush_retries_total",
            "Store flushes retried after a transient error",
        )?;
        registry.register(Box::new(flush_retries.clone()))?;

        let traces_total = IntCounter::new("flow_traces_total", "Total number of traces evaluated")?;
        registry.register(Box::new(traces_total.clone()))?;

        let flush_duration = Histogram::with_opts(
            HistogramOpts::new("flow_flush_duration_seconds", "Histogram of flush latencies")
                .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(flush_duration.clone()))?;

        let committed_height = IntGauge::new(
            "flow_committed_height",
            "Highest block whose transactions are fully written",
        )?;
        registry.register(Box::new(committed_height.clone()))?;

        Ok(Self {
            nodes_created,
            edges_created,
            edges_deleted,
            flush_retries,
            traces_total,
            flush_duration,
            committed_height,
            registry,
        })
    }

    /// Record a committed flush
    pub fn record_flush(&self, nodes: usize, edges: usize, duration_seconds: f64) {
        self.nodes_created.inc_by(nodes as u64);
        self.edges_created.inc_by(edges as u64);
        self.flush_duration.observe(duration_seconds);
    }

    /// Record a retried flush
    pub fn record_retry(&self) {
        self.flush_retries.inc();
    }

    /// Record removed edges
    pub fn record_edges_deleted(&self, count: usize) {
        self.edges_deleted.inc_by(count as u64);
    }

    /// Record a trace
    pub fn record_trace(&self) {
        self.traces_total.inc();
    }

    /// Update committed height
    pub fn set_committed_height(&self, height: u64) {
        self.committed_height.set(i64::try_from(height).unwrap_or(i64::MAX));
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
