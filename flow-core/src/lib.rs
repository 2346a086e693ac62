//! Flow Core
//!
//! Derives a value-flow graph from a UTXO ledger and answers provenance
//! queries over it.
//!
//! # Architecture
//!
//! - **Attribution**: splits each transaction's input value across its
//!   outputs (haircut rule, with manual overrides)
//! - **Synchronizer**: single writer; walks transactions in ledger order and
//!   upserts nodes/edges in batches, resumable from the store's checkpoint
//! - **Reconciler**: rewrites the edges of transactions whose overrides changed
//! - **Trace engine**: read-only fractional walks towards sources or destinations
//!
//! # Invariants
//!
//! - Conservation: edges into every output of a non-coinbase transaction sum
//!   to the output's value
//! - At most one edge per `(from, to)` pair, never a self-loop
//! - Edges always point forward in output-id order, so the graph is acyclic
//! - Re-running synchronization over the same heights changes nothing

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod attribution;
pub mod store;
pub mod sync;
pub mod reconcile;
pub mod trace;
pub mod error;
pub mod config;
pub mod metrics;
pub mod telemetry;
mod retry;

// Re-exports
pub use error::{Error, Result};
pub use types::{Direction, FlowEdge, ManualProportion, NodeRef, ValueNode};
pub use attribution::{AttributionCalculator, CellOverride, Distribution};
pub use store::{BatchOutcome, FlowBatch, FlowStore, MemoryFlowStore, RocksFlowStore, StoreStats};
pub use sync::{SyncOptions, SyncReport, Synchronizer};
pub use reconcile::{OverrideReconciler, OverrideRegistry, ReconcileReport};
pub use trace::{TraceEngine, TraceRequest, TraceResult};
pub use config::Config;
pub use metrics::Metrics;
