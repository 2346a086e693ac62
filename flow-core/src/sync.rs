//! Flow graph synchronizer
//!
//! Walks ledger transactions in ascending `(height, index_in_block)` order,
//! runs attribution on each and writes the resulting nodes and edges.
//!
//! # Batching
//!
//! Writes are buffered and flushed as one atomic `apply_batch` call once at
//! least `batch_size` transactions are buffered and the stream reaches a
//! block boundary. A flush therefore always ends on a complete block, so the
//! committed height advances block by block.
//!
//! # Resuming
//!
//! The checkpoint is the height of the block holding the highest stored
//! output. A resumed run starts at that height; its transactions are
//! re-processed, which is a no-op for everything already stored.
//!
//! # Failure
//!
//! Transient store errors are retried with a fixed delay. When the attempt
//! budget runs out the run fails with `SynchronizationAborted`, carrying the
//! highest committed height. Any other error stops the run immediately.

use crate::{
    attribution::AttributionCalculator,
    config::{Config, SyncConfig},
    metrics::Metrics,
    reconcile::OverrideRegistry,
    retry::RetryPolicy,
    store::{FlowBatch, FlowStore},
    types::ValueNode,
    Error, Result,
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use ledger_model::{iterate_transactions, HeightRange, LedgerSource, Transaction, TxPosition};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Height window of a synchronize run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// First height to process; defaults to the store checkpoint
    pub start_height: Option<u64>,

    /// Last height to process; defaults to and is capped at the ledger tip
    pub end_height: Option<u64>,
}

/// Outcome of a synchronize run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Run identifier (appears in logs)
    pub run_id: Uuid,

    /// Run start
    pub started_at: DateTime<Utc>,

    /// Run end
    pub finished_at: DateTime<Utc>,

    /// First height requested, None when there was nothing to do
    pub start_height: Option<u64>,

    /// Highest block known to be fully stored, including blocks written
    /// before this run started
    pub committed_height: Option<u64>,

    /// Transactions processed
    pub transactions: u64,

    /// Nodes that did not exist before
    pub nodes_created: u64,

    /// Edges that did not exist before
    pub edges_created: u64,

    /// Store flushes
    pub flushes: u64,
}

impl SyncReport {
    fn begin(start_height: Option<u64>, committed_height: Option<u64>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::now_v7(),
            started_at: now,
            finished_at: now,
            start_height,
            committed_height,
            transactions: 0,
            nodes_created: 0,
            edges_created: 0,
            flushes: 0,
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

/// Single-writer builder of the flow graph
///
/// Two synchronizers must never write the same height range concurrently.
pub struct Synchronizer<S: ?Sized, L: ?Sized> {
    store: Arc<S>,
    ledger: Arc<L>,
    config: SyncConfig,
    calculator: AttributionCalculator,
    retry: RetryPolicy,
    overrides: Option<Arc<OverrideRegistry>>,
    metrics: Option<Metrics>,
}

impl<S: ?Sized, L: ?Sized> fmt::Debug for Synchronizer<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("config", &self.config)
            .field("calculator", &self.calculator)
            .finish_non_exhaustive()
    }
}

/// Writes buffered between flushes
#[derive(Default)]
struct Pending {
    batch: FlowBatch,
    transactions: usize,
    last_height: Option<u64>,
}

impl<S, L> Synchronizer<S, L>
where
    S: FlowStore + ?Sized,
    L: LedgerSource + ?Sized,
{
    /// Create synchronizer
    pub fn new(store: Arc<S>, ledger: Arc<L>, config: &Config) -> Self {
        Self {
            store,
            ledger,
            config: config.sync.clone(),
            calculator: AttributionCalculator::new(&config.attribution),
            retry: RetryPolicy::from_config(&config.sync),
            overrides: None,
            metrics: None,
        }
    }

    /// Honour the manual proportions held in `registry`
    pub fn with_overrides(mut self, registry: Arc<OverrideRegistry>) -> Self {
        self.overrides = Some(registry);
        self
    }

    /// Record metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Height of the block holding the highest stored output
    pub async fn checkpoint(&self) -> Result<Option<u64>> {
        let Some(max_id) = self.store.max_node_id().await? else {
            return Ok(None);
        };

        match self.ledger.height_of_output(max_id).await? {
            Some(height) => {
                info!(max_output = %max_id, height, "Derived checkpoint from store");
                Ok(Some(height))
            }
            None => Err(Error::GraphConsistency(format!(
                "highest stored node {} is unknown to the ledger",
                max_id
            ))),
        }
    }

    /// Synchronize a height window of the ledger
    ///
    /// The window ends at the ledger tip even when `end_height` lies beyond
    /// it. Without an explicit start the run resumes at the checkpoint
    /// block, which is already fully stored; with one, every block below the
    /// start is taken as stored. An abort reports that height when nothing
    /// newer was committed.
    pub async fn synchronize(&self, options: SyncOptions) -> Result<SyncReport> {
        let (start, committed) = match options.start_height {
            Some(height) => (height, height.checked_sub(1)),
            None => match self.checkpoint().await? {
                Some(height) => (height, Some(height)),
                None => (0, None),
            },
        };
        let end = match (options.end_height, self.ledger.best_height().await?) {
            (Some(requested), Some(best)) => Some(requested.min(best)),
            (_, best) => best,
        };

        let Some(end) = end.filter(|end| *end >= start) else {
            info!(start, "Nothing to synchronize");
            return Ok(SyncReport::begin(None, committed).finish());
        };

        let range = HeightRange::new(start, end)?;
        info!(range = %range, page_size = self.config.page_size, "Starting synchronization");

        let transactions = iterate_transactions(&*self.ledger, range, self.config.page_size);
        self.run(transactions, Some(start), committed).await
    }

    /// Synchronize an explicit transaction sequence
    ///
    /// The sequence must be strictly ascending in ledger position.
    pub async fn synchronize_transactions<St>(&self, transactions: St) -> Result<SyncReport>
    where
        St: Stream<Item = ledger_model::Result<Transaction>> + Unpin,
    {
        self.run(transactions, None, None).await
    }

    /// Delete the whole graph and synchronize from genesis
    pub async fn rebuild(&self) -> Result<SyncReport> {
        let removed = self.store.delete_all_nodes(self.config.delete_batch_size).await?;
        info!(removed, "Cleared flow graph for rebuild");

        self.synchronize(SyncOptions {
            start_height: Some(0),
            end_height: None,
        })
        .await
    }

    async fn run<St>(
        &self,
        mut transactions: St,
        start_height: Option<u64>,
        committed_height: Option<u64>,
    ) -> Result<SyncReport>
    where
        St: Stream<Item = ledger_model::Result<Transaction>> + Unpin,
    {
        let mut report = SyncReport::begin(start_height, committed_height);
        let mut pending = Pending::default();
        let mut last_position: Option<TxPosition> = None;

        while let Some(item) = transactions.next().await {
            let tx = item?;
            let position = tx.position();

            if let Some(previous) = last_position {
                if position <= previous {
                    return Err(Error::GraphConsistency(format!(
                        "{} at {} arrived after {}",
                        tx.id, position, previous
                    )));
                }
                // Flush only on block boundaries
                if position.height > previous.height
                    && pending.transactions >= self.config.batch_size
                {
                    self.flush(&mut pending, &mut report).await?;
                }
            }
            last_position = Some(position);

            if let Err(e) = self.stage(&tx, &mut pending.batch) {
                // Earlier transactions are fine; keep them before stopping
                if matches!(e, Error::MissingPrecedent { .. }) {
                    pending.last_height = position.height.checked_sub(1);
                    self.flush(&mut pending, &mut report).await?;
                }
                error!(
                    run_id = %report.run_id,
                    tx_id = %tx.id,
                    height = position.height,
                    committed_height = ?report.committed_height,
                    error = %e,
                    "Synchronization stopped"
                );
                return Err(e);
            }

            pending.transactions += 1;
            pending.last_height = Some(position.height);
            report.transactions += 1;
            debug!(tx_id = %tx.id, height = position.height, "Staged transaction");
        }

        self.flush(&mut pending, &mut report).await?;

        info!(
            run_id = %report.run_id,
            transactions = report.transactions,
            nodes_created = report.nodes_created,
            edges_created = report.edges_created,
            committed_height = ?report.committed_height,
            "Synchronization complete"
        );

        Ok(report.finish())
    }

    /// Add a transaction's nodes and edges to `batch`
    fn stage(&self, tx: &Transaction, batch: &mut FlowBatch) -> Result<()> {
        let overrides = match &self.overrides {
            Some(registry) => registry.cell_overrides(tx)?,
            None => Vec::new(),
        };
        let edges = self.calculator.edges(tx, &overrides)?;

        batch.nodes.extend(tx.outputs.iter().map(ValueNode::from));
        batch.edges.extend(edges);
        Ok(())
    }

    async fn flush(&self, pending: &mut Pending, report: &mut SyncReport) -> Result<()> {
        if pending.batch.is_empty() {
            if pending.last_height.is_some() {
                report.committed_height = pending.last_height;
            }
            pending.transactions = 0;
            return Ok(());
        }

        let started = Instant::now();
        let batch = &pending.batch;
        let outcome = self
            .retry
            .run("apply_batch", self.metrics.as_ref(), || self.store.apply_batch(batch))
            .await
            .map_err(|failure| failure.into_error(report.committed_height))?;

        report.flushes += 1;
        report.nodes_created += outcome.nodes_created as u64;
        report.edges_created += outcome.edges_created as u64;
        if pending.last_height.is_some() {
            report.committed_height = pending.last_height;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_flush(
                outcome.nodes_created,
                outcome.edges_created,
                started.elapsed().as_secs_f64(),
            );
            if let Some(height) = report.committed_height {
                metrics.set_committed_height(height);
            }
        }

        info!(
            run_id = %report.run_id,
            transactions = pending.transactions,
            nodes_created = outcome.nodes_created,
            edges_created = outcome.edges_created,
            committed_height = ?report.committed_height,
            "Flushed batch"
        );

        pending.batch.clear();
        pending.transactions = 0;
        Ok(())
    }
}
