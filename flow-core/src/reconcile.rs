//! Override reconciliation
//!
//! Manual proportions are defined per transaction. When a transaction's set
//! changes, every edge into its outputs is deleted and rebuilt from a fresh
//! attribution. Nothing outside that transaction is touched.
//!
//! All affected transactions are attributed before anything is written, so
//! an invalid override fails the call without side effects. Writes for
//! different transactions then run concurrently.

use crate::{
    attribution::{AttributionCalculator, CellOverride},
    config::Config,
    metrics::Metrics,
    retry::RetryPolicy,
    store::{FlowBatch, FlowStore},
    types::{FlowEdge, ManualProportion, ValueNode},
    Error, Result,
};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use ledger_model::{LedgerSource, Transaction, TxId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Active manual proportions, keyed by transaction
///
/// Shared between the reconciler and the synchronizer so a rebuild honours
/// the same overrides.
#[derive(Debug, Default)]
pub struct OverrideRegistry {
    active: DashMap<TxId, Vec<ManualProportion>>,
}

impl OverrideRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Active proportions of a transaction
    pub fn get(&self, tx_id: TxId) -> Vec<ManualProportion> {
        self.active.get(&tx_id).map(|set| set.clone()).unwrap_or_default()
    }

    /// Transactions with active proportions, ascending
    pub fn transactions(&self) -> Vec<TxId> {
        let mut ids: Vec<TxId> = self.active.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Number of transactions with active proportions
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no proportions are active
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn replace(&self, tx_id: TxId, set: Vec<ManualProportion>) {
        if set.is_empty() {
            self.active.remove(&tx_id);
        } else {
            self.active.insert(tx_id, set);
        }
    }

    /// Active proportions of `tx` as matrix positions
    pub(crate) fn cell_overrides(&self, tx: &Transaction) -> Result<Vec<CellOverride>> {
        match self.active.get(&tx.id) {
            Some(set) => set.iter().map(|mp| mp.resolve(tx)).collect(),
            None => Ok(Vec::new()),
        }
    }
}

/// Outcome of a reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Transactions whose edges were rebuilt
    pub transactions: usize,
    /// Transactions registered but not yet in the graph
    pub deferred: usize,
    /// Edges removed
    pub edges_deleted: usize,
    /// Edges written
    pub edges_created: usize,
}

impl ReconcileReport {
    fn absorb(&mut self, step: StepOutcome) {
        match step {
            StepOutcome::Deferred => self.deferred += 1,
            StepOutcome::Rewritten { deleted, created } => {
                self.transactions += 1;
                self.edges_deleted += deleted;
                self.edges_created += created;
            }
        }
    }
}

enum StepOutcome {
    Deferred,
    Rewritten { deleted: usize, created: usize },
}

/// One transaction's new proportion set and the edges it yields
struct Plan {
    tx: Transaction,
    set: Vec<ManualProportion>,
    edges: Vec<FlowEdge>,
}

/// Applies and resets manual proportions on a materialized graph
pub struct OverrideReconciler<S: ?Sized, L: ?Sized> {
    store: Arc<S>,
    ledger: Arc<L>,
    registry: Arc<OverrideRegistry>,
    calculator: AttributionCalculator,
    retry: RetryPolicy,
    max_concurrency: usize,
    metrics: Option<Metrics>,
}

impl<S: ?Sized, L: ?Sized> fmt::Debug for OverrideReconciler<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverrideReconciler")
            .field("registry", &self.registry)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl<S, L> OverrideReconciler<S, L>
where
    S: FlowStore + ?Sized,
    L: LedgerSource + ?Sized,
{
    /// Create reconciler with an empty registry
    pub fn new(store: Arc<S>, ledger: Arc<L>, config: &Config) -> Self {
        Self {
            store,
            ledger,
            registry: Arc::new(OverrideRegistry::new()),
            calculator: AttributionCalculator::new(&config.attribution),
            retry: RetryPolicy::from_config(&config.sync),
            max_concurrency: config.reconcile.max_concurrency.max(1),
            metrics: None,
        }
    }

    /// Use an existing registry
    pub fn with_registry(mut self, registry: Arc<OverrideRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Record metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Registry of active proportions
    pub fn registry(&self) -> Arc<OverrideRegistry> {
        self.registry.clone()
    }

    /// Add `overrides` to the active sets of the transactions they reference
    ///
    /// A proportion on an `(input, output)` pair that is already active
    /// replaces the old one; every other active proportion of the
    /// transaction is kept and the whole set is attributed together. Within
    /// one call the last proportion given for a pair wins. Transactions not
    /// yet in the graph are registered and picked up by the synchronizer
    /// later.
    pub async fn apply_overrides(&self, overrides: &[ManualProportion]) -> Result<ReconcileReport> {
        let mut grouped: BTreeMap<TxId, Vec<ManualProportion>> = BTreeMap::new();
        for mp in overrides {
            grouped.entry(mp.tx_id()).or_default().push(mp.clone());
        }

        let mut plans = Vec::with_capacity(grouped.len());
        for (tx_id, incoming) in grouped {
            let tx = self.affected_transaction(tx_id, &incoming).await?;
            let set = merge_proportions(self.registry.get(tx_id), incoming);
            let cells = set
                .iter()
                .map(|mp| mp.resolve(&tx))
                .collect::<Result<Vec<CellOverride>>>()?;
            let edges = self.calculator.edges(&tx, &cells)?;
            plans.push(Plan { tx, set, edges });
        }

        let report = self.execute(plans).await?;
        info!(
            transactions = report.transactions,
            deferred = report.deferred,
            edges_deleted = report.edges_deleted,
            edges_created = report.edges_created,
            "Applied manual proportions"
        );
        Ok(report)
    }

    /// Drop every active proportion and restore haircut attribution
    pub async fn reset_overrides(&self) -> Result<ReconcileReport> {
        let mut plans = Vec::new();
        for tx_id in self.registry.transactions() {
            plans.push(self.haircut_plan(tx_id).await?);
        }

        let report = self.execute(plans).await?;
        info!(
            transactions = report.transactions,
            edges_deleted = report.edges_deleted,
            edges_created = report.edges_created,
            "Reset manual proportions"
        );
        Ok(report)
    }

    /// Drop the active proportions of one transaction
    pub async fn reset_transaction(&self, tx_id: TxId) -> Result<ReconcileReport> {
        if self.registry.get(tx_id).is_empty() {
            return Ok(ReconcileReport::default());
        }
        let plan = self.haircut_plan(tx_id).await?;
        self.execute(vec![plan]).await
    }

    async fn haircut_plan(&self, tx_id: TxId) -> Result<Plan> {
        let tx = self
            .ledger
            .transaction(tx_id)
            .await?
            .ok_or(Error::TransactionNotFound(tx_id))?;
        let edges = self.calculator.edges(&tx, &[])?;
        Ok(Plan {
            tx,
            set: Vec::new(),
            edges,
        })
    }

    /// Locate the transaction through the outputs its proportions name
    async fn affected_transaction(
        &self,
        tx_id: TxId,
        set: &[ManualProportion],
    ) -> Result<Transaction> {
        let Some(first) = set.first() else {
            return Err(Error::TransactionNotFound(tx_id));
        };
        let tx = self
            .ledger
            .transaction_of_output(first.output_id())
            .await?
            .ok_or(Error::TransactionNotFound(tx_id))?;
        if tx.id != tx_id {
            return Err(Error::GraphConsistency(format!(
                "{} is created by {}, not {}",
                first.output_id(),
                tx.id,
                tx_id
            )));
        }
        Ok(tx)
    }

    async fn execute(&self, plans: Vec<Plan>) -> Result<ReconcileReport> {
        let results: Vec<Result<StepOutcome>> = stream::iter(plans)
            .map(|plan| self.rewrite(plan))
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut report = ReconcileReport::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(step) => report.absorb(step),
                Err(e) => {
                    warn!(error = %e, "Reconciliation step failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn rewrite(&self, plan: Plan) -> Result<StepOutcome> {
        let Plan { tx, set, edges } = plan;

        let materialized = match tx.outputs.first() {
            Some(output) => self.store.node(output.id).await?.is_some(),
            None => false,
        };
        if !materialized {
            debug!(tx_id = %tx.id, "Transaction not in graph yet, registering only");
            self.registry.replace(tx.id, set);
            return Ok(StepOutcome::Deferred);
        }

        let mut deleted = 0;
        for output in &tx.outputs {
            let id = output.id;
            deleted += self
                .retry
                .run("delete_edges_into", self.metrics.as_ref(), || {
                    self.store.delete_edges_into(id)
                })
                .await
                .map_err(|failure| failure.into_error(None))?;
        }

        let batch = FlowBatch {
            nodes: tx.outputs.iter().map(ValueNode::from).collect(),
            edges,
        };
        let outcome = self
            .retry
            .run("apply_batch", self.metrics.as_ref(), || self.store.apply_batch(&batch))
            .await
            .map_err(|failure| failure.into_error(None))?;

        if let Some(metrics) = &self.metrics {
            metrics.record_edges_deleted(deleted);
            metrics.record_flush(outcome.nodes_created, outcome.edges_created, 0.0);
        }

        debug!(
            tx_id = %tx.id,
            edges_deleted = deleted,
            edges_created = outcome.edges_created,
            active = set.len(),
            "Rewrote transaction edges"
        );
        self.registry.replace(tx.id, set);

        Ok(StepOutcome::Rewritten {
            deleted,
            created: outcome.edges_created,
        })
    }
}

/// Upsert `incoming` into `active` by `(input, output)` pair
fn merge_proportions(
    mut active: Vec<ManualProportion>,
    incoming: Vec<ManualProportion>,
) -> Vec<ManualProportion> {
    for mp in incoming {
        let same_pair = active
            .iter_mut()
            .find(|a| a.input_id() == mp.input_id() && a.output_id() == mp.output_id());
        match same_pair {
            Some(existing) => *existing = mp,
            None => active.push(mp),
        }
    }
    active
}
