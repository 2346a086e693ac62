//! Shared fixtures for flow-core integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use flow_core::{
    store::{BatchOutcome, FlowBatch, FlowStore, StoreStats},
    Config, Direction, Error, FlowEdge, MemoryFlowStore, Result, ValueNode,
};
use ledger_model::{AddressId, LedgerBuilder, MemoryLedger, OutputId};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};

/// Config with exact attribution and near-zero retry delay
pub fn test_config(batch_size: usize) -> Config {
    let mut config = Config::default();
    config.sync.batch_size = batch_size;
    config.sync.page_size = 3;
    config.sync.max_retry_attempts = 3;
    config.sync.retry_delay_ms = 1;
    config.attribution.negligible_value = Decimal::ZERO;
    config
}

/// Ledger from the provenance walkthrough
///
/// ```text
/// block 0: coinbase -> A (30)
/// block 1: coinbase -> C (70)
/// block 2: coinbase -> M (5);  C -> B (70)
/// block 3: coinbase -> N (5);  A, B -> X (100)
/// ```
pub struct Walkthrough {
    pub ledger: MemoryLedger,
    pub a: OutputId,
    pub b: OutputId,
    pub c: OutputId,
    pub x: OutputId,
    pub x_owner: AddressId,
}

pub fn walkthrough() -> Walkthrough {
    let mut builder = LedgerBuilder::new();
    let a = builder.coinbase(&[(Some("alice"), 30)])[0];
    let c = builder.coinbase(&[(Some("carol"), 70)])[0];
    builder.coinbase(&[(Some("miner"), 5)]);
    let b = builder.transaction(&[c], &[(Some("bob"), 70)])[0];
    builder.coinbase(&[(Some("miner"), 5)]);
    let x = builder.transaction(&[a, b], &[(Some("xavier"), 100)])[0];
    let x_owner = builder.address_id("xavier").unwrap();

    Walkthrough {
        ledger: builder.build().unwrap(),
        a,
        b,
        c,
        x,
        x_owner,
    }
}

/// One transaction of a generated ledger
#[derive(Debug, Clone)]
pub struct TxPlan {
    /// Start a new block before this transaction
    pub new_block: bool,
    /// Indexes into the unspent set (taken modulo its size)
    pub picks: Vec<usize>,
    /// Relative output weights
    pub weights: Vec<u8>,
    /// Fee in percent of the input value
    pub fee_percent: u8,
}

/// Build a ledger by spending generated picks of the unspent set
pub fn generated_ledger(coinbase_values: &[u64], plans: &[TxPlan]) -> MemoryLedger {
    let mut builder = LedgerBuilder::new();
    let mut unspent: Vec<(OutputId, u64)> = Vec::new();
    let mut coinbases = coinbase_values.iter().cycle();

    for (k, plan) in plans.iter().enumerate() {
        if k == 0 || plan.new_block || unspent.is_empty() {
            let value = *coinbases.next().unwrap_or(&1_000);
            let ids = builder.coinbase(&[(Some("miner"), value)]);
            unspent.push((ids[0], value));
        }

        let mut spends = Vec::new();
        let mut total = 0u64;
        for pick in &plan.picks {
            if unspent.is_empty() {
                break;
            }
            let (id, value) = unspent.remove(pick % unspent.len());
            spends.push(id);
            total += value;
        }
        if spends.is_empty() {
            continue;
        }

        let budget = total - total * u64::from(plan.fee_percent.min(99)) / 100;
        let weight_sum: u64 = plan.weights.iter().map(|w| u64::from(*w) + 1).sum();
        let owners: Vec<String> = (0..plan.weights.len()).map(|i| format!("owner{}", (k + i) % 7)).collect();
        let outputs: Vec<(Option<&str>, u64)> = plan
            .weights
            .iter()
            .zip(&owners)
            .map(|(w, owner)| (Some(owner.as_str()), budget * (u64::from(*w) + 1) / weight_sum))
            .collect();

        let created = builder.transaction(&spends, &outputs);
        unspent.extend(created.into_iter().zip(outputs.iter().map(|(_, v)| *v)));
    }

    builder.build().unwrap()
}

/// Store wrapper that fails `apply_batch` with transient errors on demand
pub struct FlakyStore {
    pub inner: MemoryFlowStore,
    healthy_flushes: AtomicU32,
    failures: AtomicU32,
    pub calls: AtomicU32,
}

impl FlakyStore {
    /// Succeed `healthy_flushes` times, then fail `failures` times, then recover
    pub fn new(healthy_flushes: u32, failures: u32) -> Self {
        Self {
            inner: MemoryFlowStore::new(),
            healthy_flushes: AtomicU32::new(healthy_flushes),
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl FlowStore for FlakyStore {
    async fn upsert_node(&self, node: &ValueNode) -> Result<bool> {
        self.inner.upsert_node(node).await
    }

    async fn upsert_edge(&self, edge: &FlowEdge) -> Result<bool> {
        self.inner.upsert_edge(edge).await
    }

    async fn apply_batch(&self, batch: &FlowBatch) -> Result<BatchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !Self::take(&self.healthy_flushes) && Self::take(&self.failures) {
            return Err(Error::TransientStore("connection reset".into()));
        }
        self.inner.apply_batch(batch).await
    }

    async fn node(&self, id: OutputId) -> Result<Option<ValueNode>> {
        self.inner.node(id).await
    }

    async fn max_node_id(&self) -> Result<Option<OutputId>> {
        self.inner.max_node_id().await
    }

    async fn edges(&self, id: OutputId, direction: Direction) -> Result<Vec<FlowEdge>> {
        self.inner.edges(id, direction).await
    }

    async fn nodes_of_address(&self, address: AddressId) -> Result<Vec<ValueNode>> {
        self.inner.nodes_of_address(address).await
    }

    async fn delete_edges_into(&self, id: OutputId) -> Result<usize> {
        self.inner.delete_edges_into(id).await
    }

    async fn delete_node_batch(&self, limit: usize) -> Result<usize> {
        self.inner.delete_node_batch(limit).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.inner.stats().await
    }
}

/// Sum of edge values into `id`
pub async fn inflow<S: FlowStore + ?Sized>(store: &S, id: OutputId) -> Decimal {
    store
        .edges(id, Direction::Sources)
        .await
        .unwrap()
        .iter()
        .map(|e| e.value)
        .sum()
}
