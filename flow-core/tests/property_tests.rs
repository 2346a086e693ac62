//! Property-based tests for flow graph invariants
//!
//! These tests use proptest to verify:
//! - Conservation: every output column sums to the output value
//! - Override respect: fixed cells equal `input × proportion` exactly
//! - Idempotence: synchronizing twice equals synchronizing once
//! - Shape: no self-loops, every edge points forward, coinbase outputs have no inflow
//! - Trace mass: a sources trace returns the full value of its start

mod common;

use common::{generated_ledger, test_config, TxPlan};
use flow_core::{
    config::AttributionConfig, AttributionCalculator, CellOverride, Direction, FlowStore,
    MemoryFlowStore, NodeRef, SyncOptions, Synchronizer, TraceEngine, TraceRequest,
};
use ledger_model::{HeightRange, LedgerSource, TxId};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Tolerance for sums of 28-digit decimals
fn tolerance() -> Decimal {
    Decimal::new(1, 12)
}

fn calculator() -> AttributionCalculator {
    AttributionCalculator::new(&AttributionConfig {
        negligible_value: Decimal::ZERO,
    })
}

/// Inputs and outputs whose outputs never exceed the inputs
fn values_strategy() -> impl Strategy<Value = (Vec<u64>, Vec<u64>)> {
    (
        prop::collection::vec(1u64..1_000_000, 2..6),
        prop::collection::vec(1u64..100, 1..5),
        0u64..30,
    )
        .prop_map(|(inputs, weights, fee_percent)| {
            let total: u64 = inputs.iter().sum();
            let budget = total - total * fee_percent / 100;
            let weight_sum: u64 = weights.iter().sum();
            let outputs = weights.iter().map(|w| budget * w / weight_sum).collect();
            (inputs, outputs)
        })
}

/// Candidate overrides: (input, output, proportion in hundredths)
fn override_candidates() -> impl Strategy<Value = Vec<(usize, usize, u32)>> {
    prop::collection::vec((0usize..5, 0usize..4, 0u32..=100), 2..6)
}

/// Keep the candidates that fit the capacities; the last input stays free
fn admissible(
    inputs: &[u64],
    outputs: &[u64],
    candidates: &[(usize, usize, u32)],
) -> Vec<CellOverride> {
    let (n, m) = (inputs.len(), outputs.len());
    let mut row_used = vec![Decimal::ZERO; n];
    let mut column_used = vec![Decimal::ZERO; m];
    let mut chosen: Vec<CellOverride> = Vec::new();

    for &(i, j, hundredths) in candidates {
        let (i, j) = (i % (n - 1), j % m);
        if chosen.iter().any(|c| c.input == i && c.output == j) {
            continue;
        }
        let proportion = Decimal::new(i64::from(hundredths), 2);
        let amount = Decimal::from(inputs[i]) * proportion;
        if row_used[i] + amount > Decimal::from(inputs[i])
            || column_used[j] + amount > Decimal::from(outputs[j])
        {
            continue;
        }
        row_used[i] += amount;
        column_used[j] += amount;
        chosen.push(CellOverride {
            input: i,
            output: j,
            proportion,
        });
    }
    chosen
}

fn plan_strategy() -> impl Strategy<Value = TxPlan> {
    (
        any::<bool>(),
        prop::collection::vec(0usize..64, 1..4),
        prop::collection::vec(any::<u8>(), 1..4),
        0u8..20,
    )
        .prop_map(|(new_block, picks, weights, fee_percent)| TxPlan {
            new_block,
            picks,
            weights,
            fee_percent,
        })
}

fn ledger_strategy() -> impl Strategy<Value = (Vec<u64>, Vec<TxPlan>)> {
    (
        prop::collection::vec(1u64..10_000_000, 1..6),
        prop::collection::vec(plan_strategy(), 1..25),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Haircut attribution conserves every output's value
    #[test]
    fn prop_haircut_conserves_outputs((inputs, outputs) in values_strategy()) {
        let matrix = calculator().compute(TxId(1), &inputs, &outputs, &[]).unwrap();
        let total_in: u64 = inputs.iter().sum();

        for (j, value) in outputs.iter().enumerate() {
            let diff = (matrix.column_sum(j) - Decimal::from(*value)).abs();
            prop_assert!(diff <= tolerance(), "column {} off by {}", j, diff);
        }
        for i in 0..inputs.len() {
            let expected = Decimal::from(inputs[i]) / Decimal::from(total_in)
                * Decimal::from(outputs.iter().sum::<u64>());
            let diff = (matrix.row_sum(i) - expected).abs();
            prop_assert!(diff <= tolerance(), "row {} off by {}", i, diff);
        }
    }

    /// Several simultaneous overrides still conserve outputs and stay exact
    #[test]
    fn prop_overrides_conserve_and_are_respected(
        (inputs, outputs) in values_strategy(),
        candidates in override_candidates(),
    ) {
        let overrides = admissible(&inputs, &outputs, &candidates);
        let matrix = calculator().compute(TxId(1), &inputs, &outputs, &overrides).unwrap();

        for ov in &overrides {
            prop_assert_eq!(
                matrix.get(ov.input, ov.output),
                Decimal::from(inputs[ov.input]) * ov.proportion
            );
        }
        for (j, value) in outputs.iter().enumerate() {
            let diff = (matrix.column_sum(j) - Decimal::from(*value)).abs();
            prop_assert!(diff <= tolerance(), "column {} off by {}", j, diff);
        }
        for (_, _, cell) in matrix.nonzero() {
            prop_assert!(cell > Decimal::ZERO);
        }
    }

    /// Synchronizing the same heights twice changes nothing
    #[test]
    fn prop_synchronize_is_idempotent(
        (coinbases, plans) in ledger_strategy(),
        batch_size in 1usize..8,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();

        rt.block_on(async {
            let ledger = Arc::new(generated_ledger(&coinbases, &plans));
            let store = Arc::new(MemoryFlowStore::new());
            let sync = Synchronizer::new(store.clone(), ledger.clone(), &test_config(batch_size));

            let everything = SyncOptions { start_height: Some(0), end_height: None };
            sync.synchronize(everything).await.unwrap();
            let nodes = store.all_nodes();
            let edges = store.all_edges();

            let again = sync.synchronize(everything).await.unwrap();
            prop_assert_eq!(again.nodes_created, 0);
            prop_assert_eq!(again.edges_created, 0);
            prop_assert_eq!(store.all_nodes(), nodes);
            prop_assert_eq!(store.all_edges(), edges);

            Ok(())
        })?;
    }

    /// Materialized graphs conserve value and respect ledger order
    #[test]
    fn prop_graph_shape((coinbases, plans) in ledger_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();

        rt.block_on(async {
            let ledger = Arc::new(generated_ledger(&coinbases, &plans));
            let store = Arc::new(MemoryFlowStore::new());
            Synchronizer::new(store.clone(), ledger.clone(), &test_config(4))
                .synchronize(SyncOptions::default())
                .await
                .unwrap();

            for edge in store.all_edges() {
                prop_assert!(edge.from < edge.to);
                prop_assert!(edge.value > Decimal::ZERO);
            }

            let best = ledger.best_height().await.unwrap().unwrap();
            let txs = ledger.transactions_in(HeightRange::new(0, best).unwrap()).await.unwrap();
            for tx in &txs {
                for output in &tx.outputs {
                    let inflow = common::inflow(&*store, output.id).await;
                    if tx.is_coinbase() || tx.total_input_value() == 0 {
                        prop_assert_eq!(inflow, Decimal::ZERO);
                    } else {
                        let diff = (inflow - Decimal::from(output.value)).abs();
                        prop_assert!(diff <= tolerance(), "{} off by {}", output.id, diff);
                    }
                }
            }

            Ok(())
        })?;
    }

    /// A sources trace redistributes exactly the start's value
    #[test]
    fn prop_sources_trace_keeps_mass((coinbases, plans) in ledger_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();

        rt.block_on(async {
            let ledger = Arc::new(generated_ledger(&coinbases, &plans));
            let store = Arc::new(MemoryFlowStore::new());
            Synchronizer::new(store.clone(), ledger, &test_config(4))
                .synchronize(SyncOptions::default())
                .await
                .unwrap();

            let mut config = test_config(4);
            config.trace.default_max_depth = None;
            let engine = TraceEngine::new(store.clone(), &config);

            for node in store.all_nodes() {
                let inflow = store.edges(node.output_id, Direction::Sources).await.unwrap();
                if node.value == 0 || inflow.is_empty() {
                    continue;
                }
                let result = engine
                    .trace(&TraceRequest::sources(NodeRef::Output(node.output_id)))
                    .await
                    .unwrap();
                let diff = (result.total() - Decimal::from(node.value)).abs();
                prop_assert!(diff <= tolerance(), "{} off by {}", node.output_id, diff);

                // Every source is a node without inflow
                for source in result.contributions.keys() {
                    prop_assert!(store.edges(*source, Direction::Sources).await.unwrap().is_empty());
                }
            }

            Ok(())
        })?;
    }
}
