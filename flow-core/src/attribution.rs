//! Proportional attribution of input value to outputs
//!
//! # Algorithm
//!
//! 1. No input value (coinbase, zero-value spend): all-zero matrix
//! 2. Overridden cells are fixed at `input × proportion`
//! 3. Fixed amounts are subtracted from the input (row) and output (column)
//!    capacities
//! 4. Each output's remaining capacity is split across its free cells in
//!    proportion to the remaining capacity of their inputs
//! 5. The last free cell of a column takes the exact remainder, so every
//!    column sums to the output value
//!
//! Without overrides this is the haircut rule:
//! `cell[i][j] = input[i] / Σ inputs × output[j]`.
//!
//! # Example
//!
//! ```text
//! inputs {30, 70}, output {100}, override (0, 0) = 0.5
//!
//!   fixed:      cell[0][0] = 30 × 0.5 = 15
//!   remaining:  inputs {15, 70}, output {85}
//!   free cells: only (1, 0), takes all 85
//!
//!   result:     [[15], [85]]   column sum 100
//! ```

use crate::{
    config::AttributionConfig,
    types::FlowEdge,
    Error, Result,
};
use ledger_model::{Amount, OutputId, Transaction, TxId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Fixed share of one input assigned to one output, by matrix position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellOverride {
    /// Input position
    pub input: usize,
    /// Output position
    pub output: usize,
    /// Share of the input's value, in `[0, 1]`
    pub proportion: Decimal,
}

/// Input × output attribution matrix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    inputs: usize,
    outputs: usize,
    /// Row-major cells
    cells: Vec<Decimal>,
}

impl Distribution {
    /// All-zero matrix
    pub fn zeros(inputs: usize, outputs: usize) -> Self {
        Self {
            inputs,
            outputs,
            cells: vec![Decimal::ZERO; inputs * outputs],
        }
    }

    /// Number of rows
    pub fn input_count(&self) -> usize {
        self.inputs
    }

    /// Number of columns
    pub fn output_count(&self) -> usize {
        self.outputs
    }

    /// Amount attributed from input `i` to output `j`
    pub fn get(&self, i: usize, j: usize) -> Decimal {
        self.cells[i * self.outputs + j]
    }

    fn set(&mut self, i: usize, j: usize, value: Decimal) {
        self.cells[i * self.outputs + j] = value;
    }

    /// Total attributed into output `j`
    pub fn column_sum(&self, j: usize) -> Decimal {
        (0..self.inputs).map(|i| self.get(i, j)).sum()
    }

    /// Total attributed out of input `i`
    pub fn row_sum(&self, i: usize) -> Decimal {
        (0..self.outputs).map(|j| self.get(i, j)).sum()
    }

    /// Non-zero cells as `(input, output, amount)`
    pub fn nonzero(&self) -> impl Iterator<Item = (usize, usize, Decimal)> + '_ {
        self.cells.iter().enumerate().filter(|(_, v)| !v.is_zero()).map(move |(k, v)| {
            (k / self.outputs, k % self.outputs, *v)
        })
    }

    /// Whether no cell carries value
    pub fn is_zero(&self) -> bool {
        self.cells.iter().all(|v| v.is_zero())
    }
}

/// Computes attribution matrices
#[derive(Debug, Clone)]
pub struct AttributionCalculator {
    /// Free cells below this amount are dropped
    negligible_value: Decimal,
}

impl Default for AttributionCalculator {
    fn default() -> Self {
        Self::new(&AttributionConfig::default())
    }
}

impl AttributionCalculator {
    /// Create calculator
    pub fn new(config: &AttributionConfig) -> Self {
        Self {
            negligible_value: config.negligible_value,
        }
    }

    /// Compute the distribution matrix for one transaction's values
    ///
    /// `tx_id` only labels errors.
    pub fn compute(
        &self,
        tx_id: TxId,
        inputs: &[Amount],
        outputs: &[Amount],
        overrides: &[CellOverride],
    ) -> Result<Distribution> {
        let (n, m) = (inputs.len(), outputs.len());
        let mut matrix = Distribution::zeros(n, m);

        // Step 2: fixed cells
        let mut fixed = vec![false; n * m];
        let mut seen = HashSet::with_capacity(overrides.len());
        for ov in overrides {
            let (i, j) = (ov.input, ov.output);
            if i >= n || j >= m {
                return Err(Error::invalid_override(tx_id, i, j, "position outside transaction"));
            }
            if !seen.insert((i, j)) {
                return Err(Error::invalid_override(tx_id, i, j, "pair overridden more than once"));
            }
            if ov.proportion < Decimal::ZERO || ov.proportion > Decimal::ONE {
                return Err(Error::invalid_override(
                    tx_id,
                    i,
                    j,
                    format!("proportion {} outside [0, 1]", ov.proportion),
                ));
            }

            let input_value = Decimal::from(inputs[i]);
            let amount = input_value.checked_mul(ov.proportion).ok_or_else(|| {
                Error::invalid_override(tx_id, i, j, "attributed amount overflows")
            })?;
            if amount > input_value {
                return Err(Error::invalid_override(tx_id, i, j, "exceeds input value"));
            }
            if amount > Decimal::from(outputs[j]) {
                return Err(Error::invalid_override(
                    tx_id,
                    i,
                    j,
                    format!("{} exceeds output value {}", amount, outputs[j]),
                ));
            }

            fixed[i * m + j] = true;
            matrix.set(i, j, amount);
        }

        // Step 1: nothing consumed, nothing to attribute
        let total_in: Decimal = inputs.iter().map(|&v| Decimal::from(v)).sum();
        if total_in.is_zero() {
            return Ok(Distribution::zeros(n, m));
        }

        // Step 3: remaining capacities
        let mut remaining_in = Vec::with_capacity(n);
        for (i, &value) in inputs.iter().enumerate() {
            let left = Decimal::from(value) - matrix.row_sum(i);
            if left < Decimal::ZERO {
                return Err(Error::invalid_override(
                    tx_id,
                    i,
                    first_fixed_in_row(&fixed, i, m),
                    format!("overrides on input exceed its value {} by {}", value, -left),
                ));
            }
            remaining_in.push(left);
        }

        // Steps 4-5: split each column's remainder across its free cells
        for (j, &value) in outputs.iter().enumerate() {
            let left = Decimal::from(value) - matrix.column_sum(j);
            if left < Decimal::ZERO {
                return Err(Error::invalid_override(
                    tx_id,
                    first_fixed_in_column(&fixed, j, m),
                    j,
                    format!("overrides on output exceed its value {} by {}", value, -left),
                ));
            }
            if left.is_zero() {
                continue;
            }

            let free: Vec<usize> = (0..n)
                .filter(|&i| !fixed[i * m + j] && remaining_in[i] > Decimal::ZERO)
                .collect();
            let weight: Decimal = free.iter().map(|&i| remaining_in[i]).sum();

            if weight.is_zero() {
                if left < self.negligible_value {
                    continue;
                }
                return Err(Error::invalid_override(
                    tx_id,
                    first_fixed_in_column(&fixed, j, m),
                    j,
                    format!("no free input can carry the remaining {} of the output", left),
                ));
            }

            let mut assigned = Decimal::ZERO;
            for (k, &i) in free.iter().enumerate() {
                let share = if k + 1 == free.len() {
                    (left - assigned).max(Decimal::ZERO)
                } else {
                    scale(left, remaining_in[i], weight)
                };
                assigned += share;
                matrix.set(i, j, share);
            }
        }

        // Step 6: drop dust in free cells
        for (k, cell) in matrix.cells.iter_mut().enumerate() {
            if !fixed[k] && *cell < self.negligible_value {
                *cell = Decimal::ZERO;
            }
        }

        Ok(matrix)
    }

    /// Distribution for a ledger transaction
    ///
    /// Coinbase transactions always yield an all-zero matrix.
    pub fn for_transaction(
        &self,
        tx: &Transaction,
        overrides: &[CellOverride],
    ) -> Result<Distribution> {
        if tx.is_coinbase() {
            return Ok(Distribution::zeros(tx.inputs.len(), tx.outputs.len()));
        }
        self.compute(tx.id, &tx.input_values(), &tx.output_values(), overrides)
    }

    /// Edges a transaction contributes to the flow graph
    ///
    /// Fails with `MissingPrecedent` when a non-coinbase input has no
    /// resolved previous output. Cells sharing a `(from, to)` pair are merged.
    pub fn edges(&self, tx: &Transaction, overrides: &[CellOverride]) -> Result<Vec<FlowEdge>> {
        if let Some(input) = tx.first_unresolved_input() {
            return Err(Error::MissingPrecedent {
                tx_id: tx.id,
                input_index: input.index_in_tx as usize,
            });
        }

        let distribution = self.for_transaction(tx, overrides)?;

        let mut merged: BTreeMap<(OutputId, OutputId), Decimal> = BTreeMap::new();
        for (i, j, value) in distribution.nonzero() {
            let from = match &tx.inputs[i].prev_output {
                Some(prev) => prev.id,
                None => continue,
            };
            let to = tx.outputs[j].id;
            if from >= to {
                return Err(Error::GraphConsistency(format!(
                    "{} in {} would create edge {} -> {} against ledger order",
                    tx.inputs[i].id, tx.id, from, to
                )));
            }
            *merged.entry((from, to)).or_insert(Decimal::ZERO) += value;
        }

        Ok(merged
            .into_iter()
            .map(|((from, to), value)| FlowEdge { from, to, value })
            .collect())
    }
}

fn first_fixed_in_row(fixed: &[bool], i: usize, m: usize) -> usize {
    (0..m).find(|&j| fixed[i * m + j]).unwrap_or(0)
}

fn first_fixed_in_column(fixed: &[bool], j: usize, m: usize) -> usize {
    fixed
        .chunks(m.max(1))
        .position(|row| row.get(j).copied().unwrap_or(false))
        .unwrap_or(0)
}

/// `amount × part / whole`, multiplying first so terminating results stay
/// exact. Falls back to dividing first when the product overflows.
pub(crate) fn scale(amount: Decimal, part: Decimal, whole: Decimal) -> Decimal {
    match amount.checked_mul(part) {
        Some(product) => product / whole,
        None => amount * (part / whole),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_model::LedgerBuilder;

    fn calc() -> AttributionCalculator {
        AttributionCalculator::new(&AttributionConfig {
            negligible_value: Decimal::ZERO,
        })
    }

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    #[test]
    fn test_haircut_two_inputs_one_output() {
        let m = calc().compute(TxId(1), &[30, 70], &[100], &[]).unwrap();
        assert_eq!(m.get(0, 0), dec(30));
        assert_eq!(m.get(1, 0), dec(70));
        assert_eq!(m.column_sum(0), dec(100));
    }

    #[test]
    fn test_haircut_with_fee() {
        // 10 units of fee: outputs receive 90, split 1:3
        let m = calc().compute(TxId(1), &[25, 75], &[60, 30], &[]).unwrap();
        assert_eq!(m.get(0, 0), dec(15));
        assert_eq!(m.get(1, 0), dec(45));
        assert_eq!(m.get(0, 1), Decimal::new(75, 1));
        assert_eq!(m.get(1, 1), Decimal::new(225, 1));
        assert_eq!(m.row_sum(0) + m.row_sum(1), dec(90));
    }

    #[test]
    fn test_override_remainder_goes_to_free_cells() {
        let ov = CellOverride { input: 0, output: 0, proportion: Decimal::new(5, 1) };
        let m = calc().compute(TxId(1), &[30, 70], &[100], &[ov]).unwrap();
        assert_eq!(m.get(0, 0), dec(15));
        assert_eq!(m.get(1, 0), dec(85));
        assert_eq!(m.column_sum(0), dec(100));
    }

    #[test]
    fn test_two_overrides_on_same_output() {
        let overrides = [
            CellOverride { input: 0, output: 0, proportion: Decimal::new(5, 1) },
            CellOverride { input: 1, output: 0, proportion: Decimal::new(2, 1) },
        ];
        let m = calc().compute(TxId(1), &[40, 50, 60], &[100, 40], &overrides).unwrap();
        assert_eq!(m.get(0, 0), dec(20));
        assert_eq!(m.get(1, 0), dec(10));
        assert_eq!(m.get(2, 0), dec(70));
        assert_eq!(m.column_sum(0), dec(100));
        assert_eq!(m.column_sum(1), dec(40));
    }

    #[test]
    fn test_zero_input_value_yields_zero_matrix() {
        let m = calc().compute(TxId(1), &[0, 0], &[10], &[]).unwrap();
        assert!(m.is_zero());
    }

    #[test]
    fn test_zero_value_output_has_no_cells() {
        let m = calc().compute(TxId(1), &[10, 20], &[0, 30], &[]).unwrap();
        assert!(m.get(0, 0).is_zero());
        assert!(m.get(1, 0).is_zero());
        assert_eq!(m.column_sum(1), dec(30));
    }

    #[test]
    fn test_override_exceeding_output_rejected() {
        let ov = CellOverride { input: 0, output: 0, proportion: Decimal::ONE };
        let err = calc().compute(TxId(9), &[80, 20], &[50, 50], &[ov]).unwrap_err();
        assert!(matches!(err, Error::InvalidOverride { tx_id: TxId(9), input_index: 0, output_index: 0, .. }));
    }

    #[test]
    fn test_overrides_exceeding_input_rejected() {
        let overrides = [
            CellOverride { input: 0, output: 0, proportion: Decimal::new(7, 1) },
            CellOverride { input: 0, output: 1, proportion: Decimal::new(7, 1) },
        ];
        let err = calc().compute(TxId(3), &[100], &[100, 100], &overrides).unwrap_err();
        assert!(matches!(err, Error::InvalidOverride { input_index: 0, .. }));
    }

    #[test]
    fn test_unattributable_remainder_rejected() {
        let ov = CellOverride { input: 0, output: 0, proportion: Decimal::new(5, 1) };
        let err = calc().compute(TxId(4), &[100], &[100], &[ov]).unwrap_err();
        assert!(err.to_string().contains("no free input"));
    }

    #[test]
    fn test_duplicate_and_out_of_range_overrides_rejected() {
        let ov = CellOverride { input: 0, output: 0, proportion: Decimal::new(1, 1) };
        assert!(calc().compute(TxId(1), &[10, 10], &[20], &[ov, ov]).is_err());

        let far = CellOverride { input: 5, output: 0, proportion: Decimal::ONE };
        assert!(calc().compute(TxId(1), &[10], &[10], &[far]).is_err());
    }

    #[test]
    fn test_dust_cells_dropped() {
        let calc = AttributionCalculator::new(&AttributionConfig {
            negligible_value: Decimal::new(1, 2),
        });
        // 1 / 1_000_001 of one unit is dust
        let m = calc.compute(TxId(1), &[1, 1_000_000], &[1], &[]).unwrap();
        assert!(m.get(0, 0).is_zero());
        assert!(!m.get(1, 0).is_zero());
    }

    #[test]
    fn test_thirds_sum_exactly() {
        let m = calc().compute(TxId(1), &[1, 1, 1], &[100], &[]).unwrap();
        assert_eq!(m.column_sum(0), dec(100));
        assert!(m.get(0, 0) > dec(33) && m.get(0, 0) < dec(34));
    }

    #[test]
    fn test_non_terminating_weight_stays_exact() {
        // 36 × 50/60 is exactly 30 even though 50/60 is not
        let m = calc().compute(TxId(1), &[50, 10], &[36, 24], &[]).unwrap();
        assert_eq!(m.get(0, 0), dec(30));
        assert_eq!(m.get(1, 0), dec(6));
        assert_eq!(m.get(0, 1), dec(20));
        assert_eq!(m.get(1, 1), dec(4));
    }

    #[test]
    fn test_edges_for_transaction() {
        let mut builder = LedgerBuilder::new();
        let a = builder.coinbase(&[(Some("a"), 30)]);
        let b = builder.coinbase(&[(Some("b"), 70)]);
        let c = builder.transaction(&[a[0], b[0]], &[(Some("c"), 100)]);
        let tx = builder.blocks()[1].transactions[1].clone();

        let edges = calc().edges(&tx, &[]).unwrap();
        assert_eq!(
            edges,
            vec![
                FlowEdge { from: a[0], to: c[0], value: dec(30) },
                FlowEdge { from: b[0], to: c[0], value: dec(70) },
            ]
        );
    }

    #[test]
    fn test_coinbase_has_no_edges() {
        let mut builder = LedgerBuilder::new();
        builder.coinbase(&[(Some("miner"), 50)]);
        let tx = builder.blocks()[0].transactions[0].clone();
        assert!(calc().edges(&tx, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_missing_precedent() {
        let mut builder = LedgerBuilder::new();
        let a = builder.coinbase(&[(Some("a"), 30)]);
        builder.transaction(&[a[0], OutputId(999)], &[(Some("b"), 30)]);
        let tx = builder.blocks()[0].transactions[1].clone();

        let err = calc().edges(&tx, &[]).unwrap_err();
        assert!(matches!(err, Error::MissingPrecedent { input_index: 1, .. }));
    }

    #[test]
    fn test_same_prev_output_twice_merges_edge() {
        let mut builder = LedgerBuilder::new();
        let a = builder.coinbase(&[(Some("a"), 40)]);
        let c = builder.transaction(&[a[0], a[0]], &[(Some("c"), 80)]);
        let tx = builder.blocks()[0].transactions[1].clone();

        let edges = calc().edges(&tx, &[]).unwrap();
        assert_eq!(edges, vec![FlowEdge { from: a[0], to: c[0], value: dec(80) }]);
    }
}
