//! Core types for the value-flow graph
//!
//! Nodes are addressed by ledger output id only; whatever identifiers a
//! store uses internally never leak past the `FlowStore` boundary.

use crate::{attribution::CellOverride, Error, Result};
use ledger_model::{AddressId, Amount, InputId, Output, OutputId, Transaction, TxId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One spendable transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueNode {
    /// Ledger output id
    pub output_id: OutputId,

    /// Owning address (absent for unspendable outputs)
    pub address_id: Option<AddressId>,

    /// Output value
    pub value: Amount,
}

impl From<&Output> for ValueNode {
    fn from(output: &Output) -> Self {
        Self {
            output_id: output.id,
            address_id: output.address_id(),
            value: output.value,
        }
    }
}

/// Attributed value moving from a spent output to a newly created one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    /// Spent output
    pub from: OutputId,

    /// Created output
    pub to: OutputId,

    /// Attributed amount (exact decimal)
    pub value: Decimal,
}

impl FlowEdge {
    /// The end of the edge reached when walking in `direction`
    pub fn neighbor(&self, direction: Direction) -> OutputId {
        match direction {
            Direction::Sources => self.from,
            Direction::Destinations => self.to,
        }
    }
}

/// Walk direction over flow edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Follow edges backwards: where did the value come from
    Sources,
    /// Follow edges forwards: where did the value go
    Destinations,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sources => write!(f, "sources"),
            Direction::Destinations => write!(f, "destinations"),
        }
    }
}

/// Starting point of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRef {
    /// A single output
    Output(OutputId),
    /// Every output owned by an address
    Address(AddressId),
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Output(id) => write!(f, "{}", id),
            NodeRef::Address(id) => write!(f, "{}", id),
        }
    }
}

/// Manual constraint: `output` receives exactly `proportion × input.value`
/// from `input`, both within one transaction
///
/// Deserialization rejects proportions outside `[0, 1]`; membership in the
/// transaction is checked again when the proportion is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ProportionRecord")]
pub struct ManualProportion {
    tx_id: TxId,
    input_id: InputId,
    output_id: OutputId,
    proportion: Decimal,
}

#[derive(Deserialize)]
struct ProportionRecord {
    tx_id: TxId,
    input_id: InputId,
    output_id: OutputId,
    proportion: Decimal,
}

impl TryFrom<ProportionRecord> for ManualProportion {
    type Error = Error;

    fn try_from(record: ProportionRecord) -> Result<Self> {
        if record.proportion < Decimal::ZERO || record.proportion > Decimal::ONE {
            return Err(Error::invalid_override(
                record.tx_id,
                usize::MAX,
                usize::MAX,
                format!(
                    "proportion {} of {} to {} outside [0, 1]",
                    record.proportion, record.input_id, record.output_id
                ),
            ));
        }
        Ok(Self {
            tx_id: record.tx_id,
            input_id: record.input_id,
            output_id: record.output_id,
            proportion: record.proportion,
        })
    }
}

impl ManualProportion {
    /// Define a proportion between an input and an output of `tx`
    ///
    /// Fails when either side does not belong to `tx` or the proportion is
    /// outside `[0, 1]`.
    pub fn new(
        tx: &Transaction,
        input_id: InputId,
        output_id: OutputId,
        proportion: Decimal,
    ) -> Result<Self> {
        let input_index = tx.input_index(input_id);
        let output_index = tx.output_index(output_id);

        let (input_index, output_index) = match (input_index, output_index) {
            (Some(i), Some(j)) => (i, j),
            (i, j) => {
                return Err(Error::invalid_override(
                    tx.id,
                    i.unwrap_or(usize::MAX),
                    j.unwrap_or(usize::MAX),
                    format!("{} and {} are not both part of {}", input_id, output_id, tx.id),
                ))
            }
        };

        if proportion < Decimal::ZERO || proportion > Decimal::ONE {
            return Err(Error::invalid_override(
                tx.id,
                input_index,
                output_index,
                format!("proportion {} outside [0, 1]", proportion),
            ));
        }

        Ok(Self {
            tx_id: tx.id,
            input_id,
            output_id,
            proportion,
        })
    }

    /// Transaction the constraint belongs to
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    /// Constrained input
    pub fn input_id(&self) -> InputId {
        self.input_id
    }

    /// Constrained output
    pub fn output_id(&self) -> OutputId {
        self.output_id
    }

    /// Fixed share of the input's value
    pub fn proportion(&self) -> Decimal {
        self.proportion
    }

    /// Translate ids into matrix positions within `tx`
    pub fn resolve(&self, tx: &Transaction) -> Result<CellOverride> {
        if tx.id != self.tx_id {
            return Err(Error::GraphConsistency(format!(
                "override for {} applied to {}",
                self.tx_id, tx.id
            )));
        }

        match (tx.input_index(self.input_id), tx.output_index(self.output_id)) {
            (Some(input), Some(output)) => Ok(CellOverride {
                input,
                output,
                proportion: self.proportion,
            }),
            _ => Err(Error::GraphConsistency(format!(
                "{} no longer contains {} and {}",
                tx.id, self.input_id, self.output_id
            ))),
        }
    }
}
