//! Core ledger types
//!
//! All identifiers are assigned monotonically in ledger order (block height,
//! then position in block, then position in transaction). Values are integer
//! amounts in the smallest ledger unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Value in the smallest ledger unit
pub type Amount = u64;

macro_rules! ledger_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            /// Raw numeric value
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

ledger_id!(
    /// Globally unique output identifier
    OutputId,
    "out:"
);
ledger_id!(
    /// Globally unique input identifier
    InputId,
    "in:"
);
ledger_id!(
    /// Transaction identifier
    TxId,
    "tx:"
);
ledger_id!(
    /// Address identifier
    AddressId,
    "addr:"
);

/// Position of a transaction in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxPosition {
    /// Block height
    pub height: u64,
    /// Index within the block
    pub index_in_block: u32,
}

impl fmt::Display for TxPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height, self.index_in_block)
    }
}

/// Owning address of an output
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Address id
    pub id: AddressId,
    /// Encoded address string
    pub addr: String,
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    /// Output id
    pub id: OutputId,
    /// Index within the transaction
    pub index_in_tx: u32,
    /// Value
    pub value: Amount,
    /// Owner, absent for unspendable outputs
    pub address: Option<Address>,
    /// False for outputs whose address could not be determined
    pub valid: bool,
}

impl Output {
    /// Owning address id, if any
    pub fn address_id(&self) -> Option<AddressId> {
        self.address.as_ref().map(|a| a.id)
    }
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    /// Input id
    pub id: InputId,
    /// Index within the transaction
    pub index_in_tx: u32,
    /// Spent output (None for coinbase inputs or unresolved references)
    pub prev_output: Option<Output>,
}

impl Input {
    /// Value consumed by this input
    pub fn value(&self) -> Amount {
        self.prev_output.as_ref().map_or(0, |o| o.value)
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id
    pub id: TxId,
    /// Height of the containing block
    pub block_height: u64,
    /// Index within the block
    pub index_in_block: u32,
    /// Inputs, ordered by `index_in_tx`
    pub inputs: Vec<Input>,
    /// Outputs, ordered by `index_in_tx`
    pub outputs: Vec<Output>,
}

impl Transaction {
    /// Coinbase transactions are the first transaction of each block
    pub fn is_coinbase(&self) -> bool {
        self.index_in_block == 0
    }

    /// Sum of the values of all spent outputs, 0 for coinbase
    pub fn total_input_value(&self) -> Amount {
        if self.is_coinbase() {
            return 0;
        }
        self.inputs.iter().map(Input::value).sum()
    }

    /// Sum of output values
    pub fn total_output_value(&self) -> Amount {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Ledger position
    pub fn position(&self) -> TxPosition {
        TxPosition {
            height: self.block_height,
            index_in_block: self.index_in_block,
        }
    }

    /// Input values in input order
    pub fn input_values(&self) -> Vec<Amount> {
        self.inputs.iter().map(Input::value).collect()
    }

    /// Output values in output order
    pub fn output_values(&self) -> Vec<Amount> {
        self.outputs.iter().map(|o| o.value).collect()
    }

    /// Position of an input within this transaction
    pub fn input_index(&self, id: InputId) -> Option<usize> {
        self.inputs.iter().position(|i| i.id == id)
    }

    /// Position of an output within this transaction
    pub fn output_index(&self, id: OutputId) -> Option<usize> {
        self.outputs.iter().position(|o| o.id == id)
    }

    /// First non-coinbase input whose spent output is unknown
    pub fn first_unresolved_input(&self) -> Option<&Input> {
        if self.is_coinbase() {
            return None;
        }
        self.inputs.iter().find(|i| i.prev_output.is_none())
    }
}

/// Block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Height
    pub height: u64,
    /// Block time
    pub timestamp: Option<DateTime<Utc>>,
    /// Transactions, ordered by `index_in_block`
    pub transactions: Vec<Transaction>,
}

/// Inclusive range of block heights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeightRange {
    /// First height
    pub start: u64,
    /// Last height (inclusive)
    pub end: u64,
}

impl HeightRange {
    /// Create a range, rejecting inverted bounds
    pub fn new(start: u64, end: u64) -> crate::Result<Self> {
        if start > end {
            return Err(crate::Error::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Number of heights covered, saturating at `u64::MAX`
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    /// Ranges are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `height` falls inside the range
    pub fn contains(&self, height: u64) -> bool {
        self.start <= height && height <= self.end
    }

    /// Split into consecutive sub-ranges of at most `size` heights
    ///
    /// The final chunk holds the remainder. A zero size yields the whole
    /// range. Chunks are produced lazily.
    pub fn chunks(&self, size: u64) -> Chunks {
        Chunks {
            next: Some(self.start),
            end: self.end,
            step: size.checked_sub(1).unwrap_or(u64::MAX),
        }
    }
}

/// Iterator returned by [`HeightRange::chunks`]
#[derive(Debug, Clone)]
pub struct Chunks {
    next: Option<u64>,
    end: u64,
    step: u64,
}

impl Iterator for Chunks {
    type Item = HeightRange;

    fn next(&mut self) -> Option<HeightRange> {
        let start = self.next?;
        let end = start.saturating_add(self.step).min(self.end);
        self.next = if end == self.end { None } else { Some(end + 1) };
        Some(HeightRange { start, end })
    }
}

impl fmt::Display for HeightRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}
