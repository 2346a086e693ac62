//! Ledger Model
//!
//! Normalized, read-only view of a UTXO ledger as consumed by the value-flow
//! graph builder.
//!
//! # Contents
//!
//! - **Entities**: `Block`, `Transaction`, `Input`, `Output`, `Address`
//! - **Identifiers**: output/input/transaction/address ids, assigned in ledger order
//! - **Source contract**: `LedgerSource`, paginated and restartable from any height
//! - **In-memory ledger**: `MemoryLedger` plus `LedgerBuilder` for assembling one

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod source;
pub mod memory;
pub mod error;

// Re-exports
pub use error::{Error, Result};
pub use types::{
    Address, AddressId, Amount, Block, Chunks, HeightRange, Input, InputId, Output, OutputId,
    Transaction, TxId, TxPosition,
};
pub use source::{iterate_transactions, LedgerSource};
pub use memory::{LedgerBuilder, MemoryLedger};
