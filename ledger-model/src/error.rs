//! Error types for the ledger model

use crate::types::{OutputId, TxId};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Transaction not found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TxId),

    /// Output not found
    #[error("Output not found: {0}")]
    OutputNotFound(OutputId),

    /// Height range is empty or inverted
    #[error("Invalid height range: {start}..={end}")]
    InvalidRange {
        /// First height
        start: u64,
        /// Last height
        end: u64,
    },

    /// Block inserted out of order or with inconsistent transactions
    #[error("Invalid block at height {height}: {reason}")]
    InvalidBlock {
        /// Block height
        height: u64,
        /// What is wrong with it
        reason: String,
    },

    /// Backing source failure
    #[error("Ledger source error: {0}")]
    Source(String),
}
