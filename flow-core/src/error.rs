//! Error types for the flow graph

use ledger_model::{OutputId, TxId};
use thiserror::Error;

/// Result type for flow graph operations
pub type Result<T> = std::result::Result<T, Error>;

/// Flow graph errors
#[derive(Error, Debug)]
pub enum Error {
    /// Manual proportion that cannot be honoured
    #[error("Invalid override in {tx_id} (input {input_index}, output {output_index}): {reason}")]
    InvalidOverride {
        /// Transaction the override belongs to
        tx_id: TxId,
        /// Input position within the transaction
        input_index: usize,
        /// Output position within the transaction
        output_index: usize,
        /// What is wrong with it
        reason: String,
    },

    /// Store failure worth retrying (timeout, connection loss, busy)
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Retries exhausted; resume from `last_committed_height`
    #[error(
        "Synchronization aborted after {attempts} attempts (last committed height: {last_committed_height:?}): {reason}"
    )]
    SynchronizationAborted {
        /// Highest block whose writes are all committed
        last_committed_height: Option<u64>,
        /// Attempts made for the failing write
        attempts: u32,
        /// Last underlying error
        reason: String,
    },

    /// Graph state that must never occur (dangling edge, self-loop, ...)
    #[error("Graph consistency violation: {0}")]
    GraphConsistency(String),

    /// Input whose spent output is unknown to the ledger
    #[error("Missing precedent for input {input_index} of {tx_id}")]
    MissingPrecedent {
        /// Offending transaction
        tx_id: TxId,
        /// Input position within the transaction
        input_index: usize,
    },

    /// Node not present in the store
    #[error("Node not found: {0}")]
    NodeNotFound(OutputId),

    /// Transaction not present in the ledger
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TxId),

    /// Ledger source error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_model::Error),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientStore(_))
    }

    pub(crate) fn invalid_override(
        tx_id: TxId,
        input_index: usize,
        output_index: usize,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidOverride {
            tx_id,
            input_index,
            output_index,
            reason: reason.into(),
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::Busy | ErrorKind::TryAgain | ErrorKind::Incomplete => {
                Error::TransientStore(err.to_string())
            }
            _ => Error::Storage(err.to_string()),
        }
    }
}
