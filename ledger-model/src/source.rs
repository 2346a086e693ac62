//! Ledger source contract
//!
//! The flow graph never talks to the raw data provider. It reads normalized
//! transactions through `LedgerSource`, page by page, in ascending
//! `(block_height, index_in_block)` order.

use crate::{
    error::Result,
    types::{HeightRange, OutputId, Transaction, TxId},
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

/// Read access to normalized ledger entities
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// All transactions with heights inside `range`, ordered by ledger position
    async fn transactions_in(&self, range: HeightRange) -> Result<Vec<Transaction>>;

    /// Highest block height available, None for an empty ledger
    async fn best_height(&self) -> Result<Option<u64>>;

    /// Height of the block containing the given output
    async fn height_of_output(&self, output_id: OutputId) -> Result<Option<u64>>;

    /// Transaction by id
    async fn transaction(&self, tx_id: TxId) -> Result<Option<Transaction>>;

    /// Transaction that created the given output
    async fn transaction_of_output(&self, output_id: OutputId) -> Result<Option<Transaction>>;
}

/// Lazily iterate transactions in `range`, fetching `page_size` blocks per request
///
/// Pages are requested only when the consumer reaches them, so iteration can
/// be restarted from any height by building a new stream.
pub fn iterate_transactions<'a, L>(
    source: &'a L,
    range: HeightRange,
    page_size: u64,
) -> BoxStream<'a, Result<Transaction>>
where
    L: LedgerSource + ?Sized,
{
    stream::iter(range.chunks(page_size))
        .then(move |page| async move {
            tracing::trace!(page = %page, "Fetching ledger page");
            source.transactions_in(page).await
        })
        .map_ok(|txs| stream::iter(txs.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
}
