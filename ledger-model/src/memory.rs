//! In-memory ledger
//!
//! `MemoryLedger` holds fully normalized blocks and serves them through
//! `LedgerSource`. `LedgerBuilder` assembles one while assigning ids in
//! ledger order, the same way the normalization layer numbers entities.

use crate::{
    error::{Error, Result},
    source::LedgerSource,
    types::{
        Address, AddressId, Amount, Block, HeightRange, Input, InputId, Output, OutputId,
        Transaction, TxId,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct Inner {
    /// Blocks by height
    blocks: BTreeMap<u64, Block>,
    /// tx_id -> (height, index in block)
    tx_index: HashMap<TxId, (u64, usize)>,
    /// output_id -> tx_id
    output_index: HashMap<OutputId, TxId>,
}

/// Ledger held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: RwLock<Inner>,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block
    ///
    /// Blocks must arrive in strictly ascending height order and every
    /// transaction must carry the block's height and its own position.
    pub fn insert_block(&self, block: Block) -> Result<()> {
        let mut inner = self.inner.write();

        if let Some((&last, _)) = inner.blocks.iter().next_back() {
            if block.height <= last {
                return Err(Error::InvalidBlock {
                    height: block.height,
                    reason: format!("not above current tip {}", last),
                });
            }
        }

        for (index, tx) in block.transactions.iter().enumerate() {
            if tx.block_height != block.height || tx.index_in_block as usize != index {
                return Err(Error::InvalidBlock {
                    height: block.height,
                    reason: format!("{} is at {} but listed at index {}", tx.id, tx.position(), index),
                });
            }
        }

        for (index, tx) in block.transactions.iter().enumerate() {
            inner.tx_index.insert(tx.id, (block.height, index));
            for output in &tx.outputs {
                inner.output_index.insert(output.id, tx.id);
            }
        }

        tracing::debug!(
            height = block.height,
            tx_count = block.transactions.len(),
            "Block added to memory ledger"
        );

        inner.blocks.insert(block.height, block);
        Ok(())
    }

    /// Number of blocks held
    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }

    fn lookup(inner: &Inner, tx_id: TxId) -> Option<&Transaction> {
        let (height, index) = inner.tx_index.get(&tx_id)?;
        inner.blocks.get(height)?.transactions.get(*index)
    }
}

#[async_trait]
impl LedgerSource for MemoryLedger {
    async fn transactions_in(&self, range: HeightRange) -> Result<Vec<Transaction>> {
        let inner = self.inner.read();
        Ok(inner
            .blocks
            .range(range.start..=range.end)
            .flat_map(|(_, block)| block.transactions.iter().cloned())
            .collect())
    }

    async fn best_height(&self) -> Result<Option<u64>> {
        Ok(self.inner.read().blocks.keys().next_back().copied())
    }

    async fn height_of_output(&self, output_id: OutputId) -> Result<Option<u64>> {
        let inner = self.inner.read();
        Ok(inner
            .output_index
            .get(&output_id)
            .and_then(|tx_id| inner.tx_index.get(tx_id))
            .map(|(height, _)| *height))
    }

    async fn transaction(&self, tx_id: TxId) -> Result<Option<Transaction>> {
        let inner = self.inner.read();
        Ok(Self::lookup(&inner, tx_id).cloned())
    }

    async fn transaction_of_output(&self, output_id: OutputId) -> Result<Option<Transaction>> {
        let inner = self.inner.read();
        Ok(inner
            .output_index
            .get(&output_id)
            .and_then(|tx_id| Self::lookup(&inner, *tx_id))
            .cloned())
    }
}

/// Builds a `MemoryLedger`, numbering blocks, transactions, inputs and
/// outputs in ledger order
#[derive(Debug, Default)]
pub struct LedgerBuilder {
    blocks: Vec<Block>,
    outputs: HashMap<OutputId, Output>,
    addresses: HashMap<String, AddressId>,
    next_tx: u64,
    next_input: u64,
    next_output: u64,
}

impl LedgerBuilder {
    /// Create an empty builder; ids start at 1
    pub fn new() -> Self {
        Self {
            next_tx: 1,
            next_input: 1,
            next_output: 1,
            ..Default::default()
        }
    }

    /// Open a new block containing a coinbase transaction with the given outputs
    pub fn coinbase(&mut self, outputs: &[(Option<&str>, Amount)]) -> Vec<OutputId> {
        self.coinbase_at(None, outputs)
    }

    /// Like `coinbase`, with an explicit block time
    pub fn coinbase_at(
        &mut self,
        timestamp: Option<DateTime<Utc>>,
        outputs: &[(Option<&str>, Amount)],
    ) -> Vec<OutputId> {
        let height = self.blocks.len() as u64;
        self.blocks.push(Block {
            height,
            timestamp,
            transactions: Vec::new(),
        });
        self.push_transaction(&[], outputs)
    }

    /// Append a transaction to the current block
    ///
    /// Each entry of `spends` becomes one input. Ids the builder has never
    /// produced leave the input unresolved (`prev_output == None`). When no
    /// block is open an empty coinbase block is started first.
    pub fn transaction(
        &mut self,
        spends: &[OutputId],
        outputs: &[(Option<&str>, Amount)],
    ) -> Vec<OutputId> {
        if self.blocks.is_empty() {
            self.coinbase(&[]);
        }
        self.push_transaction(spends, outputs)
    }

    /// Id assigned to an address string, if it has been used
    pub fn address_id(&self, addr: &str) -> Option<AddressId> {
        self.addresses.get(addr).copied()
    }

    /// Finish building
    pub fn build(self) -> Result<MemoryLedger> {
        let ledger = MemoryLedger::new();
        for block in self.blocks {
            ledger.insert_block(block)?;
        }
        Ok(ledger)
    }

    /// Blocks built so far
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    fn push_transaction(
        &mut self,
        spends: &[OutputId],
        outputs: &[(Option<&str>, Amount)],
    ) -> Vec<OutputId> {
        let tx_id = TxId(self.next_tx);
        self.next_tx += 1;

        let inputs = spends
            .iter()
            .enumerate()
            .map(|(index, prev)| {
                let id = InputId(self.next_input);
                self.next_input += 1;
                Input {
                    id,
                    index_in_tx: index as u32,
                    prev_output: self.outputs.get(prev).cloned(),
                }
            })
            .collect();

        let mut created = Vec::with_capacity(outputs.len());
        let mut tx_outputs = Vec::with_capacity(outputs.len());
        for (index, (addr, value)) in outputs.iter().enumerate() {
            let id = OutputId(self.next_output);
            self.next_output += 1;

            let address = addr.map(|a| self.intern(a));
            let output = Output {
                id,
                index_in_tx: index as u32,
                value: *value,
                valid: address.is_some(),
                address,
            };
            self.outputs.insert(id, output.clone());
            tx_outputs.push(output);
            created.push(id);
        }

        // coinbase_at and transaction both open a block first
        let Some(block) = self.blocks.last_mut() else {
            return created;
        };
        block.transactions.push(Transaction {
            id: tx_id,
            block_height: block.height,
            index_in_block: block.transactions.len() as u32,
            inputs,
            outputs: tx_outputs,
        });

        created
    }

    fn intern(&mut self, addr: &str) -> Address {
        let next = self.addresses.len() as u64 + 1;
        let id = *self.addresses.entry(addr.to_string()).or_insert(AddressId(next));
        Address {
            id,
            addr: addr.to_string(),
        }
    }
}
