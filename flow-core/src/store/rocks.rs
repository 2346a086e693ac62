//! Persistent flow graph on RocksDB
//!
//! # Column Families
//!
//! - `nodes` - Value nodes (key: output_id)
//! - `edges_out` - Edge values by source (key: from || to)
//! - `edges_in` - Edge values by target (key: to || from)
//! - `address_index` - Outputs per address (key: address_id || output_id)
//!
//! All ids are encoded big-endian so key order equals ledger order.

use super::{check_edge_shape, check_same_node, BatchOutcome, FlowBatch, FlowStore, StoreStats};
use crate::{
    types::{Direction, FlowEdge, ValueNode},
    Config, Error, Result,
};
use async_trait::async_trait;
use ledger_model::{AddressId, OutputId};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction as ScanDirection,
    IteratorMode, Options, WriteBatch, DB,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

const CF_NODES: &str = "nodes";
const CF_EDGES_OUT: &str = "edges_out";
const CF_EDGES_IN: &str = "edges_in";
const CF_ADDRESS_INDEX: &str = "address_index";

/// Flow graph stored in RocksDB
pub struct RocksFlowStore {
    db: Arc<DB>,
    path: PathBuf,
}

impl fmt::Debug for RocksFlowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksFlowStore").field("path", &self.path).finish()
    }
}

impl RocksFlowStore {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_compaction_style(DBCompactionStyle::Universal);
        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_NODES, Self::cf_options_nodes()),
            ColumnFamilyDescriptor::new(CF_EDGES_OUT, Self::cf_options_edges()),
            ColumnFamilyDescriptor::new(CF_EDGES_IN, Self::cf_options_edges()),
            ColumnFamilyDescriptor::new(CF_ADDRESS_INDEX, Self::cf_options_index()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        tracing::info!(path = ?path, "Opened flow graph store");

        Ok(Self {
            db: Arc::new(db),
            path: path.clone(),
        })
    }

    fn cf_options_nodes() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_edges() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn node_key(id: OutputId) -> [u8; 8] {
        id.0.to_be_bytes()
    }

    fn pair_key(first: u64, second: u64) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&first.to_be_bytes());
        key[8..].copy_from_slice(&second.to_be_bytes());
        key
    }

    fn decode_id(bytes: &[u8]) -> Result<u64> {
        <[u8; 8]>::try_from(bytes)
            .map(u64::from_be_bytes)
            .map_err(|_| Error::Storage(format!("malformed key segment of {} bytes", bytes.len())))
    }

    /// `(second id, value)` for every key starting with `first`
    fn scan_pairs(&self, cf_name: &str, first: u64) -> Result<Vec<(u64, Box<[u8]>)>> {
        let cf = self.cf(cf_name)?;
        let prefix = first.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, ScanDirection::Forward));

        let mut found = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            found.push((Self::decode_id(&key[8..])?, value));
        }
        Ok(found)
    }

    fn get_node(&self, id: OutputId) -> Result<Option<ValueNode>> {
        let cf = self.cf(CF_NODES)?;
        match self.db.get_cf(&cf, Self::node_key(id))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_batch(&self, batch: &FlowBatch) -> Result<BatchOutcome> {
        let cf_nodes = self.cf(CF_NODES)?;
        let cf_out = self.cf(CF_EDGES_OUT)?;
        let cf_in = self.cf(CF_EDGES_IN)?;
        let cf_address = self.cf(CF_ADDRESS_INDEX)?;

        let mut write = WriteBatch::default();
        let mut outcome = BatchOutcome::default();

        // 1. Nodes
        let mut known: HashMap<OutputId, ValueNode> = HashMap::new();
        for node in &batch.nodes {
            if let Some(existing) = known.get(&node.output_id) {
                check_same_node(existing, node)?;
                continue;
            }
            match self.get_node(node.output_id)? {
                Some(existing) => check_same_node(&existing, node)?,
                None => {
                    write.put_cf(&cf_nodes, Self::node_key(node.output_id), bincode::serialize(node)?);
                    if let Some(address) = node.address_id {
                        write.put_cf(&cf_address, Self::pair_key(address.0, node.output_id.0), b"");
                    }
                    outcome.nodes_created += 1;
                }
            }
            known.insert(node.output_id, node.clone());
        }

        // 2. Edges
        let mut staged: HashSet<[u8; 16]> = HashSet::new();
        for edge in &batch.edges {
            check_edge_shape(edge)?;
            for end in [edge.from, edge.to] {
                if !known.contains_key(&end) && self.get_node(end)?.is_none() {
                    return Err(Error::GraphConsistency(format!(
                        "edge {} -> {} references missing node {}",
                        edge.from, edge.to, end
                    )));
                }
            }

            let out_key = Self::pair_key(edge.from.0, edge.to.0);
            if staged.contains(&out_key) || self.db.get_cf(&cf_out, out_key)?.is_some() {
                continue;
            }
            let value = bincode::serialize(&edge.value)?;
            write.put_cf(&cf_out, out_key, &value);
            write.put_cf(&cf_in, Self::pair_key(edge.to.0, edge.from.0), &value);
            staged.insert(out_key);
            outcome.edges_created += 1;
        }

        // Atomic commit
        self.db.write(write)?;

        tracing::debug!(
            nodes_created = outcome.nodes_created,
            edges_created = outcome.edges_created,
            "Flow batch committed"
        );

        Ok(outcome)
    }

    fn read_edges(&self, id: OutputId, direction: Direction) -> Result<Vec<FlowEdge>> {
        let cf_name = match direction {
            Direction::Sources => CF_EDGES_IN,
            Direction::Destinations => CF_EDGES_OUT,
        };

        self.scan_pairs(cf_name, id.0)?
            .into_iter()
            .map(|(other, bytes)| {
                let value: Decimal = bincode::deserialize(&bytes)?;
                let other = OutputId(other);
                Ok(match direction {
                    Direction::Sources => FlowEdge { from: other, to: id, value },
                    Direction::Destinations => FlowEdge { from: id, to: other, value },
                })
            })
            .collect()
    }

    fn remove_edges_into(&self, id: OutputId) -> Result<usize> {
        let cf_out = self.cf(CF_EDGES_OUT)?;
        let cf_in = self.cf(CF_EDGES_IN)?;

        let sources = self.scan_pairs(CF_EDGES_IN, id.0)?;
        let mut write = WriteBatch::default();
        for (from, _) in &sources {
            write.delete_cf(&cf_in, Self::pair_key(id.0, *from));
            write.delete_cf(&cf_out, Self::pair_key(*from, id.0));
        }
        self.db.write(write)?;

        Ok(sources.len())
    }

    fn remove_top_nodes(&self, limit: usize) -> Result<usize> {
        let cf_nodes = self.cf(CF_NODES)?;
        let cf_out = self.cf(CF_EDGES_OUT)?;
        let cf_in = self.cf(CF_EDGES_IN)?;
        let cf_address = self.cf(CF_ADDRESS_INDEX)?;

        let mut doomed = Vec::with_capacity(limit.min(1024));
        for item in self.db.iterator_cf(&cf_nodes, IteratorMode::End).take(limit) {
            let (_, value) = item?;
            let node: ValueNode = bincode::deserialize(&value)?;
            doomed.push(node);
        }

        let mut write = WriteBatch::default();
        for node in &doomed {
            let id = node.output_id.0;
            for (to, _) in self.scan_pairs(CF_EDGES_OUT, id)? {
                write.delete_cf(&cf_out, Self::pair_key(id, to));
                write.delete_cf(&cf_in, Self::pair_key(to, id));
            }
            for (from, _) in self.scan_pairs(CF_EDGES_IN, id)? {
                write.delete_cf(&cf_in, Self::pair_key(id, from));
                write.delete_cf(&cf_out, Self::pair_key(from, id));
            }
            if let Some(address) = node.address_id {
                write.delete_cf(&cf_address, Self::pair_key(address.0, id));
            }
            write.delete_cf(&cf_nodes, Self::node_key(node.output_id));
        }
        self.db.write(write)?;

        Ok(doomed.len())
    }

    fn count_keys(&self, cf_name: &str) -> Result<u64> {
        let cf = self.cf(cf_name)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn highest_node(&self) -> Result<Option<OutputId>> {
        let cf = self.cf(CF_NODES)?;
        let last = self.db.iterator_cf(&cf, IteratorMode::End).next().transpose()?;
        last.map(|(key, _)| Self::decode_id(&key).map(OutputId)).transpose()
    }

    fn address_nodes(&self, address: AddressId) -> Result<Vec<ValueNode>> {
        let mut nodes = Vec::new();
        for (output, _) in self.scan_pairs(CF_ADDRESS_INDEX, address.0)? {
            match self.get_node(OutputId(output))? {
                Some(node) => nodes.push(node),
                None => {
                    return Err(Error::GraphConsistency(format!(
                        "{} indexed under {} but not stored",
                        OutputId(output),
                        address
                    )))
                }
            }
        }
        Ok(nodes)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("Flow graph store closed");
        Ok(())
    }
}

#[async_trait]
impl FlowStore for RocksFlowStore {
    async fn upsert_node(&self, node: &ValueNode) -> Result<bool> {
        let batch = FlowBatch {
            nodes: vec![node.clone()],
            edges: Vec::new(),
        };
        Ok(self.write_batch(&batch)?.nodes_created == 1)
    }

    async fn upsert_edge(&self, edge: &FlowEdge) -> Result<bool> {
        let batch = FlowBatch {
            nodes: Vec::new(),
            edges: vec![edge.clone()],
        };
        Ok(self.write_batch(&batch)?.edges_created == 1)
    }

    async fn apply_batch(&self, batch: &FlowBatch) -> Result<BatchOutcome> {
        self.write_batch(batch)
    }

    async fn node(&self, id: OutputId) -> Result<Option<ValueNode>> {
        self.get_node(id)
    }

    async fn max_node_id(&self) -> Result<Option<OutputId>> {
        self.highest_node()
    }

    async fn edges(&self, id: OutputId, direction: Direction) -> Result<Vec<FlowEdge>> {
        self.read_edges(id, direction)
    }

    async fn nodes_of_address(&self, address: AddressId) -> Result<Vec<ValueNode>> {
        self.address_nodes(address)
    }

    async fn delete_edges_into(&self, id: OutputId) -> Result<usize> {
        self.remove_edges_into(id)
    }

    async fn delete_node_batch(&self, limit: usize) -> Result<usize> {
        self.remove_top_nodes(limit)
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            total_nodes: self.count_keys(CF_NODES)?,
            total_edges: self.count_keys(CF_EDGES_OUT)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (RocksFlowStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        (RocksFlowStore::open(&config).unwrap(), temp_dir)
    }

    fn node(id: u64, address: Option<u64>, value: u64) -> ValueNode {
        ValueNode {
            output_id: OutputId(id),
            address_id: address.map(AddressId),
            value,
        }
    }

    fn edge(from: u64, to: u64, value: Decimal) -> FlowEdge {
        FlowEdge {
            from: OutputId(from),
            to: OutputId(to),
            value,
        }
    }

    #[tokio::test]
    async fn test_store_open() {
        let (store, _temp) = test_store();
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
        assert_eq!(store.max_node_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_apply_batch_and_read_back() {
        let (store, _temp) = test_store();
        let third = Decimal::from(100) / Decimal::from(3);
        let batch = FlowBatch {
            nodes: vec![node(1, Some(4), 30), node(2, Some(5), 70), node(3, Some(4), 100)],
            edges: vec![edge(1, 3, Decimal::from(30)), edge(2, 3, third)],
        };

        let outcome = store.apply_batch(&batch).await.unwrap();
        assert_eq!(outcome, BatchOutcome { nodes_created: 3, edges_created: 2 });

        let into = store.edges(OutputId(3), Direction::Sources).await.unwrap();
        assert_eq!(into, vec![edge(1, 3, Decimal::from(30)), edge(2, 3, third)]);
        let out = store.edges(OutputId(2), Direction::Destinations).await.unwrap();
        assert_eq!(out, vec![edge(2, 3, third)]);

        let owned = store.nodes_of_address(AddressId(4)).await.unwrap();
        assert_eq!(owned, vec![node(1, Some(4), 30), node(3, Some(4), 100)]);

        // Re-applying is a no-op
        let outcome = store.apply_batch(&batch).await.unwrap();
        assert_eq!(outcome, BatchOutcome::default());
        assert_eq!(
            store.stats().await.unwrap(),
            StoreStats { total_nodes: 3, total_edges: 2 }
        );
    }

    #[tokio::test]
    async fn test_batch_with_dangling_edge_writes_nothing() {
        let (store, _temp) = test_store();
        let batch = FlowBatch {
            nodes: vec![node(1, None, 10)],
            edges: vec![edge(1, 2, Decimal::from(10))],
        };
        assert!(matches!(
            store.apply_batch(&batch).await,
            Err(Error::GraphConsistency(_))
        ));
        assert_eq!(store.node(OutputId(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_max_node_id_uses_numeric_order() {
        let (store, _temp) = test_store();
        store.upsert_node(&node(255, None, 1)).await.unwrap();
        store.upsert_node(&node(256, None, 1)).await.unwrap();
        store.upsert_node(&node(7, None, 1)).await.unwrap();
        assert_eq!(store.max_node_id().await.unwrap(), Some(OutputId(256)));
    }

    #[tokio::test]
    async fn test_delete_edges_into() {
        let (store, _temp) = test_store();
        let batch = FlowBatch {
            nodes: vec![node(1, None, 10), node(2, None, 10), node(3, None, 20)],
            edges: vec![edge(1, 3, Decimal::from(10)), edge(2, 3, Decimal::from(10))],
        };
        store.apply_batch(&batch).await.unwrap();

        assert_eq!(store.delete_edges_into(OutputId(3)).await.unwrap(), 2);
        assert!(store.edges(OutputId(1), Direction::Destinations).await.unwrap().is_empty());
        assert!(store.edges(OutputId(3), Direction::Sources).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_all_nodes() {
        let (store, _temp) = test_store();
        let batch = FlowBatch {
            nodes: (1..=12).map(|i| node(i, Some(i % 2), 10)).collect(),
            edges: (1..12).map(|i| edge(i, i + 1, Decimal::from(10))).collect(),
        };
        store.apply_batch(&batch).await.unwrap();

        assert_eq!(store.delete_node_batch(5).await.unwrap(), 5);
        assert_eq!(store.max_node_id().await.unwrap(), Some(OutputId(7)));
        assert!(store.edges(OutputId(7), Direction::Destinations).await.unwrap().is_empty());

        assert_eq!(store.delete_all_nodes(5).await.unwrap(), 7);
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
        assert!(store.nodes_of_address(AddressId(0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_keeps_graph() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };

        {
            let store = RocksFlowStore::open(&config).unwrap();
            let batch = FlowBatch {
                nodes: vec![node(1, None, 10), node(2, None, 10)],
                edges: vec![edge(1, 2, Decimal::from(10))],
            };
            store.apply_batch(&batch).await.unwrap();
            store.close().unwrap();
        }

        let store = RocksFlowStore::open(&config).unwrap();
        assert_eq!(store.max_node_id().await.unwrap(), Some(OutputId(2)));
        assert_eq!(store.stats().await.unwrap().total_edges, 1);
    }
}
