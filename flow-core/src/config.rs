//! Configuration for the flow graph

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Flow graph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Synchronizer configuration
    pub sync: SyncConfig,

    /// Attribution configuration
    pub attribution: AttributionConfig,

    /// Trace configuration
    pub trace: TraceConfig,

    /// Override reconciliation configuration
    pub reconcile: ReconcileConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/flow"),
            service_name: "flow-core".to_string(),
            rocksdb: RocksDBConfig::default(),
            sync: SyncConfig::default(),
            attribution: AttributionConfig::default(),
            trace: TraceConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 128,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Synchronizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Transactions buffered per store flush
    pub batch_size: usize,

    /// Blocks requested per ledger page
    pub page_size: u64,

    /// Attempts per flush before aborting
    pub max_retry_attempts: u32,

    /// Fixed delay between attempts (milliseconds)
    pub retry_delay_ms: u64,

    /// Nodes removed per deletion call during a rebuild
    pub delete_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            page_size: 100,
            max_retry_attempts: 5,
            retry_delay_ms: 500,
            delete_batch_size: 10_000,
        }
    }
}

/// Attribution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// Cells strictly below this value produce no edge
    pub negligible_value: Decimal,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            negligible_value: Decimal::new(1, 6),
        }
    }
}

/// Trace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Depth limit applied when a request does not set one
    pub default_max_depth: Option<usize>,

    /// Contributions at or below this mass are not followed further
    pub negligible_mass: Decimal,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            default_max_depth: Some(64),
            negligible_mass: Decimal::ZERO,
        }
    }
}

/// Override reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Transactions reconciled concurrently
    pub max_concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { max_concurrency: 4 }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("FLOW_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(value) = std::env::var("FLOW_SYNC_BATCH_SIZE") {
            config.sync.batch_size = parse_env("FLOW_SYNC_BATCH_SIZE", &value)?;
        }

        if let Ok(value) = std::env::var("FLOW_SYNC_MAX_RETRIES") {
            config.sync.max_retry_attempts = parse_env("FLOW_SYNC_MAX_RETRIES", &value)?;
        }

        if let Ok(value) = std::env::var("FLOW_SYNC_RETRY_DELAY_MS") {
            config.sync.retry_delay_ms = parse_env("FLOW_SYNC_RETRY_DELAY_MS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.sync.batch_size == 0 {
            return Err(crate::Error::Config("sync.batch_size must be positive".into()));
        }
        if self.sync.max_retry_attempts == 0 {
            return Err(crate::Error::Config("sync.max_retry_attempts must be positive".into()));
        }
        if self.sync.delete_batch_size == 0 {
            return Err(crate::Error::Config("sync.delete_batch_size must be positive".into()));
        }
        if self.reconcile.max_concurrency == 0 {
            return Err(crate::Error::Config("reconcile.max_concurrency must be positive".into()));
        }
        if self.attribution.negligible_value.is_sign_negative() {
            return Err(crate::Error::Config("attribution.negligible_value must not be negative".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("{} has invalid value {:?}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "flow-core");
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.attribution.negligible_value, Decimal::new(1, 6));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let mut config = Config::default();
        config.sync.batch_size = 25;
        config.trace.default_max_depth = None;
        let text = toml::to_string(&config).unwrap();

        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.sync.batch_size, 25);
        assert_eq!(parsed.trace.default_max_depth, None);
        assert_eq!(parsed.attribution.negligible_value, config.attribution.negligible_value);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = Config::default();
        config.sync.batch_size = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }
}
