//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Account store backend
    pub storage: StorageBackend,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Network-wide ledger parameters
    pub params: LedgerParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            storage: StorageBackend::RocksDb,
            rocksdb: RocksDBConfig::default(),
            params: LedgerParams::default(),
        }
    }
}

/// Account store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile, for tests and simulations
    Memory,
    /// Durable RocksDB store under `data_dir`
    RocksDb,
}

/// Ledger parameters every node in a network must agree on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerParams {
    /// Minimum fee per operation
    pub base_fee: i64,

    /// Reserve per entry; an account needs `(2 + sub_entries) * base_reserve`
    pub base_reserve: i64,

    /// Maximum transactions in one transaction set
    pub max_tx_set_size: usize,

    /// Coins held by the root account at genesis
    pub total_coins: i64,
}

impl Default for LedgerParams {
    fn default() -> Self {
        Self {
            base_fee: 10,
            base_reserve: 10_000_000,
            max_tx_set_size: 100,
            total_coins: 1_000_000_000_000_000_000,
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
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
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(backend) = std::env::var("LEDGER_STORAGE") {
            config.storage = match backend.as_str() {
                "memory" => StorageBackend::Memory,
                "rocksdb" => StorageBackend::RocksDb,
                other => {
                    return Err(crate::Error::Config(format!(
                        "Unknown storage backend: {}",
                        other
                    )))
                }
            };
        }

        if let Ok(fee) = std::env::var("LEDGER_BASE_FEE") {
            config.params.base_fee = parse_env("LEDGER_BASE_FEE", &fee)?;
        }

        if let Ok(reserve) = std::env::var("LEDGER_BASE_RESERVE") {
            config.params.base_reserve = parse_env("LEDGER_BASE_RESERVE", &reserve)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject parameter combinations the apply engine cannot honor
    pub fn validate(&self) -> crate::Result<()> {
        let p = &self.params;
        if p.base_fee <= 0 || p.base_reserve <= 0 {
            return Err(crate::Error::Config(
                "base_fee and base_reserve must be positive".to_string(),
            ));
        }
        if p.max_tx_set_size == 0 {
            return Err(crate::Error::Config(
                "max_tx_set_size must be at least 1".to_string(),
            ));
        }
        if p.total_coins < crate::types::min_balance(p.base_reserve, 0) {
            return Err(crate::Error::Config(
                "total_coins does not cover the root account reserve".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("Invalid value for {}: {}", name, value)))
}
