//! Account and ledger-header persistence
//!
//! The apply engine treats an [`AccountStore`] as its account table. Durability
//! and commit semantics belong to the store: [`AccountStore::commit_ledger`]
//! writes a ledger's account deltas together with its header atomically.
//!
//! # Column Families (RocksDB)
//!
//! - `accounts` - Account records (key: identity bytes)
//! - `headers` - Ledger headers (key: seq, big-endian)

use crate::{
    config::StorageBackend,
    error::{Error, Result},
    types::{AccountRecord, Identity, LedgerHeader},
    Config,
};
use rocksdb::{BoundColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Column family names
const CF_ACCOUNTS: &str = "accounts";
const CF_HEADERS: &str = "headers";

/// Persistence collaborator for the ledger
pub trait AccountStore: Send {
    /// Load an account; `None` if it does not exist
    fn load_account(&self, id: &Identity) -> Result<Option<AccountRecord>>;

    /// Store a single account record outside a ledger commit
    fn store_account(&mut self, record: &AccountRecord) -> Result<()>;

    /// Header of ledger `seq`
    fn load_header(&self, seq: u64) -> Result<Option<LedgerHeader>>;

    /// Header with the highest sequence
    fn latest_header(&self) -> Result<Option<LedgerHeader>>;

    /// Atomically persist the account deltas of a ledger plus its header
    fn commit_ledger(&mut self, header: &LedgerHeader, accounts: &[AccountRecord]) -> Result<()>;

    /// Every stored account, ordered by identity
    fn accounts(&self) -> Result<Vec<AccountRecord>>;
}

/// Open the store selected by `config.storage`
pub fn open_store(config: &Config) -> Result<Box<dyn AccountStore>> {
    match config.storage {
        StorageBackend::Memory => Ok(Box::new(InMemoryStore::new())),
        StorageBackend::RocksDb => Ok(Box::new(RocksStore::open(config)?)),
    }
}

/// Volatile store for tests and simulations
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    accounts: BTreeMap<Identity, AccountRecord>,
    headers: BTreeMap<u64, LedgerHeader>,
}

impl InMemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountStore for InMemoryStore {
    fn load_account(&self, id: &Identity) -> Result<Option<AccountRecord>> {
        Ok(self.accounts.get(id).cloned())
    }

    fn store_account(&mut self, record: &AccountRecord) -> Result<()> {
        self.accounts.insert(record.id, record.clone());
        Ok(())
    }

    fn load_header(&self, seq: u64) -> Result<Option<LedgerHeader>> {
        Ok(self.headers.get(&seq).cloned())
    }

    fn latest_header(&self) -> Result<Option<LedgerHeader>> {
        Ok(self.headers.values().next_back().cloned())
    }

    fn commit_ledger(&mut self, header: &LedgerHeader, accounts: &[AccountRecord]) -> Result<()> {
        for record in accounts {
            self.accounts.insert(record.id, record.clone());
        }
        self.headers.insert(header.seq, header.clone());
        Ok(())
    }

    fn accounts(&self) -> Result<Vec<AccountRecord>> {
        Ok(self.accounts.values().cloned().collect())
    }
}

/// Durable RocksDB store
pub struct RocksStore {
    db: Arc<DB>,
}

impl fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksStore {
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

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_accounts()),
            ColumnFamilyDescriptor::new(CF_HEADERS, Self::cf_options_headers()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened ledger store");

        Ok(Self { db: Arc::new(db) })
    }

    fn cf_options_accounts() -> Options {
        let mut opts = Options::default();
        // Accounts are read on every apply, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_headers() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }
}

impl AccountStore for RocksStore {
    fn load_account(&self, id: &Identity) -> Result<Option<AccountRecord>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn store_account(&mut self, record: &AccountRecord) -> Result<()> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let value = bincode::serialize(record)?;
        self.db.put_cf(&cf, record.id.as_bytes(), value)?;
        Ok(())
    }

    fn load_header(&self, seq: u64) -> Result<Option<LedgerHeader>> {
        let cf = self.cf_handle(CF_HEADERS)?;
        match self.db.get_cf(&cf, seq.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn latest_header(&self) -> Result<Option<LedgerHeader>> {
        let cf = self.cf_handle(CF_HEADERS)?;

        let mut iter = self.db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(bincode::deserialize(&value)?))
            }
            None => Ok(None),
        }
    }

    fn commit_ledger(&mut self, header: &LedgerHeader, accounts: &[AccountRecord]) -> Result<()> {
        let mut batch = WriteBatch::default();

        let cf_accounts = self.cf_handle(CF_ACCOUNTS)?;
        for record in accounts {
            batch.put_cf(&cf_accounts, record.id.as_bytes(), bincode::serialize(record)?);
        }

        let cf_headers = self.cf_handle(CF_HEADERS)?;
        batch.put_cf(&cf_headers, header.seq.to_be_bytes(), bincode::serialize(header)?);

        self.db.write(batch)?;

        tracing::debug!(
            ledger = header.seq,
            accounts = accounts.len(),
            "Ledger committed"
        );

        Ok(())
    }

    fn accounts(&self) -> Result<Vec<AccountRecord>> {
        let cf = self.cf_handle(CF_ACCOUNTS)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }
}
