//! Error types for the ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Ledger header not found
    #[error("Ledger header not found: {0}")]
    HeaderNotFound(u64),

    /// The store holds no ledger at all
    #[error("Ledger store is empty")]
    NotInitialized,

    /// The store already holds a ledger chain
    #[error("Ledger store already initialized at ledger {0}")]
    AlreadyInitialized(u64),

    /// An externalized transaction set does not extend the last closed
    /// ledger. Apply is halted; continuing would fork account state.
    #[error(
        "Protocol divergence at ledger {seq}: expected previous hash {expected}, got {actual}"
    )]
    ProtocolDivergence {
        /// Sequence of the ledger being closed
        seq: u64,
        /// Hash of the local last closed ledger (hex)
        expected: String,
        /// Previous-ledger hash carried by the transaction set (hex)
        actual: String,
    },

    /// Invariant violation (money conservation, reserve, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors after which the ledger must not keep applying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProtocolDivergence { .. } | Error::InvariantViolation(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
