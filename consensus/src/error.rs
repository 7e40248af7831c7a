//! Error types for consensus

use thiserror::Error;

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Consensus errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Herder refuses work after a fatal apply error
    #[error("Herder halted: {0}")]
    Halted(String),

    /// Malformed or insane quorum set
    #[error("Invalid quorum set: {0}")]
    InvalidQuorumSet(String),

    /// Consensus error
    #[error("Consensus error: {0}")]
    Consensus(String),

    /// Clock misuse (e.g. advancing a wall clock)
    #[error("Clock error: {0}")]
    Clock(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors after which the node must stop closing ledgers.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Ledger(e) => e.is_fatal(),
            Error::Halted(_) => true,
            _ => false,
        }
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
