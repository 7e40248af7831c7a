//! Ledger Core
//!
//! Account state and the ledger header chain, plus the engine that applies
//! an agreed transaction set to them.
//!
//! # Architecture
//!
//! - **Single Writer**: one apply pass owns the account table at a time
//! - **Arena**: accounts are keyed by identity; nothing holds references
//! - **Atomic Commit**: account deltas and the new header land together
//! - **Hash Chain**: every header commits to its predecessor
//!
//! # Invariants
//!
//! - Conservation: Σ(balances) + fee_pool == total_coins for all time
//! - Deterministic apply: same (previous ledger, transaction set) → same header hash
//! - Sequence numbers advance by exactly one per applied transaction
//! - Every account holds at least its minimum reserve

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod storage;
pub mod types;

// Re-exports
pub use config::{Config, LedgerParams};
pub use error::{Error, Result};
pub use ledger::{apply_transaction_set, LedgerCloseResult, LedgerManager};
pub use types::{
    AccountRecord, Hash, Identity, LedgerHeader, Operation, SignedTransaction, Signature,
    Transaction, TransactionResult, TransactionSet, TxOutcome, TxRejection,
};
