//! Federated Byzantine Agreement for the ledger
//!
//! Agrees with a set of peers on one transaction set per ledger and hands
//! the agreed set to the ledger apply engine.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Overlay (peers)                    │
//! │      envelopes | transactions | txset / qset         │
//! └────────────────────┬────────────────────────────────┘
//!                      │ Node::crank
//!                      ↓
//! ┌─────────────────────────────────────────────────────┐
//! │                     Herder                           │
//! │  TxPool → nominate → Slot (nomination + ballot)      │
//! │  ItemFetcher for unknown txsets / quorum sets        │
//! └────────────────────┬────────────────────────────────┘
//!                      │ externalized value
//!                      ↓
//! ┌─────────────────────────────────────────────────────┐
//! │                   Ledger Core                        │
//! │  apply transaction set → new ledger header           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Safety: nodes with intersecting quorums never externalize different
//!   values for the same slot
//! - Liveness: stuck ballots are abandoned for higher counters with
//!   bounded exponential backoff
//! - Determinism: all work runs on one [`clock::VirtualClock`]; with a
//!   virtual time source every run is reproducible

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod clock;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod herder;
pub mod metrics;
pub mod node;
pub mod overlay;
pub mod quorum;
pub mod scp;
pub mod tx_pool;

/// Validators are identified by their public key
pub type NodeId = ledger_core::Identity;

// Re-exports
pub use clock::{ClockMode, VirtualClock};
pub use config::Config;
pub use error::{Error, Result};
pub use fetcher::{FetchConfig, ItemFetcher, ItemKind};
pub use herder::{Herder, HerderConfig, HerderEvent, HerderGateway, HerderInfo, HerderState};
pub use node::Node;
pub use overlay::{LoopbackNetwork, LoopbackOverlay, Overlay, OverlayMessage};
pub use quorum::QuorumSet;
pub use scp::{Ballot, CandidateValue, Envelope, Slot, SlotIndex, SlotPhase, Statement};
pub use tx_pool::TxPool;
