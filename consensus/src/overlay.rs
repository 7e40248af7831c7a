//! Peer transport contract and an in-process implementation.
//!
//! The core only sees opaque byte blobs tagged with the sending peer. The
//! [`OverlayMessage`] enum is the bincode payload inside those blobs.
//! [`LoopbackNetwork`] connects any number of nodes in one process through a
//! shared hub; simulations use it to run several validators on one clock and
//! to cut links between chosen pairs.

use crate::fetcher::ItemKind;
use crate::quorum::QuorumSet;
use crate::scp::Envelope;
use crate::{NodeId, Result};
use ledger_core::{Hash, SignedTransaction, TransactionSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Messages exchanged between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlayMessage {
    /// A signed SCP statement
    Envelope(Envelope),
    /// A client transaction being flooded
    Transaction(SignedTransaction),
    /// Request for a transaction set by hash
    GetTxSet(Hash),
    /// A transaction set
    TxSet(TransactionSet),
    /// Request for a quorum set by hash
    GetQuorumSet(Hash),
    /// A quorum set
    QuorumSet(QuorumSet),
    /// Answer to a request the peer cannot serve
    DontHave {
        /// Requested item kind
        kind: ItemKind,
        /// Requested hash
        hash: Hash,
    },
}

impl OverlayMessage {
    /// Encode for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Name for logs
    pub fn name(&self) -> &'static str {
        match self {
            OverlayMessage::Envelope(_) => "envelope",
            OverlayMessage::Transaction(_) => "transaction",
            OverlayMessage::GetTxSet(_) => "get_txset",
            OverlayMessage::TxSet(_) => "txset",
            OverlayMessage::GetQuorumSet(_) => "get_qset",
            OverlayMessage::QuorumSet(_) => "qset",
            OverlayMessage::DontHave { .. } => "dont_have",
        }
    }
}

/// Byte transport to the other validators
pub trait Overlay: Send {
    /// This node
    fn local_id(&self) -> NodeId;

    /// Currently connected peers
    fn peers(&self) -> Vec<NodeId>;

    /// Send to one peer; unknown peers are ignored
    fn send_to(&mut self, peer: &NodeId, bytes: Vec<u8>);

    /// Send to every connected peer
    fn broadcast(&mut self, bytes: Vec<u8>) {
        for peer in self.peers() {
            self.send_to(&peer, bytes.clone());
        }
    }

    /// Next inbound message, if any
    fn poll(&mut self) -> Option<(NodeId, Vec<u8>)>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Loopback
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Hub {
    queues: BTreeMap<NodeId, VecDeque<(NodeId, Vec<u8>)>>,
    blocked: BTreeSet<(NodeId, NodeId)>,
    delivered: u64,
    dropped: u64,
}

/// In-process network shared by every [`LoopbackOverlay`] created from it
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hub = self.hub.lock();
        f.debug_struct("LoopbackNetwork")
            .field("nodes", &hub.queues.len())
            .field("in_flight", &hub.queues.values().map(VecDeque::len).sum::<usize>())
            .field("blocked", &hub.blocked.len())
            .finish()
    }
}

impl LoopbackNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `id`; it becomes a peer of every other attached node
    pub fn connect(&self, id: NodeId) -> LoopbackOverlay {
        self.hub.lock().queues.entry(id).or_default();
        LoopbackOverlay {
            id,
            hub: Arc::clone(&self.hub),
        }
    }

    /// Drop all traffic between `a` and `b`, in both directions
    pub fn block(&self, a: NodeId, b: NodeId) {
        let mut hub = self.hub.lock();
        hub.blocked.insert((a, b));
        hub.blocked.insert((b, a));
    }

    /// Restore traffic between `a` and `b`
    pub fn unblock(&self, a: NodeId, b: NodeId) {
        let mut hub = self.hub.lock();
        hub.blocked.remove(&(a, b));
        hub.blocked.remove(&(b, a));
    }

    /// Messages queued but not yet polled
    pub fn in_flight(&self) -> usize {
        self.hub.lock().queues.values().map(VecDeque::len).sum()
    }

    /// Messages handed to a queue so far
    pub fn delivered(&self) -> u64 {
        self.hub.lock().delivered
    }

    /// Messages discarded on blocked links so far
    pub fn dropped(&self) -> u64 {
        self.hub.lock().dropped
    }
}

/// One node's endpoint on a [`LoopbackNetwork`]
pub struct LoopbackOverlay {
    id: NodeId,
    hub: Arc<Mutex<Hub>>,
}

impl fmt::Debug for LoopbackOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackOverlay").field("id", &self.id).finish()
    }
}

impl Overlay for LoopbackOverlay {
    fn local_id(&self) -> NodeId {
        self.id
    }

    fn peers(&self) -> Vec<NodeId> {
        self.hub
            .lock()
            .queues
            .keys()
            .filter(|id| **id != self.id)
            .copied()
            .collect()
    }

    fn send_to(&mut self, peer: &NodeId, bytes: Vec<u8>) {
        if *peer == self.id {
            return;
        }
        let mut hub = self.hub.lock();
        if hub.blocked.contains(&(self.id, *peer)) {
            hub.dropped += 1;
            return;
        }
        let from = self.id;
        if let Some(queue) = hub.queues.get_mut(peer) {
            queue.push_back((from, bytes));
            hub.delivered += 1;
        }
    }

    fn poll(&mut self) -> Option<(NodeId, Vec<u8>)> {
        self.hub.lock().queues.get_mut(&self.id)?.pop_front()
    }
}
