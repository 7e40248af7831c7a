//! Fetching of transaction sets and quorum sets referenced by hash.
//!
//! One tracker exists per `(kind, hash)`; every envelope waiting on the
//! item is recorded as a waiter on that tracker, so concurrent requests
//! share a single outstanding network request. A tracker asks one peer at a
//! time (the sender of the envelope first), moves on to the next peer on
//! `DontHave` or timeout, and doubles its timeout after every full pass over
//! the peer list.
//!
//! A tracker never gives up by itself. It is dropped when the item arrives
//! or when every waiter was superseded (`stop_fetching_for`) or is for an
//! old slot (`stop_fetching_below`).

use crate::clock::{TimerHandle, VirtualClock};
use crate::scp::SlotIndex;
use crate::NodeId;
use ledger_core::types::short_hex;
use ledger_core::Hash;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

// ═══════════════════════════════════════════════════════════════════════════
// Fetch Configuration
// ═══════════════════════════════════════════════════════════════════════════

/// Retry timing for fetch requests
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Time to wait for a peer before asking the next one
    pub initial_timeout: Duration,
    /// Upper bound after backoff
    pub max_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_millis(1_500),
            max_timeout: Duration::from_secs(30),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Fetch Types
// ═══════════════════════════════════════════════════════════════════════════

/// What is being fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    /// A candidate transaction set
    TxSet,
    /// A validator's quorum set
    QuorumSet,
}

impl ItemKind {
    /// Name for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::TxSet => "txset",
            ItemKind::QuorumSet => "qset",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An envelope waiting on a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchWaiter {
    /// Slot of the envelope
    pub slot: SlotIndex,
    /// Sender of the envelope
    pub node: NodeId,
    /// Hash of the envelope's statement
    pub envelope_hash: Hash,
}

/// Timer event: the peer currently asked for `(kind, hash)` did not answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTimeout {
    /// Item kind
    pub kind: ItemKind,
    /// Item hash
    pub hash: Hash,
}

/// Outbound side of the fetcher
pub trait FetchTransport {
    /// Peers that can be asked, in preference order
    fn peers(&self) -> Vec<NodeId>;

    /// Send a request for `hash` to `peer`
    fn ask(&mut self, peer: NodeId, kind: ItemKind, hash: Hash);
}

#[derive(Debug)]
struct Tracker {
    waiters: BTreeSet<FetchWaiter>,
    asked: BTreeSet<NodeId>,
    hint: Option<NodeId>,
    current: Option<NodeId>,
    attempts: u32,
    timeout: Duration,
    timer: Option<TimerHandle>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Item Fetcher
// ═══════════════════════════════════════════════════════════════════════════

/// Deduplicating fetcher with peer rotation
#[derive(Debug, Default)]
pub struct ItemFetcher {
    config: FetchConfig,
    trackers: BTreeMap<(ItemKind, Hash), Tracker>,
}

impl ItemFetcher {
    /// New fetcher
    pub fn new(config: FetchConfig) -> Self {
        Self {
            config,
            trackers: BTreeMap::new(),
        }
    }

    /// Number of items being fetched
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    /// True if nothing is being fetched
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// True if `(kind, hash)` has an outstanding request
    pub fn is_fetching(&self, kind: ItemKind, hash: &Hash) -> bool {
        self.trackers.contains_key(&(kind, *hash))
    }

    /// Number of requests sent for `(kind, hash)` so far
    pub fn attempts(&self, kind: ItemKind, hash: &Hash) -> u32 {
        self.trackers.get(&(kind, *hash)).map_or(0, |t| t.attempts)
    }

    /// Register `waiter` for `(kind, hash)`, starting a request if none is
    /// outstanding. `hint` is tried first. Returns true if a new request was
    /// started.
    pub fn fetch<E, T>(
        &mut self,
        clock: &mut VirtualClock<E>,
        transport: &mut T,
        kind: ItemKind,
        hash: Hash,
        waiter: FetchWaiter,
        hint: Option<NodeId>,
    ) -> bool
    where
        E: From<FetchTimeout>,
        T: FetchTransport + ?Sized,
    {
        if let Some(tracker) = self.trackers.get_mut(&(kind, hash)) {
            tracker.waiters.insert(waiter);
            trace!(%kind, hash = %short_hex(&hash), "Coalesced fetch");
            return false;
        }

        debug!(%kind, hash = %short_hex(&hash), slot = waiter.slot, "Starting fetch");
        let tracker = Tracker {
            waiters: BTreeSet::from([waiter]),
            asked: BTreeSet::new(),
            hint,
            current: None,
            attempts: 0,
            timeout: self.config.initial_timeout,
            timer: None,
        };
        self.trackers.insert((kind, hash), tracker);
        self.ask_next_peer(clock, transport, kind, hash);
        true
    }

    /// Item arrived: drop its tracker and return the waiters to resume
    pub fn recv<E>(&mut self, clock: &mut VirtualClock<E>, kind: ItemKind, hash: &Hash) -> Vec<FetchWaiter> {
        match self.trackers.remove(&(kind, *hash)) {
            Some(tracker) => {
                if let Some(timer) = tracker.timer {
                    clock.cancel(timer);
                }
                debug!(
                    %kind,
                    hash = %short_hex(hash),
                    attempts = tracker.attempts,
                    waiters = tracker.waiters.len(),
                    "Fetch resolved"
                );
                tracker.waiters.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    /// `from` reported it does not have the item: ask the next peer
    pub fn doesnt_have<E, T>(
        &mut self,
        clock: &mut VirtualClock<E>,
        transport: &mut T,
        kind: ItemKind,
        hash: &Hash,
        from: &NodeId,
    ) where
        E: From<FetchTimeout>,
        T: FetchTransport + ?Sized,
    {
        let Some(tracker) = self.trackers.get_mut(&(kind, *hash)) else {
            return;
        };
        if tracker.current.as_ref() != Some(from) {
            return;
        }
        if let Some(timer) = tracker.timer.take() {
            clock.cancel(timer);
        }
        trace!(%kind, hash = %short_hex(hash), peer = %from, "Peer does not have item");
        self.ask_next_peer(clock, transport, kind, *hash);
    }

    /// The current peer timed out: ask the next one
    pub fn timeout<E, T>(&mut self, clock: &mut VirtualClock<E>, transport: &mut T, event: FetchTimeout)
    where
        E: From<FetchTimeout>,
        T: FetchTransport + ?Sized,
    {
        let Some(tracker) = self.trackers.get_mut(&(event.kind, event.hash)) else {
            return;
        };
        tracker.timer = None;
        self.ask_next_peer(clock, transport, event.kind, event.hash);
    }

    /// Remove every waiter for the envelope `envelope_hash`; returns the
    /// items no longer wanted by anyone
    pub fn stop_fetching_for<E>(&mut self, clock: &mut VirtualClock<E>, envelope_hash: &Hash) -> Vec<(ItemKind, Hash)> {
        self.retain_waiters(clock, |w| w.envelope_hash != *envelope_hash)
    }

    /// Remove every waiter for slots below `slot`
    pub fn stop_fetching_below<E>(&mut self, clock: &mut VirtualClock<E>, slot: SlotIndex) -> Vec<(ItemKind, Hash)> {
        self.retain_waiters(clock, |w| w.slot >= slot)
    }

    fn retain_waiters<E, F>(&mut self, clock: &mut VirtualClock<E>, keep: F) -> Vec<(ItemKind, Hash)>
    where
        F: Fn(&FetchWaiter) -> bool,
    {
        let mut abandoned = Vec::new();
        self.trackers.retain(|key, tracker| {
            tracker.waiters.retain(|w| keep(w));
            if tracker.waiters.is_empty() {
                if let Some(timer) = tracker.timer.take() {
                    clock.cancel(timer);
                }
                abandoned.push(*key);
                false
            } else {
                true
            }
        });
        for (kind, hash) in &abandoned {
            debug!(%kind, hash = %short_hex(hash), "Fetch abandoned");
        }
        abandoned
    }

    fn ask_next_peer<E, T>(&mut self, clock: &mut VirtualClock<E>, transport: &mut T, kind: ItemKind, hash: Hash)
    where
        E: From<FetchTimeout>,
        T: FetchTransport + ?Sized,
    {
        let max_timeout = self.config.max_timeout;
        let Some(tracker) = self.trackers.get_mut(&(kind, hash)) else {
            return;
        };

        let peers = transport.peers();
        let first_untried = |asked: &BTreeSet<NodeId>, hint: Option<NodeId>| {
            hint.filter(|h| !asked.contains(h))
                .or_else(|| peers.iter().find(|p| !asked.contains(*p)).copied())
        };
        let mut next = first_untried(&tracker.asked, tracker.hint);
        if next.is_none() && !peers.is_empty() {
            // full pass done: start over, waiting longer
            tracker.asked.clear();
            tracker.timeout = (tracker.timeout * 2).min(max_timeout);
            next = first_untried(&tracker.asked, tracker.hint);
        }

        tracker.current = next;
        if let Some(peer) = next {
            tracker.asked.insert(peer);
            tracker.attempts += 1;
            trace!(%kind, hash = %short_hex(&hash), %peer, attempt = tracker.attempts, "Asking peer");
            transport.ask(peer, kind, hash);
        }
        tracker.timer = Some(clock.schedule_after(tracker.timeout, FetchTimeout { kind, hash }.into()));
    }
}
