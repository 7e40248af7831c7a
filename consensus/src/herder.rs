//! The herder: drives one ledger close after another.
//!
//! It owns the open slots, the pending transaction pool and the caches of
//! transaction sets and quorum sets that statements refer to by hash.
//!
//! ```text
//!   trigger ──► pool.select ──► slot.nominate ──┐
//!                                               ▼
//!   peer envelope ──► fetch deps ──► slot.process_envelope ──► externalized
//!                         ▲                                        │
//!                         └── parked until deps and slot ready      ▼
//!                                                   ledger.close_ledger ──► next trigger
//! ```
//!
//! Envelopes are only fed to a slot once every transaction set and quorum
//! set they mention is known and the slot is the one being decided; until
//! then they wait in `pending`, one per sender, newer replacing older.

use crate::clock::{TimerHandle, VirtualClock};
use crate::fetcher::{FetchConfig, FetchTimeout, FetchTransport, FetchWaiter, ItemFetcher, ItemKind};
use crate::metrics::HerderMetrics;
use crate::overlay::OverlayMessage;
use crate::quorum::QuorumSet;
use crate::scp::slot::SlotInfo;
use crate::scp::{
    backoff, is_newer_statement, Ballot, CandidateValue, Envelope, LocalNode, Slot, SlotDriver,
    SlotIndex, Statement, TimerKind, ValueValidation,
};
use crate::tx_pool::TxPool;
use crate::{Error, NodeId, Result};
use ledger_core::crypto::KeyPair;
use ledger_core::types::short_hex;
use ledger_core::{Hash, Identity, LedgerManager, SignedTransaction, TransactionSet};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Entry point for transaction submitters
pub trait HerderGateway {
    /// Offer a signed transaction; true if it entered the pending pool
    fn recv_transaction(&mut self, tx: SignedTransaction) -> bool;
}

/// Events the herder schedules on its clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HerderEvent {
    /// Start nominating for the next ledger
    TriggerNextLedger,
    /// A slot timer fired
    ScpTimeout {
        /// Slot the timer belongs to
        slot: SlotIndex,
        /// Which timer
        kind: TimerKind,
    },
    /// A fetch request timed out
    Fetch(FetchTimeout),
}

impl From<FetchTimeout> for HerderEvent {
    fn from(timeout: FetchTimeout) -> Self {
        HerderEvent::Fetch(timeout)
    }
}

/// Whether the herder is still closing ledgers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HerderState {
    /// Following the network and closing ledgers
    Tracking,
    /// Stopped after a fatal apply error; needs an operator
    Halted,
}

/// Herder timing and retention
#[derive(Debug, Clone)]
pub struct HerderConfig {
    /// Delay between a ledger close and the next trigger
    pub ledger_close_interval: Duration,
    /// First nomination round timeout
    pub nomination_timeout: Duration,
    /// Nomination timeout cap
    pub nomination_timeout_max: Duration,
    /// First ballot round timeout
    pub ballot_timeout: Duration,
    /// Ballot timeout cap
    pub ballot_timeout_max: Duration,
    /// Fetch retry timing
    pub fetch: FetchConfig,
    /// Closed slots kept in memory
    pub max_slots_to_remember: u64,
    /// How far ahead of the last closed ledger envelopes are accepted
    pub ledger_validity_bracket: u64,
    /// How far in the future a nominated close time may be
    pub max_close_time_drift: Duration,
}

impl Default for HerderConfig {
    fn default() -> Self {
        Self {
            ledger_close_interval: Duration::from_secs(5),
            nomination_timeout: Duration::from_secs(1),
            nomination_timeout_max: Duration::from_secs(30 * 60),
            ballot_timeout: Duration::from_secs(1),
            ballot_timeout_max: Duration::from_secs(30 * 60),
            fetch: FetchConfig::default(),
            max_slots_to_remember: 12,
            ledger_validity_bracket: 100,
            max_close_time_drift: Duration::from_secs(60),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Outbox
// ═══════════════════════════════════════════════════════════════════════════

/// A message the herder wants sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// To every peer
    Broadcast(OverlayMessage),
    /// To one peer
    Send {
        /// Recipient
        to: NodeId,
        /// Payload
        message: OverlayMessage,
    },
}

/// Messages queued during a crank, flushed to the overlay afterwards
#[derive(Debug, Default)]
pub struct Outbox {
    peers: Vec<NodeId>,
    queue: Vec<Outbound>,
}

impl Outbox {
    fn broadcast(&mut self, message: OverlayMessage) {
        self.queue.push(Outbound::Broadcast(message));
    }

    fn send(&mut self, to: NodeId, message: OverlayMessage) {
        self.queue.push(Outbound::Send { to, message });
    }
}

impl FetchTransport for Outbox {
    fn peers(&self) -> Vec<NodeId> {
        self.peers.clone()
    }

    fn ask(&mut self, peer: NodeId, kind: ItemKind, hash: Hash) {
        let message = match kind {
            ItemKind::TxSet => OverlayMessage::GetTxSet(hash),
            ItemKind::QuorumSet => OverlayMessage::GetQuorumSet(hash),
        };
        self.send(peer, message);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Slot driver
// ═══════════════════════════════════════════════════════════════════════════

/// Herder state a slot may touch while it runs
struct HerderDriver<'a> {
    keypair: &'a KeyPair,
    config: &'a HerderConfig,
    ledger: &'a LedgerManager,
    tx_sets: &'a mut BTreeMap<Hash, TransactionSet>,
    qsets: &'a BTreeMap<Hash, QuorumSet>,
    timers: &'a mut BTreeMap<(SlotIndex, TimerKind), TimerHandle>,
    clock: &'a mut VirtualClock<HerderEvent>,
    outbox: &'a mut Outbox,
    externalized: &'a mut BTreeMap<SlotIndex, CandidateValue>,
}

impl SlotDriver for HerderDriver<'_> {
    fn validate_value(
        &mut self,
        slot: SlotIndex,
        value: &CandidateValue,
        nomination: bool,
    ) -> ValueValidation {
        let last = self.ledger.last_closed();
        if slot != last.seq + 1 {
            return ValueValidation::MaybeValid;
        }
        if value.close_time <= last.close_time {
            trace!(slot, close_time = value.close_time, "Close time does not advance");
            return ValueValidation::Invalid;
        }
        let horizon = self.clock.system_time_secs() + self.config.max_close_time_drift.as_secs();
        if nomination && value.close_time > horizon {
            trace!(slot, close_time = value.close_time, horizon, "Close time too far ahead");
            return ValueValidation::Invalid;
        }
        let Some(set) = self.tx_sets.get(&value.tx_set_hash) else {
            return ValueValidation::MaybeValid;
        };
        if set.previous_ledger_hash != self.ledger.last_closed_hash() {
            debug!(slot, tx_set = %short_hex(&value.tx_set_hash), "Transaction set for another ledger");
            return ValueValidation::Invalid;
        }
        if !set.is_well_formed() {
            debug!(slot, tx_set = %short_hex(&value.tx_set_hash), "Malformed transaction set");
            return ValueValidation::Invalid;
        }
        if set.len() > self.ledger.params().max_tx_set_size {
            debug!(slot, txs = set.len(), "Transaction set too large");
            return ValueValidation::Invalid;
        }
        ValueValidation::FullyValidated
    }

    fn combine_candidates(
        &mut self,
        slot: SlotIndex,
        candidates: &BTreeSet<CandidateValue>,
    ) -> Option<CandidateValue> {
        let previous = self.ledger.last_closed_hash();
        let mut close_time = None;
        let mut by_source: BTreeMap<Identity, (u64, Hash, SignedTransaction)> = BTreeMap::new();

        for value in candidates {
            let Some(set) = self.tx_sets.get(&value.tx_set_hash) else {
                continue;
            };
            close_time = close_time.max(Some(value.close_time));
            for tx in set.transactions() {
                let key = (tx.tx.seq_num, tx.hash());
                let better = by_source
                    .get(&tx.tx.source)
                    .map_or(true, |(seq, hash, _)| key < (*seq, *hash));
                if better {
                    by_source.insert(tx.tx.source, (key.0, key.1, tx.clone()));
                }
            }
        }

        let close_time = close_time?;
        let merged = TransactionSet::new(previous, by_source.into_values().map(|(_, _, tx)| tx).collect());
        let max = self.ledger.params().max_tx_set_size;
        let set = if merged.len() > max {
            TransactionSet::new(previous, merged.transactions()[..max].to_vec())
        } else {
            merged
        };

        let composite = CandidateValue {
            tx_set_hash: set.compute_hash(),
            close_time,
        };
        debug!(
            slot,
            candidates = candidates.len(),
            txs = set.len(),
            value = %composite,
            "Combined candidates"
        );
        self.tx_sets.insert(composite.tx_set_hash, set);
        Some(composite)
    }

    fn quorum_set(&self, hash: &Hash) -> Option<QuorumSet> {
        self.qsets.get(hash).cloned()
    }

    fn sign_statement(&self, statement: Statement) -> Envelope {
        Envelope::sign(statement, self.keypair)
    }

    fn emit_envelope(&mut self, envelope: &Envelope) {
        trace!(
            slot = envelope.statement.slot_index,
            kind = envelope.statement.pledges.name(),
            "Emitting envelope"
        );
        self.outbox.broadcast(OverlayMessage::Envelope(envelope.clone()));
    }

    fn value_externalized(&mut self, slot: SlotIndex, value: &CandidateValue) {
        self.externalized.insert(slot, *value);
    }

    fn setup_timer(&mut self, slot: SlotIndex, kind: TimerKind, timeout: Duration) {
        if let Some(old) = self.timers.remove(&(slot, kind)) {
            self.clock.cancel(old);
        }
        let handle = self
            .clock
            .schedule_after(timeout, HerderEvent::ScpTimeout { slot, kind });
        self.timers.insert((slot, kind), handle);
    }

    fn stop_timer(&mut self, slot: SlotIndex, kind: TimerKind) {
        if let Some(handle) = self.timers.remove(&(slot, kind)) {
            self.clock.cancel(handle);
        }
    }

    fn compute_timeout(&self, round: u32, kind: TimerKind) -> Duration {
        let (base, max) = match kind {
            TimerKind::Nomination => (self.config.nomination_timeout, self.config.nomination_timeout_max),
            TimerKind::Ballot => (self.config.ballot_timeout, self.config.ballot_timeout_max),
        };
        backoff(base, max, round)
    }

    fn nominating_value(&mut self, slot: SlotIndex, value: &CandidateValue) {
        trace!(slot, value = %value, "Nominating");
    }

    fn started_ballot_protocol(&mut self, slot: SlotIndex, ballot: &Ballot) {
        debug!(slot, ballot = %ballot, "Started ballot protocol");
    }

    fn accepted_commit(&mut self, slot: SlotIndex, ballot: &Ballot) {
        debug!(slot, ballot = %ballot, "Accepted commit");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Herder
// ═══════════════════════════════════════════════════════════════════════════

/// Diagnostic snapshot of a herder
#[derive(Debug, Clone, Serialize)]
pub struct HerderInfo {
    /// Local node id (hex)
    pub node: String,
    /// Tracking or halted
    pub state: HerderState,
    /// Why the herder halted
    pub halt_reason: Option<String>,
    /// Last closed ledger sequence
    pub last_closed: u64,
    /// Last closed ledger hash (hex)
    pub last_closed_hash: String,
    /// Pending transactions
    pub pending_transactions: usize,
    /// Envelopes waiting on fetches or on their slot
    pub pending_envelopes: usize,
    /// Outstanding fetches
    pub fetching: usize,
    /// Slots in memory
    pub slots: Vec<SlotInfo>,
}

impl HerderInfo {
    /// Pretty JSON rendering
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Owner of the slots, the pool and the ledger
#[derive(Debug)]
pub struct Herder {
    keypair: KeyPair,
    local: LocalNode,
    config: HerderConfig,
    state: HerderState,
    halt_reason: Option<String>,
    ledger: LedgerManager,
    pool: TxPool,
    slots: BTreeMap<SlotIndex, Slot>,
    pending: BTreeMap<SlotIndex, BTreeMap<NodeId, Envelope>>,
    tx_sets: BTreeMap<Hash, TransactionSet>,
    qsets: BTreeMap<Hash, QuorumSet>,
    recent_ledgers: VecDeque<Hash>,
    fetcher: ItemFetcher,
    timers: BTreeMap<(SlotIndex, TimerKind), TimerHandle>,
    trigger: Option<TimerHandle>,
    externalized: BTreeMap<SlotIndex, CandidateValue>,
    outbox: Outbox,
    metrics: Option<HerderMetrics>,
}

impl Herder {
    /// New herder on top of `ledger`
    pub fn new(
        keypair: KeyPair,
        quorum_set: QuorumSet,
        ledger: LedgerManager,
        config: HerderConfig,
    ) -> Result<Self> {
        quorum_set.check_sanity().map_err(Error::InvalidQuorumSet)?;

        let local = LocalNode::new(keypair.identity(), quorum_set.clone());
        let qsets = BTreeMap::from([(local.quorum_set_hash, quorum_set)]);
        let recent_ledgers = VecDeque::from([ledger.last_closed_hash()]);
        let fetcher = ItemFetcher::new(config.fetch.clone());

        info!(
            node = %local.id,
            ledger = ledger.last_closed().seq,
            threshold = local.quorum_set.threshold,
            validators = local.quorum_set.all_validators().len(),
            "Herder created"
        );

        Ok(Self {
            keypair,
            local,
            config,
            state: HerderState::Tracking,
            halt_reason: None,
            ledger,
            pool: TxPool::new(),
            slots: BTreeMap::new(),
            pending: BTreeMap::new(),
            tx_sets: BTreeMap::new(),
            qsets,
            recent_ledgers,
            fetcher,
            timers: BTreeMap::new(),
            trigger: None,
            externalized: BTreeMap::new(),
            outbox: Outbox::default(),
            metrics: None,
        })
    }

    /// Attach a metrics collector
    pub fn with_metrics(self, metrics: HerderMetrics) -> Self {
        Self {
            metrics: Some(metrics),
            ..self
        }
    }

    /// Local node id
    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    /// Local quorum set
    pub fn quorum_set(&self) -> &QuorumSet {
        &self.local.quorum_set
    }

    /// Tracking or halted
    pub fn state(&self) -> HerderState {
        self.state
    }

    /// True once a fatal error stopped ledger closes
    pub fn is_halted(&self) -> bool {
        self.state == HerderState::Halted
    }

    /// Why the herder halted
    pub fn halt_reason(&self) -> Option<&str> {
        self.halt_reason.as_deref()
    }

    /// The ledger being extended
    pub fn ledger(&self) -> &LedgerManager {
        &self.ledger
    }

    /// Pending transactions
    pub fn pool(&self) -> &TxPool {
        &self.pool
    }

    /// Slot being decided
    pub fn next_slot(&self) -> SlotIndex {
        self.ledger.next_seq()
    }

    /// Slot `index`, if in memory
    pub fn slot(&self, index: SlotIndex) -> Option<&Slot> {
        self.slots.get(&index)
    }

    /// Cached transaction set
    pub fn tx_set(&self, hash: &Hash) -> Option<&TransactionSet> {
        self.tx_sets.get(hash)
    }

    /// Metrics collector, if attached
    pub fn metrics(&self) -> Option<&HerderMetrics> {
        self.metrics.as_ref()
    }

    /// Fetches in flight
    pub fn fetching(&self) -> usize {
        self.fetcher.len()
    }

    /// Diagnostic snapshot
    pub fn info(&self) -> HerderInfo {
        HerderInfo {
            node: self.local.id.to_hex(),
            state: self.state,
            halt_reason: self.halt_reason.clone(),
            last_closed: self.ledger.last_closed().seq,
            last_closed_hash: hex::encode(self.ledger.last_closed_hash()),
            pending_transactions: self.pool.len(),
            pending_envelopes: self.pending.values().map(BTreeMap::len).sum(),
            fetching: self.fetcher.len(),
            slots: self.slots.values().map(Slot::info).collect(),
        }
    }

    /// Peers fetch requests may be sent to
    pub fn set_peers(&mut self, peers: Vec<NodeId>) {
        self.outbox.peers = peers;
    }

    /// Take every message queued since the last drain
    pub fn drain_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox.queue)
    }

    /// Schedule the first ledger trigger
    pub fn start(&mut self, clock: &mut VirtualClock<HerderEvent>) {
        info!(node = %self.local.id, slot = self.next_slot(), "Herder starting");
        self.schedule_trigger(clock, Duration::ZERO);
    }

    /// Run a scheduled event
    pub fn handle_event(&mut self, clock: &mut VirtualClock<HerderEvent>, event: HerderEvent) {
        match event {
            HerderEvent::TriggerNextLedger => {
                self.trigger = None;
                self.trigger_next_ledger(clock);
            }
            HerderEvent::ScpTimeout { slot, kind } => {
                self.timers.remove(&(slot, kind));
                if self.is_halted() || !self.slots.contains_key(&slot) {
                    return;
                }
                trace!(slot, ?kind, "Slot timer fired");
                self.with_slot(clock, slot, |s, d| s.timer_expired(d, kind));
                self.settle(clock);
            }
            HerderEvent::Fetch(timeout) => {
                self.fetcher.timeout(clock, &mut self.outbox, timeout);
            }
        }
    }

    /// Nominate a value built from the pool for the next ledger
    pub fn trigger_next_ledger(&mut self, clock: &mut VirtualClock<HerderEvent>) {
        if self.is_halted() {
            return;
        }
        let slot = self.ledger.next_seq();
        let previous = self.ledger.last_closed_hash();
        let set = TransactionSet::new(previous, self.pool.select(self.ledger.params().max_tx_set_size));
        let close_time = clock
            .system_time_secs()
            .max(self.ledger.last_closed().close_time + 1);
        let value = CandidateValue {
            tx_set_hash: set.compute_hash(),
            close_time,
        };

        info!(slot, txs = set.len(), close_time, "Triggering next ledger");
        self.tx_sets.insert(value.tx_set_hash, set);
        self.with_slot(clock, slot, |s, d| s.nominate(d, value, &previous));
        self.settle(clock);
    }

    /// Validate a transaction and add it to the pool
    pub fn recv_transaction(&mut self, tx: SignedTransaction) -> bool {
        if let Some(m) = &self.metrics {
            m.txs_received.inc();
        }
        if self.is_halted() {
            return false;
        }

        let hash = tx.hash();
        let accepted = match self.pool.try_add(tx, &self.ledger) {
            Ok(Ok(())) => {
                debug!(tx = %short_hex(&hash), pending = self.pool.len(), "Transaction accepted");
                true
            }
            Ok(Err(rejection)) => {
                debug!(tx = %short_hex(&hash), %rejection, "Transaction rejected");
                false
            }
            Err(e) => {
                warn!(tx = %short_hex(&hash), error = %e, "Transaction check failed");
                false
            }
        };

        if let Some(m) = &self.metrics {
            if !accepted {
                m.txs_rejected.inc();
            }
            m.pending_txs.set(self.pool.len() as i64);
        }
        accepted
    }

    /// Accept a transaction and flood it to peers
    pub fn submit_transaction(&mut self, tx: SignedTransaction) -> bool {
        let accepted = self.recv_transaction(tx.clone());
        if accepted {
            self.outbox.broadcast(OverlayMessage::Transaction(tx));
        }
        accepted
    }

    /// Dispatch a decoded peer message
    pub fn recv_message(
        &mut self,
        clock: &mut VirtualClock<HerderEvent>,
        from: NodeId,
        message: OverlayMessage,
    ) {
        match message {
            OverlayMessage::Envelope(envelope) => self.recv_envelope(clock, from, envelope),
            OverlayMessage::Transaction(tx) => {
                self.submit_transaction(tx);
            }
            OverlayMessage::GetTxSet(hash) => self.recv_get_tx_set(from, hash),
            OverlayMessage::TxSet(set) => self.recv_tx_set(clock, from, set),
            OverlayMessage::GetQuorumSet(hash) => self.recv_get_quorum_set(from, hash),
            OverlayMessage::QuorumSet(qset) => self.recv_quorum_set(clock, from, qset),
            OverlayMessage::DontHave { kind, hash } => self.recv_dont_have(clock, from, kind, hash),
        }
    }

    /// An envelope arrived from `from`
    pub fn recv_envelope(&mut self, clock: &mut VirtualClock<HerderEvent>, from: NodeId, envelope: Envelope) {
        if let Some(m) = &self.metrics {
            m.envelopes_received.inc();
        }
        if self.is_halted() {
            return;
        }

        let statement = &envelope.statement;
        if !envelope.verify() {
            warn!(peer = %from, node = %statement.node_id, "Dropping envelope with bad signature");
            return;
        }

        let slot = statement.slot_index;
        let last = self.ledger.last_closed().seq;
        let lowest = last.saturating_sub(self.config.max_slots_to_remember);
        let highest = last + self.config.ledger_validity_bracket;
        if slot < lowest || slot > highest {
            debug!(slot, lowest, highest, peer = %from, "Envelope outside slot window");
            return;
        }
        if slot <= last {
            trace!(slot, node = %statement.node_id, "Envelope for closed slot");
            return;
        }

        let node = statement.node_id;
        if let Some(old) = self.pending.get(&slot).and_then(|p| p.get(&node)) {
            if !is_newer_statement(&old.statement, &envelope.statement) {
                trace!(slot, node = %node, "Stale envelope");
                return;
            }
            let superseded = old.hash();
            self.fetcher.stop_fetching_for(clock, &superseded);
        }

        self.fetch_missing(clock, &envelope, from);
        self.pending.entry(slot).or_default().insert(node, envelope);
        self.settle(clock);
    }

    /// A transaction set arrived
    pub fn recv_tx_set(&mut self, clock: &mut VirtualClock<HerderEvent>, from: NodeId, set: TransactionSet) {
        let hash = set.compute_hash();
        if !self.fetcher.is_fetching(ItemKind::TxSet, &hash) {
            trace!(peer = %from, hash = %short_hex(&hash), "Unsolicited transaction set");
            return;
        }
        // out of order, duplicated or badly signed; ask someone else
        if !set.is_well_formed() {
            warn!(peer = %from, hash = %short_hex(&hash), "Malformed transaction set");
            self.fetcher
                .doesnt_have(clock, &mut self.outbox, ItemKind::TxSet, &hash, &from);
            return;
        }
        let waiters = self.fetcher.recv(clock, ItemKind::TxSet, &hash);
        debug!(
            peer = %from,
            hash = %short_hex(&hash),
            txs = set.len(),
            waiters = waiters.len(),
            "Received transaction set"
        );
        self.tx_sets.insert(hash, set);
        self.settle(clock);
    }

    /// A quorum set arrived
    pub fn recv_quorum_set(&mut self, clock: &mut VirtualClock<HerderEvent>, from: NodeId, qset: QuorumSet) {
        let hash = qset.compute_hash();
        if !self.fetcher.is_fetching(ItemKind::QuorumSet, &hash) {
            trace!(peer = %from, hash = %short_hex(&hash), "Unsolicited quorum set");
            return;
        }
        if let Err(reason) = qset.check_sanity() {
            warn!(peer = %from, hash = %short_hex(&hash), %reason, "Insane quorum set");
            self.fetcher
                .doesnt_have(clock, &mut self.outbox, ItemKind::QuorumSet, &hash, &from);
            return;
        }
        let waiters = self.fetcher.recv(clock, ItemKind::QuorumSet, &hash);
        debug!(peer = %from, hash = %short_hex(&hash), waiters = waiters.len(), "Received quorum set");
        self.qsets.insert(hash, qset);
        self.settle(clock);
    }

    /// A peer asked for a transaction set
    pub fn recv_get_tx_set(&mut self, from: NodeId, hash: Hash) {
        let reply = match self.tx_sets.get(&hash) {
            Some(set) => OverlayMessage::TxSet(set.clone()),
            None => OverlayMessage::DontHave {
                kind: ItemKind::TxSet,
                hash,
            },
        };
        self.outbox.send(from, reply);
    }

    /// A peer asked for a quorum set
    pub fn recv_get_quorum_set(&mut self, from: NodeId, hash: Hash) {
        let reply = match self.qsets.get(&hash) {
            Some(qset) => OverlayMessage::QuorumSet(qset.clone()),
            None => OverlayMessage::DontHave {
                kind: ItemKind::QuorumSet,
                hash,
            },
        };
        self.outbox.send(from, reply);
    }

    /// A peer does not have something we asked it for
    pub fn recv_dont_have(
        &mut self,
        clock: &mut VirtualClock<HerderEvent>,
        from: NodeId,
        kind: ItemKind,
        hash: Hash,
    ) {
        self.fetcher
            .doesnt_have(clock, &mut self.outbox, kind, &hash, &from);
    }

    // ───────────────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────────────

    fn split<'a>(
        &'a mut self,
        clock: &'a mut VirtualClock<HerderEvent>,
    ) -> (&'a mut BTreeMap<SlotIndex, Slot>, &'a LocalNode, HerderDriver<'a>) {
        let Herder {
            keypair,
            local,
            config,
            ledger,
            slots,
            tx_sets,
            qsets,
            timers,
            externalized,
            outbox,
            ..
        } = self;
        let driver = HerderDriver {
            keypair: &*keypair,
            config: &*config,
            ledger: &*ledger,
            tx_sets,
            qsets: &*qsets,
            timers,
            clock,
            outbox,
            externalized,
        };
        (slots, &*local, driver)
    }

    fn with_slot<R>(
        &mut self,
        clock: &mut VirtualClock<HerderEvent>,
        index: SlotIndex,
        f: impl FnOnce(&mut Slot, &mut HerderDriver<'_>) -> R,
    ) -> R {
        let (slots, local, mut driver) = self.split(clock);
        let slot = slots
            .entry(index)
            .or_insert_with(|| Slot::new(index, local.clone()));
        f(slot, &mut driver)
    }

    fn has_dependencies(&self, statement: &Statement) -> bool {
        self.qsets.contains_key(&statement.quorum_set_hash)
            && statement
                .values()
                .iter()
                .all(|v| self.tx_sets.contains_key(&v.tx_set_hash))
    }

    /// Start fetches for everything `envelope` needs that is not cached
    fn fetch_missing(&mut self, clock: &mut VirtualClock<HerderEvent>, envelope: &Envelope, hint: NodeId) {
        let statement = &envelope.statement;
        let waiter = FetchWaiter {
            slot: statement.slot_index,
            node: statement.node_id,
            envelope_hash: envelope.hash(),
        };

        let mut wanted = Vec::new();
        if !self.qsets.contains_key(&statement.quorum_set_hash) {
            wanted.push((ItemKind::QuorumSet, statement.quorum_set_hash));
        }
        for value in statement.values() {
            if !self.tx_sets.contains_key(&value.tx_set_hash) {
                wanted.push((ItemKind::TxSet, value.tx_set_hash));
            }
        }

        for (kind, hash) in wanted {
            let started = self
                .fetcher
                .fetch(clock, &mut self.outbox, kind, hash, waiter, Some(hint));
            if started {
                if let Some(m) = &self.metrics {
                    m.fetch_requests.inc();
                }
            }
        }
    }

    /// Close decided ledgers and feed parked envelopes until nothing moves
    fn settle(&mut self, clock: &mut VirtualClock<HerderEvent>) {
        loop {
            if self.is_halted() {
                return;
            }
            if self.close_externalized(clock) {
                continue;
            }
            match self.take_ready_envelope() {
                Some(envelope) => {
                    let slot = envelope.statement.slot_index;
                    let state = self.with_slot(clock, slot, |s, d| s.process_envelope(d, &envelope));
                    trace!(
                        slot,
                        node = %envelope.statement.node_id,
                        kind = envelope.statement.pledges.name(),
                        ?state,
                        "Envelope processed"
                    );
                }
                None => return,
            }
        }
    }

    fn take_ready_envelope(&mut self) -> Option<Envelope> {
        let next = self.ledger.next_seq();
        let node = self
            .pending
            .get(&next)?
            .iter()
            .find(|(_, e)| self.has_dependencies(&e.statement))
            .map(|(node, _)| *node)?;
        let by_node = self.pending.get_mut(&next)?;
        let envelope = by_node.remove(&node);
        if by_node.is_empty() {
            self.pending.remove(&next);
        }
        envelope
    }

    /// Apply the decided value of the next slot, if there is one
    fn close_externalized(&mut self, clock: &mut VirtualClock<HerderEvent>) -> bool {
        let next = self.ledger.next_seq();
        self.externalized = self.externalized.split_off(&next);
        let Some(value) = self.externalized.remove(&next) else {
            return false;
        };

        let Some(set) = self.tx_sets.get(&value.tx_set_hash).cloned() else {
            self.halt(
                clock,
                format!(
                    "externalized transaction set {} for ledger {} is unknown",
                    short_hex(&value.tx_set_hash),
                    next
                ),
            );
            return false;
        };

        match self.ledger.close_ledger(&set, value.close_time) {
            Ok(result) => {
                info!(
                    node = %self.local.id,
                    slot = next,
                    hash = %short_hex(&result.header_hash),
                    txs = set.len(),
                    applied = result.applied_count(),
                    "Externalized value applied"
                );
                self.after_close(clock, next, result.header_hash);
                true
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(slot = next, error = %e, "Protocol divergence while closing ledger");
                }
                self.halt(clock, e.to_string());
                false
            }
        }
    }

    fn after_close(&mut self, clock: &mut VirtualClock<HerderEvent>, closed: SlotIndex, header_hash: Hash) {
        self.recent_ledgers.push_back(header_hash);
        while self.recent_ledgers.len() as u64 > self.config.max_slots_to_remember + 1 {
            self.recent_ledgers.pop_front();
        }

        match self.pool.revalidate(&self.ledger) {
            Ok(0) => {}
            Ok(dropped) => debug!(dropped, pending = self.pool.len(), "Dropped stale transactions"),
            Err(e) => warn!(error = %e, "Pool revalidation failed"),
        }

        let stale_timers: Vec<_> = self
            .timers
            .keys()
            .filter(|(slot, _)| *slot <= closed)
            .copied()
            .collect();
        for key in stale_timers {
            if let Some(handle) = self.timers.remove(&key) {
                clock.cancel(handle);
            }
        }

        let next = closed + 1;
        let keep_from = closed.saturating_sub(self.config.max_slots_to_remember);
        self.slots = self.slots.split_off(&keep_from);
        self.pending = self.pending.split_off(&next);
        self.fetcher.stop_fetching_below(clock, next);
        let recent = &self.recent_ledgers;
        self.tx_sets
            .retain(|_, set| recent.contains(&set.previous_ledger_hash));

        // purged sets may still be wanted by parked envelopes
        let parked: Vec<(NodeId, Envelope)> = self
            .pending
            .get(&next)
            .map(|p| p.iter().map(|(n, e)| (*n, e.clone())).collect())
            .unwrap_or_default();
        for (node, envelope) in parked {
            if !self.has_dependencies(&envelope.statement) {
                self.fetch_missing(clock, &envelope, node);
            }
        }

        self.schedule_trigger(clock, self.config.ledger_close_interval);

        if let Some(m) = &self.metrics {
            m.pending_txs.set(self.pool.len() as i64);
        }
    }

    fn schedule_trigger(&mut self, clock: &mut VirtualClock<HerderEvent>, delay: Duration) {
        if let Some(old) = self.trigger.take() {
            clock.cancel(old);
        }
        self.trigger = Some(clock.schedule_after(delay, HerderEvent::TriggerNextLedger));
    }

    fn halt(&mut self, clock: &mut VirtualClock<HerderEvent>, reason: String) {
        error!(node = %self.local.id, ledger = self.ledger.next_seq(), %reason, "Herder halted");
        self.state = HerderState::Halted;
        self.halt_reason = Some(reason);
        if let Some(trigger) = self.trigger.take() {
            clock.cancel(trigger);
        }
        for (_, handle) in std::mem::take(&mut self.timers) {
            clock.cancel(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scp::{Nomination, Pledges};
    use ledger_core::storage::InMemoryStore;
    use ledger_core::{LedgerParams, Transaction};

    const FEE: i64 = 10;

    fn params() -> LedgerParams {
        LedgerParams {
            base_fee: FEE,
            base_reserve: 100,
            max_tx_set_size: 10,
            total_coins: 1_000_000,
        }
    }

    fn herder_with(node: &KeyPair, qset: QuorumSet) -> (Herder, KeyPair, VirtualClock<HerderEvent>) {
        let root = KeyPair::from_name("root");
        let ledger =
            LedgerManager::genesis(Box::new(InMemoryStore::new()), params(), root.identity(), 0).unwrap();
        let herder = Herder::new(node.clone(), qset, ledger, HerderConfig::default()).unwrap();
        (herder, root, VirtualClock::new_virtual(1_000))
    }

    fn solo() -> (Herder, KeyPair, VirtualClock<HerderEvent>) {
        let node = KeyPair::from_name("validator");
        herder_with(&node, QuorumSet::singleton(node.identity()))
    }

    fn run_until_closed(herder: &mut Herder, clock: &mut VirtualClock<HerderEvent>, seq: u64) {
        for _ in 0..100 {
            clock.crank(|c, e| herder.handle_event(c, e));
            if herder.ledger().last_closed().seq >= seq {
                return;
            }
            clock.advance_to_next().unwrap();
        }
        panic!("ledger {} never closed", seq);
    }

    fn pay(from: &KeyPair, seq: u64, fee: i64, to: &str, amount: i64) -> SignedTransaction {
        let dest = KeyPair::from_name(to).identity();
        Transaction::payment(from.identity(), seq, fee, dest, amount).sign(from)
    }

    #[test]
    fn test_solo_node_closes_ledgers() {
        let (mut herder, _, mut clock) = solo();
        herder.start(&mut clock);

        run_until_closed(&mut herder, &mut clock, 2);
        assert_eq!(herder.ledger().last_closed().close_time, 1_000);
        assert!(herder.timers.is_empty());
        // next trigger is armed
        assert!(herder.trigger.is_some());

        run_until_closed(&mut herder, &mut clock, 3);
        assert_eq!(herder.ledger().last_closed().close_time, 1_005);
        assert_eq!(herder.state(), HerderState::Tracking);
    }

    #[test]
    fn test_accepted_transaction_is_applied() {
        let (mut herder, root, mut clock) = solo();
        assert!(herder.submit_transaction(pay(&root, 1, FEE, "alice", 5_000)));
        assert!(!herder.recv_transaction(pay(&root, 1, FEE, "alice", 5_000)));
        assert!(matches!(
            herder.drain_outbox().as_slice(),
            [Outbound::Broadcast(OverlayMessage::Transaction(_))]
        ));

        herder.start(&mut clock);
        run_until_closed(&mut herder, &mut clock, 2);

        let alice = KeyPair::from_name("alice").identity();
        let account = herder.ledger().load_account(&alice).unwrap().unwrap();
        assert_eq!(account.balance, 5_000);
        assert!(herder.pool().is_empty());
    }

    #[test]
    fn test_composite_keeps_lowest_sequence_per_source() {
        let (mut herder, root, mut clock) = solo();
        let bob = KeyPair::from_name("bob");
        let a = pay(&root, 1, FEE, "alice", 1_000);
        let b = pay(&root, 1, FEE * 2, "carol", 1_000);
        let c = pay(&root, 2, FEE, "dave", 1_000);
        let d = pay(&bob, 1, FEE, "alice", 1_000);

        let prev = herder.ledger().last_closed_hash();
        let s1 = TransactionSet::new(prev, vec![a.clone(), c]);
        let s2 = TransactionSet::new(prev, vec![b.clone(), d.clone()]);
        let v1 = CandidateValue {
            tx_set_hash: s1.compute_hash(),
            close_time: 1_010,
        };
        let v2 = CandidateValue {
            tx_set_hash: s2.compute_hash(),
            close_time: 1_020,
        };
        herder.tx_sets.insert(v1.tx_set_hash, s1);
        herder.tx_sets.insert(v2.tx_set_hash, s2);

        let composite = {
            let (_, _, mut driver) = herder.split(&mut clock);
            driver.combine_candidates(2, &BTreeSet::from([v1, v2])).unwrap()
        };
        assert_eq!(composite.close_time, 1_020);

        let set = herder.tx_set(&composite.tx_set_hash).unwrap();
        let from_root = if a.hash() < b.hash() { a } else { b };
        assert_eq!(set.len(), 2);
        assert!(set.transactions().contains(&from_root));
        assert!(set.transactions().contains(&d));
        assert!(set.is_canonical());
    }

    #[test]
    fn test_validate_value_rules() {
        let (mut herder, _, mut clock) = solo();
        let prev = herder.ledger().last_closed_hash();
        let good = TransactionSet::empty(prev);
        let foreign = TransactionSet::empty([7u8; 32]);
        let good_hash = good.compute_hash();
        let foreign_hash = foreign.compute_hash();
        herder.tx_sets.insert(good_hash, good);
        herder.tx_sets.insert(foreign_hash, foreign);

        let (_, _, mut driver) = herder.split(&mut clock);
        let value = |hash, close_time| CandidateValue {
            tx_set_hash: hash,
            close_time,
        };
        assert_eq!(
            driver.validate_value(2, &value(good_hash, 1_000), true),
            ValueValidation::FullyValidated
        );
        // wrong slot or unknown set cannot be judged yet
        assert_eq!(
            driver.validate_value(3, &value(good_hash, 1_000), true),
            ValueValidation::MaybeValid
        );
        assert_eq!(
            driver.validate_value(2, &value([1u8; 32], 1_000), true),
            ValueValidation::MaybeValid
        );
        assert_eq!(
            driver.validate_value(2, &value(foreign_hash, 1_000), true),
            ValueValidation::Invalid
        );
        // close time must advance, and not run too far ahead when nominating
        assert_eq!(
            driver.validate_value(2, &value(good_hash, 0), false),
            ValueValidation::Invalid
        );
        assert_eq!(
            driver.validate_value(2, &value(good_hash, 5_000), true),
            ValueValidation::Invalid
        );
        assert_eq!(
            driver.validate_value(2, &value(good_hash, 5_000), false),
            ValueValidation::FullyValidated
        );
    }

    #[test]
    fn test_future_envelope_waits_for_fetch() {
        let keys: Vec<KeyPair> = (0..3).map(|i| KeyPair::from_name(&format!("v{}", i))).collect();
        let qset = QuorumSet::new(2, keys.iter().map(|k| k.identity()));
        let (mut herder, _, mut clock) = herder_with(&keys[0], qset.clone());
        herder.set_peers(keys[1..].iter().map(|k| k.identity()).collect());

        let unknown = CandidateValue {
            tx_set_hash: [5u8; 32],
            close_time: 1_001,
        };
        let statement = Statement {
            node_id: keys[1].identity(),
            slot_index: 3,
            quorum_set_hash: qset.compute_hash(),
            pledges: Pledges::Nominate(Nomination {
                votes: vec![unknown],
                accepted: vec![],
            }),
        };
        let envelope = Envelope::sign(statement.clone(), &keys[1]);
        herder.recv_envelope(&mut clock, keys[2].identity(), envelope);

        assert_eq!(herder.info().pending_envelopes, 1);
        assert_eq!(herder.fetching(), 1);
        // the relaying peer is asked first
        assert_eq!(
            herder.drain_outbox(),
            vec![Outbound::Send {
                to: keys[2].identity(),
                message: OverlayMessage::GetTxSet([5u8; 32]),
            }]
        );

        // forged signature is dropped
        let forged = Envelope::sign(statement, &keys[2]);
        herder.recv_envelope(&mut clock, keys[2].identity(), forged);
        assert!(herder.drain_outbox().is_empty());
    }

    /// Decode a set off the wire exactly as the peer ordered it
    fn wire_set(prev: Hash, txs: Vec<SignedTransaction>) -> TransactionSet {
        let encoded = bincode::serialize(&(prev, txs)).unwrap();
        let raw: TransactionSet = bincode::deserialize(&encoded).unwrap();
        let bytes = OverlayMessage::TxSet(raw).to_bytes().unwrap();
        match OverlayMessage::from_bytes(&bytes).unwrap() {
            OverlayMessage::TxSet(set) => set,
            other => panic!("unexpected message {}", other.name()),
        }
    }

    fn forge(tx: &SignedTransaction) -> SignedTransaction {
        let mut forged = tx.clone();
        forged.signature = KeyPair::from_name("mallory").sign(&tx.hash());
        forged
    }

    /// Three validators seen from `keys[0]`
    fn trio() -> (Herder, Vec<KeyPair>, KeyPair, VirtualClock<HerderEvent>) {
        let keys: Vec<KeyPair> = (0..3).map(|i| KeyPair::from_name(&format!("v{}", i))).collect();
        let qset = QuorumSet::new(2, keys.iter().map(|k| k.identity()));
        let (mut herder, root, clock) = herder_with(&keys[0], qset);
        herder.set_peers(keys[1..].iter().map(|k| k.identity()).collect());
        (herder, keys, root, clock)
    }

    /// `keys[1]` nominates a value built on `set_hash`; the set is fetched from it
    fn nominate_from_peer(
        herder: &mut Herder,
        keys: &[KeyPair],
        clock: &mut VirtualClock<HerderEvent>,
        set_hash: Hash,
    ) {
        let statement = Statement {
            node_id: keys[1].identity(),
            slot_index: 2,
            quorum_set_hash: herder.quorum_set().compute_hash(),
            pledges: Pledges::Nominate(Nomination {
                votes: vec![CandidateValue {
                    tx_set_hash: set_hash,
                    close_time: 1_001,
                }],
                accepted: vec![],
            }),
        };
        herder.recv_envelope(clock, keys[1].identity(), Envelope::sign(statement, &keys[1]));
        assert_eq!(
            herder.drain_outbox(),
            vec![Outbound::Send {
                to: keys[1].identity(),
                message: OverlayMessage::GetTxSet(set_hash),
            }]
        );
    }

    /// The bad set was dropped and the next peer is being asked
    fn assert_refused(herder: &mut Herder, keys: &[KeyPair], set_hash: Hash) {
        assert!(herder.tx_set(&set_hash).is_none());
        assert_eq!(herder.fetching(), 1);
        assert_eq!(herder.info().pending_envelopes, 1);
        assert!(!herder.is_halted());
        assert_eq!(herder.ledger().last_closed().seq, 1);
        assert_eq!(
            herder.drain_outbox(),
            vec![Outbound::Send {
                to: keys[2].identity(),
                message: OverlayMessage::GetTxSet(set_hash),
            }]
        );
    }

    #[test]
    fn test_reordered_transaction_set_is_refused() {
        let (mut herder, keys, root, mut clock) = trio();
        let prev = herder.ledger().last_closed_hash();
        let mut txs = vec![pay(&root, 1, FEE, "alice", 1_000), pay(&root, 2, FEE, "bob", 1_000)];
        txs.sort_by_key(|t| std::cmp::Reverse(t.hash()));
        let reversed = wire_set(prev, txs);
        assert!(!reversed.is_canonical());
        let hash = reversed.compute_hash();

        nominate_from_peer(&mut herder, &keys, &mut clock, hash);
        herder.recv_message(&mut clock, keys[1].identity(), OverlayMessage::TxSet(reversed));
        assert_refused(&mut herder, &keys, hash);
    }

    #[test]
    fn test_duplicated_transaction_set_is_refused() {
        let (mut herder, keys, root, mut clock) = trio();
        let prev = herder.ledger().last_closed_hash();
        let tx = pay(&root, 1, FEE, "alice", 1_000);
        let doubled = wire_set(prev, vec![tx.clone(), tx]);
        assert_eq!(doubled.len(), 2);
        let hash = doubled.compute_hash();

        nominate_from_peer(&mut herder, &keys, &mut clock, hash);
        herder.recv_message(&mut clock, keys[1].identity(), OverlayMessage::TxSet(doubled));
        assert_refused(&mut herder, &keys, hash);
    }

    #[test]
    fn test_badly_signed_transaction_set_is_refused() {
        let (mut herder, keys, root, mut clock) = trio();
        let prev = herder.ledger().last_closed_hash();
        let forged = TransactionSet::new(prev, vec![forge(&pay(&root, 1, FEE, "alice", 1_000))]);
        let hash = forged.compute_hash();

        nominate_from_peer(&mut herder, &keys, &mut clock, hash);
        herder.recv_message(&mut clock, keys[1].identity(), OverlayMessage::TxSet(forged));
        assert_refused(&mut herder, &keys, hash);
    }

    #[test]
    fn test_resigned_copy_of_honest_set_does_not_match() {
        let (mut herder, keys, root, mut clock) = trio();
        let prev = herder.ledger().last_closed_hash();
        let tx = pay(&root, 1, FEE, "alice", 1_000);
        let honest = TransactionSet::new(prev, vec![tx.clone()]);
        let forged = TransactionSet::new(prev, vec![forge(&tx)]);
        let hash = honest.compute_hash();
        assert_ne!(hash, forged.compute_hash());

        // same bodies under other signatures answer a different request
        nominate_from_peer(&mut herder, &keys, &mut clock, hash);
        herder.recv_message(&mut clock, keys[1].identity(), OverlayMessage::TxSet(forged));
        assert!(herder.tx_set(&hash).is_none());
        assert_eq!(herder.fetching(), 1);
        assert!(herder.drain_outbox().is_empty());

        herder.recv_message(&mut clock, keys[1].identity(), OverlayMessage::TxSet(honest));
        assert!(herder.tx_set(&hash).is_some());
        assert_eq!(herder.fetching(), 0);
        assert!(!herder.is_halted());
    }

    #[test]
    fn test_malformed_sets_are_invalid_values() {
        let (mut herder, root, mut clock) = solo();
        let prev = herder.ledger().last_closed_hash();
        let tx = pay(&root, 1, FEE, "alice", 1_000);
        let mut ordered = vec![tx.clone(), pay(&root, 2, FEE, "bob", 1_000)];
        ordered.sort_by_key(|t| std::cmp::Reverse(t.hash()));

        let sets = [
            wire_set(prev, ordered),
            wire_set(prev, vec![tx.clone(), tx.clone()]),
            TransactionSet::new(prev, vec![forge(&tx)]),
        ];
        let hashes: Vec<Hash> = sets.iter().map(TransactionSet::compute_hash).collect();
        for (hash, set) in hashes.iter().zip(sets) {
            herder.tx_sets.insert(*hash, set);
        }

        let (_, _, mut driver) = herder.split(&mut clock);
        for hash in hashes {
            let value = CandidateValue {
                tx_set_hash: hash,
                close_time: 1_000,
            };
            assert_eq!(driver.validate_value(2, &value, true), ValueValidation::Invalid);
            assert_eq!(driver.validate_value(2, &value, false), ValueValidation::Invalid);
        }
    }

    #[test]
    fn test_envelope_outside_window_is_ignored() {
        let keys: Vec<KeyPair> = (0..2).map(|i| KeyPair::from_name(&format!("v{}", i))).collect();
        let qset = QuorumSet::new(2, keys.iter().map(|k| k.identity()));
        let (mut herder, _, mut clock) = herder_with(&keys[0], qset.clone());

        let statement = Statement {
            node_id: keys[1].identity(),
            slot_index: 1 + HerderConfig::default().ledger_validity_bracket + 1,
            quorum_set_hash: [9u8; 32],
            pledges: Pledges::Nominate(Nomination {
                votes: vec![],
                accepted: vec![],
            }),
        };
        herder.recv_envelope(&mut clock, keys[1].identity(), Envelope::sign(statement, &keys[1]));
        assert_eq!(herder.info().pending_envelopes, 0);
        assert_eq!(herder.fetching(), 0);
    }

    #[test]
    fn test_serves_known_items_and_dont_have() {
        let (mut herder, _, _) = solo();
        let peer = KeyPair::from_name("peer").identity();
        let local_qset = herder.quorum_set().clone();

        herder.recv_get_quorum_set(peer, local_qset.compute_hash());
        herder.recv_get_tx_set(peer, [4u8; 32]);
        assert_eq!(
            herder.drain_outbox(),
            vec![
                Outbound::Send {
                    to: peer,
                    message: OverlayMessage::QuorumSet(local_qset),
                },
                Outbound::Send {
                    to: peer,
                    message: OverlayMessage::DontHave {
                        kind: ItemKind::TxSet,
                        hash: [4u8; 32],
                    },
                },
            ]
        );
    }

    #[test]
    fn test_halted_herder_refuses_work() {
        let (mut herder, root, mut clock) = solo();
        herder.start(&mut clock);
        herder.halt(&mut clock, "test halt".to_string());

        assert!(herder.is_halted());
        assert_eq!(herder.halt_reason(), Some("test halt"));
        assert!(!herder.recv_transaction(pay(&root, 1, FEE, "alice", 1_000)));
        assert_eq!(clock.pending(), 0);

        herder.trigger_next_ledger(&mut clock);
        assert_eq!(herder.ledger().last_closed().seq, 1);

        let info = herder.info().to_json().unwrap();
        assert!(info.contains("\"halted\""));
    }

    #[test]
    fn test_insane_quorum_set_is_refused() {
        let node = KeyPair::from_name("validator");
        let root = KeyPair::from_name("root");
        let ledger =
            LedgerManager::genesis(Box::new(InMemoryStore::new()), params(), root.identity(), 0).unwrap();
        let qset = QuorumSet::new(2, [node.identity()]);
        assert!(matches!(
            Herder::new(node, qset, ledger, HerderConfig::default()),
            Err(Error::InvalidQuorumSet(_))
        ));
    }
}
