//! Federated Byzantine Agreement: one [`slot::Slot`] per ledger sequence.
//!
//! # Protocol Overview
//!
//! ```text
//!   nominate ──► candidates ──► composite value
//!                                   │
//!                                   ▼
//!   PREPARE (b, p, p', h, c) ──► CONFIRM ──► EXTERNALIZE
//! ```
//!
//! Statements are tagged variants; every protocol step is an exhaustive
//! match over them. The slot never touches the network, the clock, or the
//! ledger directly: all of that goes through [`SlotDriver`].

pub mod ballot;
pub mod nomination;
pub mod slot;

use crate::quorum::QuorumSet;
use crate::NodeId;
use ledger_core::crypto::KeyPair;
use ledger_core::{Hash, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

pub use slot::{Slot, SlotPhase};

/// Ledger sequence number a slot decides
pub type SlotIndex = u64;

/// Value agreed on by a slot: a transaction-set hash plus a close time.
///
/// Ordered by the hash of its canonical encoding, so every node sorts the
/// same values the same way; lower hash wins ties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateValue {
    /// Hash of the proposed transaction set
    pub tx_set_hash: Hash,
    /// Proposed close time (unix seconds)
    pub close_time: u64,
}

impl CandidateValue {
    /// Canonical hash
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.hash_into(&mut hasher);
        hasher.finalize().into()
    }

    fn hash_into(&self, hasher: &mut Sha256) {
        hasher.update(self.tx_set_hash);
        hasher.update(self.close_time.to_be_bytes());
    }
}

impl Ord for CandidateValue {
    fn cmp(&self, other: &Self) -> Ordering {
        if self == other {
            return Ordering::Equal;
        }
        self.compute_hash()
            .cmp(&other.compute_hash())
            .then_with(|| self.tx_set_hash.cmp(&other.tx_set_hash))
            .then_with(|| self.close_time.cmp(&other.close_time))
    }
}

impl PartialOrd for CandidateValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CandidateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[txset {} @{}]",
            ledger_core::types::short_hex(&self.tx_set_hash),
            self.close_time
        )
    }
}

/// `(counter, value)`; ordered by counter, then value
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ballot {
    /// Round counter, at least 1 once balloting starts
    pub counter: u32,
    /// Value being balloted
    pub value: CandidateValue,
}

impl Ballot {
    /// New ballot
    pub fn new(counter: u32, value: CandidateValue) -> Self {
        Self { counter, value }
    }

    /// Same value
    pub fn is_compatible(&self, other: &Ballot) -> bool {
        self.value == other.value
    }

    /// `self <= other` and same value
    pub fn less_and_compatible(&self, other: &Ballot) -> bool {
        self <= other && self.is_compatible(other)
    }

    /// `self <= other` and different value
    pub fn less_and_incompatible(&self, other: &Ballot) -> bool {
        self <= other && !self.is_compatible(other)
    }

    fn hash_into(&self, hasher: &mut Sha256) {
        hasher.update(self.counter.to_be_bytes());
        self.value.hash_into(hasher);
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.counter, self.value)
    }
}

/// Nomination payload; both lists sorted ascending without duplicates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nomination {
    /// Values voted for
    pub votes: Vec<CandidateValue>,
    /// Values accepted
    pub accepted: Vec<CandidateValue>,
}

/// Prepare payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    /// Current ballot `b`
    pub ballot: Ballot,
    /// Highest accepted-prepared ballot `p`
    pub prepared: Option<Ballot>,
    /// Highest accepted-prepared ballot incompatible with `p`
    pub prepared_prime: Option<Ballot>,
    /// Counter of `c`, 0 if unset
    pub n_c: u32,
    /// Counter of `h`, 0 if unset
    pub n_h: u32,
}

/// Confirm payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirm {
    /// Current ballot `b`
    pub ballot: Ballot,
    /// Counter of `p`
    pub n_prepared: u32,
    /// Counter of `c`
    pub n_commit: u32,
    /// Counter of `h`
    pub n_h: u32,
}

/// Externalize payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Externalize {
    /// Lowest committed ballot
    pub commit: Ballot,
    /// Highest committed counter
    pub n_h: u32,
}

/// What a statement pledges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pledges {
    /// Nomination votes
    Nominate(Nomination),
    /// Ballot preparation
    Prepare(Prepare),
    /// Commit accepted
    Confirm(Confirm),
    /// Value decided
    Externalize(Externalize),
}

impl Pledges {
    /// Phase rank: statements of a later phase supersede earlier ones
    pub fn rank(&self) -> u8 {
        match self {
            Pledges::Nominate(_) => 0,
            Pledges::Prepare(_) => 1,
            Pledges::Confirm(_) => 2,
            Pledges::Externalize(_) => 3,
        }
    }

    /// Short phase name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Pledges::Nominate(_) => "NOMINATE",
            Pledges::Prepare(_) => "PREPARE",
            Pledges::Confirm(_) => "CONFIRM",
            Pledges::Externalize(_) => "EXTERNALIZE",
        }
    }
}

/// One validator's assertion about a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// Issuing validator
    pub node_id: NodeId,
    /// Slot the statement is about
    pub slot_index: SlotIndex,
    /// Hash of the issuer's quorum set
    pub quorum_set_hash: Hash,
    /// Payload
    pub pledges: Pledges,
}

impl Statement {
    /// Canonical hash; the message covered by the envelope signature
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.node_id.as_bytes());
        hasher.update(self.slot_index.to_be_bytes());
        hasher.update(self.quorum_set_hash);
        hasher.update([self.pledges.rank()]);
        let opt = |hasher: &mut Sha256, b: &Option<Ballot>| match b {
            Some(b) => {
                hasher.update([1u8]);
                b.hash_into(hasher);
            }
            None => hasher.update([0u8]),
        };
        match &self.pledges {
            Pledges::Nominate(n) => {
                hasher.update((n.votes.len() as u32).to_be_bytes());
                n.votes.iter().for_each(|v| v.hash_into(&mut hasher));
                hasher.update((n.accepted.len() as u32).to_be_bytes());
                n.accepted.iter().for_each(|v| v.hash_into(&mut hasher));
            }
            Pledges::Prepare(p) => {
                p.ballot.hash_into(&mut hasher);
                opt(&mut hasher, &p.prepared);
                opt(&mut hasher, &p.prepared_prime);
                hasher.update(p.n_c.to_be_bytes());
                hasher.update(p.n_h.to_be_bytes());
            }
            Pledges::Confirm(c) => {
                c.ballot.hash_into(&mut hasher);
                hasher.update(c.n_prepared.to_be_bytes());
                hasher.update(c.n_commit.to_be_bytes());
                hasher.update(c.n_h.to_be_bytes());
            }
            Pledges::Externalize(e) => {
                e.commit.hash_into(&mut hasher);
                hasher.update(e.n_h.to_be_bytes());
            }
        }
        hasher.finalize().into()
    }

    /// Every value the statement refers to; the placeholder ballot of a
    /// counter-0 PREPARE is skipped
    pub fn values(&self) -> BTreeSet<CandidateValue> {
        let mut out = BTreeSet::new();
        match &self.pledges {
            Pledges::Nominate(n) => {
                out.extend(n.votes.iter().copied());
                out.extend(n.accepted.iter().copied());
            }
            Pledges::Prepare(p) => {
                if p.ballot.counter != 0 {
                    out.insert(p.ballot.value);
                }
                out.extend(p.prepared.map(|b| b.value));
                out.extend(p.prepared_prime.map(|b| b.value));
            }
            Pledges::Confirm(c) => {
                out.insert(c.ballot.value);
            }
            Pledges::Externalize(e) => {
                out.insert(e.commit.value);
            }
        }
        out
    }

    /// Ballot counter used for bumping: externalize counts as infinite
    pub fn ballot_counter(&self) -> u32 {
        match &self.pledges {
            Pledges::Nominate(_) => 0,
            Pledges::Prepare(p) => p.ballot.counter,
            Pledges::Confirm(c) => c.ballot.counter,
            Pledges::Externalize(_) => u32::MAX,
        }
    }
}

/// True if `new` supersedes `old` from the same node and slot
pub fn is_newer_statement(old: &Statement, new: &Statement) -> bool {
    let (old_rank, new_rank) = (old.pledges.rank(), new.pledges.rank());
    if old_rank != new_rank {
        return old_rank < new_rank;
    }
    match (&old.pledges, &new.pledges) {
        (Pledges::Nominate(o), Pledges::Nominate(n)) => nomination::is_newer_nomination(o, n),
        (Pledges::Prepare(o), Pledges::Prepare(n)) => {
            (o.ballot, o.prepared, o.prepared_prime, o.n_h)
                < (n.ballot, n.prepared, n.prepared_prime, n.n_h)
        }
        (Pledges::Confirm(o), Pledges::Confirm(n)) => {
            (o.ballot, o.n_prepared, o.n_h) < (n.ballot, n.n_prepared, n.n_h)
        }
        (Pledges::Externalize(_), Pledges::Externalize(_)) => false,
        _ => false,
    }
}

/// Signed statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The statement
    pub statement: Statement,
    /// Issuer's signature over the statement hash
    pub signature: Signature,
}

impl Envelope {
    /// Sign `statement` with the issuer's key
    pub fn sign(statement: Statement, keypair: &KeyPair) -> Self {
        let signature = keypair.sign(&statement.compute_hash());
        Self {
            statement,
            signature,
        }
    }

    /// Check the signature against the issuing node
    pub fn verify(&self) -> bool {
        self.signature
            .verify(&self.statement.compute_hash(), &self.statement.node_id)
    }

    /// Statement hash
    pub fn hash(&self) -> Hash {
        self.statement.compute_hash()
    }
}

/// Result of feeding an envelope to a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    /// Rejected: stale, insane, or carrying invalid values
    Invalid,
    /// Accepted without changing local state
    Valid,
    /// Accepted and moved local state
    ValidNew,
}

/// Verdict of the application on a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueValidation {
    /// Can never be agreed on
    Invalid,
    /// Cannot be checked yet (e.g. the previous ledger is not closed)
    MaybeValid,
    /// Checked against local state
    FullyValidated,
}

/// Per-slot timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimerKind {
    /// Nomination round timeout
    Nomination,
    /// Ballot round timeout
    Ballot,
}

/// This node's identity and trust configuration
#[derive(Debug, Clone)]
pub struct LocalNode {
    /// Node identity
    pub id: NodeId,
    /// Local quorum set
    pub quorum_set: QuorumSet,
    /// Hash of `quorum_set`
    pub quorum_set_hash: Hash,
}

impl LocalNode {
    /// New local node
    pub fn new(id: NodeId, quorum_set: QuorumSet) -> Self {
        let quorum_set_hash = quorum_set.compute_hash();
        Self {
            id,
            quorum_set,
            quorum_set_hash,
        }
    }
}

/// Application hooks a slot calls into
pub trait SlotDriver {
    /// Check a value against application rules
    fn validate_value(
        &mut self,
        slot: SlotIndex,
        value: &CandidateValue,
        nomination: bool,
    ) -> ValueValidation;

    /// Deterministically merge confirmed nomination candidates
    fn combine_candidates(
        &mut self,
        slot: SlotIndex,
        candidates: &BTreeSet<CandidateValue>,
    ) -> Option<CandidateValue>;

    /// Quorum set by hash, if known
    fn quorum_set(&self, hash: &Hash) -> Option<QuorumSet>;

    /// Sign a locally produced statement
    fn sign_statement(&self, statement: Statement) -> Envelope;

    /// Send a local envelope to peers
    fn emit_envelope(&mut self, envelope: &Envelope);

    /// A slot decided `value`
    fn value_externalized(&mut self, slot: SlotIndex, value: &CandidateValue);

    /// Arm (or re-arm) a slot timer
    fn setup_timer(&mut self, slot: SlotIndex, kind: TimerKind, timeout: Duration);

    /// Disarm a slot timer
    fn stop_timer(&mut self, slot: SlotIndex, kind: TimerKind);

    /// Timeout for `round`: bounded exponential backoff
    fn compute_timeout(&self, round: u32, _kind: TimerKind) -> Duration {
        backoff(Duration::from_secs(1), Duration::from_secs(30 * 60), round)
    }

    /// A value to vote for in place of `value`, which could not be fully
    /// validated. `None` leaves it out of our votes; it is reconsidered on
    /// the next nomination envelope once it validates.
    fn extract_valid_value(&mut self, _slot: SlotIndex, _value: &CandidateValue) -> Option<CandidateValue> {
        None
    }

    /// A value was added to this node's nomination votes
    fn nominating_value(&mut self, _slot: SlotIndex, _value: &CandidateValue) {}

    /// The ballot protocol started with `ballot`
    fn started_ballot_protocol(&mut self, _slot: SlotIndex, _ballot: &Ballot) {}

    /// Commit was accepted for `ballot`
    fn accepted_commit(&mut self, _slot: SlotIndex, _ballot: &Ballot) {}
}

/// `base * 2^(round - 1)`, capped at `max`
pub fn backoff(base: Duration, max: Duration, round: u32) -> Duration {
    let shift = round.saturating_sub(1).min(31);
    base.checked_mul(1u32 << shift).map_or(max, |d| d.min(max))
}
