//! Nomination: federated voting on candidate values.
//!
//! A node votes for its own value only when it is a round leader, and
//! otherwise echoes the best value of the leaders it has heard from. A value
//! is accepted once a v-blocking set accepted it or a quorum voted for or
//! accepted it; it becomes a candidate once a quorum accepted it. Every new
//! candidate recomputes the composite value handed to the ballot protocol.
//!
//! Values the driver cannot fully validate yet are never accepted. The
//! driver may offer a valid substitute through `extract_valid_value`, which
//! is voted for instead; otherwise the value waits for a later envelope.

use super::slot::{federated_accept, federated_ratify, SlotContext};
use super::{
    CandidateValue, Envelope, EnvelopeState, Nomination, Pledges, SlotDriver, Statement,
    TimerKind, ValueValidation,
};
use crate::NodeId;
use ledger_core::Hash;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

const HASH_N: u8 = 1;
const HASH_P: u8 = 2;
const HASH_K: u8 = 3;

/// Per-slot nomination state
#[derive(Debug, Default)]
pub struct NominationProtocol {
    round: u32,
    votes: BTreeSet<CandidateValue>,
    accepted: BTreeSet<CandidateValue>,
    candidates: BTreeSet<CandidateValue>,
    latest_nominations: BTreeMap<NodeId, Envelope>,
    last_envelope: Option<Envelope>,
    round_leaders: BTreeSet<NodeId>,
    started: bool,
    stopped: bool,
    latest_composite: Option<CandidateValue>,
    composite_changed: bool,
    /// Value and previous-ledger hash given to the last `nominate` call,
    /// replayed when the nomination timer fires
    proposal: Option<(CandidateValue, Hash)>,
    timer_exp_count: u32,
}

/// Diagnostic snapshot
#[derive(Debug, Clone, Serialize)]
pub struct NominationInfo {
    /// Current round
    pub round: u32,
    /// Started and not stopped
    pub running: bool,
    /// Votes, rendered
    pub votes: Vec<String>,
    /// Accepted values, rendered
    pub accepted: Vec<String>,
    /// Confirmed candidates, rendered
    pub candidates: Vec<String>,
}

impl NominationProtocol {
    /// Fresh state
    pub fn new() -> Self {
        Self::default()
    }

    /// Current round, 0 before the first `nominate`
    pub fn round(&self) -> u32 {
        self.round
    }

    /// True once `nominate` ran and nomination was not stopped
    pub fn is_running(&self) -> bool {
        self.started && !self.stopped
    }

    /// Values voted for
    pub fn votes(&self) -> &BTreeSet<CandidateValue> {
        &self.votes
    }

    /// Values accepted
    pub fn accepted(&self) -> &BTreeSet<CandidateValue> {
        &self.accepted
    }

    /// Confirmed candidates
    pub fn candidates(&self) -> &BTreeSet<CandidateValue> {
        &self.candidates
    }

    /// Current composite of the candidates
    pub fn latest_composite(&self) -> Option<CandidateValue> {
        self.latest_composite
    }

    /// Leaders selected so far
    pub fn round_leaders(&self) -> &BTreeSet<NodeId> {
        &self.round_leaders
    }

    /// Number of nomination timeouts seen
    pub fn timer_exp_count(&self) -> u32 {
        self.timer_exp_count
    }

    /// Latest local nomination envelope
    pub fn last_envelope(&self) -> Option<&Envelope> {
        self.last_envelope.as_ref()
    }

    /// Latest nomination envelope of every node heard from
    pub fn latest_envelopes(&self) -> impl Iterator<Item = &Envelope> {
        self.latest_nominations.values()
    }

    /// Composite value if it changed since the last call
    pub(crate) fn take_new_composite(&mut self) -> Option<CandidateValue> {
        if std::mem::take(&mut self.composite_changed) {
            self.latest_composite
        } else {
            None
        }
    }

    /// Stop nominating; the ballot protocol has taken over
    pub fn stop(&mut self) {
        self.stopped = true;
        self.started = false;
    }

    /// Diagnostic snapshot
    pub fn info(&self) -> NominationInfo {
        let render = |set: &BTreeSet<CandidateValue>| set.iter().map(|v| v.to_string()).collect();
        NominationInfo {
            round: self.round,
            running: self.is_running(),
            votes: render(&self.votes),
            accepted: render(&self.accepted),
            candidates: render(&self.candidates),
        }
    }

    /// Start a new nomination round proposing `value` on top of `previous`.
    ///
    /// Arms the nomination timer for the next round. Returns true if local
    /// state changed.
    pub(crate) fn nominate<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        value: CandidateValue,
        previous: &Hash,
        timed_out: bool,
    ) -> bool {
        if self.stopped || !self.candidates.is_empty() {
            return false;
        }
        if timed_out {
            self.timer_exp_count = self.timer_exp_count.saturating_add(1);
            if !self.started {
                return false;
            }
        }

        self.started = true;
        self.proposal = Some((value, *previous));
        self.round = self.round.saturating_add(1);
        self.update_round_leaders(ctx, previous);

        let mut updated = self.adopt_leader_values(ctx, driver);
        updated = self.vote_as_leader(ctx, driver, &value) || updated;

        let timeout = driver.compute_timeout(self.round, TimerKind::Nomination);
        driver.setup_timer(ctx.slot_index, TimerKind::Nomination, timeout);

        debug!(
            slot = ctx.slot_index,
            round = self.round,
            leaders = self.round_leaders.len(),
            updated,
            "Nomination round"
        );

        if updated {
            self.emit_nomination(ctx, driver);
        }
        updated
    }

    /// Nomination timer fired: run the next round with the same proposal
    pub(crate) fn timer_expired<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
    ) -> bool {
        match self.proposal {
            Some((value, previous)) => self.nominate(ctx, driver, value, &previous, true),
            None => false,
        }
    }

    /// Handle a peer's (or our own) nomination envelope
    pub(crate) fn process_envelope<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        envelope: &Envelope,
    ) -> EnvelopeState {
        let statement = &envelope.statement;
        let Pledges::Nominate(nomination) = &statement.pledges else {
            return EnvelopeState::Invalid;
        };
        if !self.is_newer_from(&statement.node_id, nomination) {
            return EnvelopeState::Invalid;
        }
        if !is_sane_nomination(nomination) {
            trace!(slot = ctx.slot_index, node = %statement.node_id, "Insane nomination");
            return EnvelopeState::Invalid;
        }

        self.latest_nominations
            .insert(statement.node_id, envelope.clone());

        if !self.started {
            return EnvelopeState::Valid;
        }

        let (mut modified, new_candidates) =
            self.attempt_promote(ctx, driver, &nomination.votes);

        if self.candidates.is_empty() && self.round_leaders.contains(&statement.node_id) {
            if let Some(vote) = self.new_value_from_nomination(ctx, driver, nomination) {
                if self.votes.insert(vote) {
                    driver.nominating_value(ctx.slot_index, &vote);
                    modified = true;
                }
            }
        }

        if modified {
            self.emit_nomination(ctx, driver);
        }
        if new_candidates {
            self.update_composite(ctx, driver);
        }

        if modified || new_candidates {
            EnvelopeState::ValidNew
        } else {
            EnvelopeState::Valid
        }
    }

    fn adopt_leader_values<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
    ) -> bool {
        let mut updated = false;
        let leaders: Vec<NodeId> = self.round_leaders.iter().copied().collect();
        for leader in leaders {
            let Some(Pledges::Nominate(nomination)) = self
                .latest_nominations
                .get(&leader)
                .map(|e| e.statement.pledges.clone())
            else {
                continue;
            };
            if let Some(vote) = self.new_value_from_nomination(ctx, driver, &nomination) {
                if self.votes.insert(vote) {
                    driver.nominating_value(ctx.slot_index, &vote);
                    updated = true;
                }
            }
        }
        updated
    }

    fn vote_as_leader<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        value: &CandidateValue,
    ) -> bool {
        if !self.round_leaders.contains(&ctx.local.id) || !self.votes.is_empty() {
            return false;
        }
        if driver.validate_value(ctx.slot_index, value, true) == ValueValidation::Invalid {
            return false;
        }
        if self.votes.insert(*value) {
            driver.nominating_value(ctx.slot_index, value);
            return true;
        }
        false
    }

    /// Promote votes to accepted and accepted values to candidates.
    /// Returns `(modified, new_candidates)`.
    fn attempt_promote<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        votes_to_check: &[CandidateValue],
    ) -> (bool, bool) {
        let mut modified = false;
        let mut new_candidates = false;

        for value in votes_to_check {
            if self.accepted.contains(value) {
                continue;
            }
            let accept = federated_accept(
                &*driver,
                ctx.local,
                &self.latest_nominations,
                |st| nomination_of(st).map_or(false, |n| n.votes.contains(value)),
                |st| nomination_of(st).map_or(false, |n| n.accepted.contains(value)),
            );
            if !accept {
                continue;
            }
            match driver.validate_value(ctx.slot_index, value, true) {
                ValueValidation::FullyValidated => {
                    if self.accepted.insert(*value) {
                        self.votes.insert(*value);
                        modified = true;
                    }
                }
                _ => {
                    if let Some(vote) = driver.extract_valid_value(ctx.slot_index, value) {
                        if self.votes.insert(vote) {
                            driver.nominating_value(ctx.slot_index, &vote);
                            modified = true;
                        }
                    }
                }
            }
        }

        let accepted: Vec<CandidateValue> = self.accepted.iter().copied().collect();
        for value in accepted {
            if self.candidates.contains(&value) {
                continue;
            }
            let ratified = federated_ratify(&*driver, ctx.local, &self.latest_nominations, |st| {
                nomination_of(st).map_or(false, |n| n.accepted.contains(&value))
            });
            if ratified && self.candidates.insert(value) {
                new_candidates = true;
                driver.stop_timer(ctx.slot_index, TimerKind::Nomination);
            }
        }

        (modified, new_candidates)
    }

    /// Build, self-process, and send a nomination with the current sets
    fn emit_nomination<D: SlotDriver + ?Sized>(&mut self, ctx: &SlotContext<'_>, driver: &mut D) {
        let nomination = Nomination {
            votes: self.votes.iter().copied().collect(),
            accepted: self.accepted.iter().copied().collect(),
        };
        let statement = Statement {
            node_id: ctx.local.id,
            slot_index: ctx.slot_index,
            quorum_set_hash: ctx.local.quorum_set_hash,
            pledges: Pledges::Nominate(nomination.clone()),
        };
        let envelope = driver.sign_statement(statement);

        if !self.is_newer_from(&ctx.local.id, &nomination) {
            return;
        }
        self.latest_nominations.insert(ctx.local.id, envelope.clone());

        if self.started {
            let (modified, new_candidates) = self.attempt_promote(ctx, driver, &nomination.votes);
            if modified {
                self.emit_nomination(ctx, driver);
            }
            if new_candidates {
                self.update_composite(ctx, driver);
            }
        }

        let newer = match self.last_envelope.as_ref().map(|e| &e.statement.pledges) {
            Some(Pledges::Nominate(last)) => is_newer_nomination(last, &nomination),
            _ => true,
        };
        if newer {
            self.last_envelope = Some(envelope.clone());
            driver.emit_envelope(&envelope);
        }
    }

    fn update_composite<D: SlotDriver + ?Sized>(&mut self, ctx: &SlotContext<'_>, driver: &mut D) {
        if self.candidates.is_empty() {
            return;
        }
        if let Some(composite) = driver.combine_candidates(ctx.slot_index, &self.candidates) {
            if self.latest_composite != Some(composite) {
                debug!(slot = ctx.slot_index, value = %composite, "New composite candidate");
                self.latest_composite = Some(composite);
                self.composite_changed = true;
            }
        }
    }

    /// Highest-hash value of `nomination` we do not vote for yet, looking
    /// at accepted values first and votes only if none of those is valid.
    /// Values that do not validate count through their extracted substitute.
    fn new_value_from_nomination<D: SlotDriver + ?Sized>(
        &self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        nomination: &Nomination,
    ) -> Option<CandidateValue> {
        let previous = self.proposal.map(|(_, p)| p).unwrap_or_default();
        let mut best: Option<(u64, CandidateValue)> = None;
        let mut found_valid = false;

        let mut consider = |value: &CandidateValue, found_valid: &mut bool| {
            let valid = match driver.validate_value(ctx.slot_index, value, true) {
                ValueValidation::FullyValidated => Some(*value),
                _ => driver.extract_valid_value(ctx.slot_index, value),
            };
            let Some(value) = valid else {
                return;
            };
            *found_valid = true;
            if self.votes.contains(&value) {
                return;
            }
            let hash = value_hash(ctx.slot_index, &previous, self.round, &value);
            if best.map_or(true, |(best_hash, _)| hash >= best_hash) {
                best = Some((hash, value));
            }
        };

        for value in &nomination.accepted {
            consider(value, &mut found_valid);
        }
        if !found_valid {
            for value in &nomination.votes {
                consider(value, &mut found_valid);
            }
        }
        best.map(|(_, v)| v)
    }

    /// Add this round's highest-priority node(s) to the leader set
    fn update_round_leaders(&mut self, ctx: &SlotContext<'_>, previous: &Hash) {
        let local = &ctx.local.id;
        let qset = &ctx.local.quorum_set;

        let mut top = self.node_priority(ctx, previous, local, u64::MAX);
        let mut leaders = BTreeSet::from([*local]);
        for node in qset.all_validators() {
            if node == *local {
                continue;
            }
            let priority = self.node_priority(ctx, previous, &node, qset.node_weight(&node));
            if priority > top {
                top = priority;
                leaders.clear();
            }
            if priority == top && priority > 0 {
                leaders.insert(node);
            }
        }
        self.round_leaders.extend(leaders);
    }

    fn node_priority(&self, ctx: &SlotContext<'_>, previous: &Hash, node: &NodeId, weight: u64) -> u64 {
        if weight == 0 {
            return 0;
        }
        if node_hash(ctx.slot_index, previous, self.round, HASH_N, node) <= weight {
            node_hash(ctx.slot_index, previous, self.round, HASH_P, node)
        } else {
            0
        }
    }

    fn is_newer_from(&self, node: &NodeId, nomination: &Nomination) -> bool {
        match self.latest_nominations.get(node).map(|e| &e.statement.pledges) {
            Some(Pledges::Nominate(old)) => is_newer_nomination(old, nomination),
            _ => true,
        }
    }
}

fn nomination_of(statement: &Statement) -> Option<&Nomination> {
    match &statement.pledges {
        Pledges::Nominate(n) => Some(n),
        _ => None,
    }
}

/// `new` keeps everything in `old` and adds at least one vote or acceptance
pub fn is_newer_nomination(old: &Nomination, new: &Nomination) -> bool {
    let subset = |a: &[CandidateValue], b: &[CandidateValue]| a.iter().all(|v| b.contains(v));
    if !subset(&old.votes, &new.votes) || !subset(&old.accepted, &new.accepted) {
        return false;
    }
    new.votes.len() > old.votes.len() || new.accepted.len() > old.accepted.len()
}

/// Non-empty, and both lists strictly ascending
pub fn is_sane_nomination(nomination: &Nomination) -> bool {
    let ascending = |values: &[CandidateValue]| values.windows(2).all(|w| w[0] < w[1]);
    (!nomination.votes.is_empty() || !nomination.accepted.is_empty())
        && ascending(&nomination.votes)
        && ascending(&nomination.accepted)
}

fn node_hash(slot: u64, previous: &Hash, round: u32, tag: u8, node: &NodeId) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&slot.to_be_bytes());
    hasher.update(previous);
    hasher.update(&[tag]);
    hasher.update(&round.to_be_bytes());
    hasher.update(node.as_bytes());
    first_u64(hasher.finalize())
}

fn value_hash(slot: u64, previous: &Hash, round: u32, value: &CandidateValue) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&slot.to_be_bytes());
    hasher.update(previous);
    hasher.update(&[HASH_K]);
    hasher.update(&round.to_be_bytes());
    hasher.update(&value.compute_hash());
    first_u64(hasher.finalize())
}

fn first_u64(hash: blake3::Hash) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(buf)
}
