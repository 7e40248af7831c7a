//! Ballot protocol: PREPARE, CONFIRM, EXTERNALIZE.
//!
//! Local state per slot:
//!
//! - `b` current ballot we are voting to prepare (and, in CONFIRM, commit)
//! - `p`, `p'` the two highest incompatible ballots accepted as prepared
//! - `h` highest ballot confirmed as prepared (CONFIRM: accepted committed)
//! - `c` lowest ballot we vote to commit (CONFIRM: accepted committed)
//!
//! Every received statement runs the four `attempt_*` steps in order, then
//! (at the outermost level only) the counter bump rule and the
//! heard-from-quorum check that arms the ballot timer. Local statements go
//! through the same path as remote ones, and only the last one produced by
//! an outermost call is sent.

use super::slot::{federated_accept, federated_ratify, SlotContext};
use super::{
    is_newer_statement, Ballot, CandidateValue, Confirm, Envelope, EnvelopeState, Externalize,
    Pledges, Prepare, SlotDriver, Statement, TimerKind, ValueValidation,
};
use crate::NodeId;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, trace};

/// Nested `advance_slot` calls allowed before giving up on a statement
const MAX_ADVANCE_SLOT_RECURSION: u32 = 50;

/// Ballot protocol phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum BallotPhase {
    /// Voting to prepare
    Prepare,
    /// Commit accepted
    Confirm,
    /// Value decided
    Externalize,
}

/// Per-slot ballot state
#[derive(Debug)]
pub struct BallotProtocol {
    phase: BallotPhase,
    current: Option<Ballot>,
    prepared: Option<Ballot>,
    prepared_prime: Option<Ballot>,
    high: Option<Ballot>,
    commit: Option<Ballot>,
    value_override: Option<CandidateValue>,
    latest_envelopes: BTreeMap<NodeId, Envelope>,
    heard_from_quorum: bool,
    fully_validated: bool,
    message_level: u32,
    last_envelope: Option<Envelope>,
    last_envelope_emit: Option<Envelope>,
}

/// Diagnostic snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BallotInfo {
    /// Phase
    pub phase: BallotPhase,
    /// `b`
    pub ballot: Option<String>,
    /// `p`
    pub prepared: Option<String>,
    /// `p'`
    pub prepared_prime: Option<String>,
    /// `h`
    pub high: Option<String>,
    /// `c`
    pub commit: Option<String>,
    /// Heard from a quorum at the current counter
    pub heard_from_quorum: bool,
    /// Nodes with a ballot statement recorded
    pub nodes: usize,
}

impl Default for BallotProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl BallotProtocol {
    /// Fresh state
    pub fn new() -> Self {
        Self {
            phase: BallotPhase::Prepare,
            current: None,
            prepared: None,
            prepared_prime: None,
            high: None,
            commit: None,
            value_override: None,
            latest_envelopes: BTreeMap::new(),
            heard_from_quorum: false,
            fully_validated: true,
            message_level: 0,
            last_envelope: None,
            last_envelope_emit: None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> BallotPhase {
        self.phase
    }

    /// Current ballot `b`
    pub fn current(&self) -> Option<&Ballot> {
        self.current.as_ref()
    }

    /// `p`
    pub fn prepared(&self) -> Option<&Ballot> {
        self.prepared.as_ref()
    }

    /// `p'`
    pub fn prepared_prime(&self) -> Option<&Ballot> {
        self.prepared_prime.as_ref()
    }

    /// `h`
    pub fn high(&self) -> Option<&Ballot> {
        self.high.as_ref()
    }

    /// `c`
    pub fn commit(&self) -> Option<&Ballot> {
        self.commit.as_ref()
    }

    /// True once a quorum reached our ballot counter
    pub fn heard_from_quorum(&self) -> bool {
        self.heard_from_quorum
    }

    /// False once a value we could not fully validate was seen; such a
    /// node keeps tracking the slot but does not send ballot statements
    pub fn is_fully_validated(&self) -> bool {
        self.fully_validated
    }

    /// Latest local ballot envelope
    pub fn last_envelope(&self) -> Option<&Envelope> {
        self.last_envelope.as_ref()
    }

    /// Latest ballot envelope of every node heard from
    pub fn latest_envelopes(&self) -> impl Iterator<Item = &Envelope> {
        self.latest_envelopes.values()
    }

    /// Decided value, once externalized
    pub fn externalized_value(&self) -> Option<CandidateValue> {
        match self.phase {
            BallotPhase::Externalize => self.commit.map(|c| c.value),
            _ => None,
        }
    }

    /// Diagnostic snapshot
    pub fn info(&self) -> BallotInfo {
        let show = |b: &Option<Ballot>| b.map(|b| b.to_string());
        BallotInfo {
            phase: self.phase,
            ballot: show(&self.current),
            prepared: show(&self.prepared),
            prepared_prime: show(&self.prepared_prime),
            high: show(&self.high),
            commit: show(&self.commit),
            heard_from_quorum: self.heard_from_quorum,
            nodes: self.latest_envelopes.len(),
        }
    }

    /// Handle a ballot envelope; `from_self` is set for locally produced ones
    pub(crate) fn process_envelope<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        envelope: &Envelope,
        from_self: bool,
    ) -> EnvelopeState {
        let statement = &envelope.statement;
        if !self.is_statement_sane(&*driver, statement, from_self) {
            trace!(slot = ctx.slot_index, node = %statement.node_id, "Insane ballot statement");
            return EnvelopeState::Invalid;
        }
        if !self.is_newer_from(statement) {
            return EnvelopeState::Invalid;
        }

        let validation = validate_values(ctx, driver, statement);
        if validation == ValueValidation::Invalid {
            debug!(
                slot = ctx.slot_index,
                node = %statement.node_id,
                kind = statement.pledges.name(),
                "Ballot statement carries an invalid value"
            );
            return EnvelopeState::Invalid;
        }

        if self.phase != BallotPhase::Externalize {
            if validation == ValueValidation::MaybeValid {
                self.fully_validated = false;
            }
            self.latest_envelopes
                .insert(statement.node_id, envelope.clone());
            self.advance_slot(ctx, driver, statement);
            return EnvelopeState::Valid;
        }

        // After externalizing, only record statements agreeing with the outcome
        match self.commit {
            Some(commit) if working_ballot(statement).is_compatible(&commit) => {
                self.latest_envelopes
                    .insert(statement.node_id, envelope.clone());
                EnvelopeState::Valid
            }
            _ => EnvelopeState::Invalid,
        }
    }

    /// Ballot timer fired
    pub(crate) fn timer_expired<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
    ) -> bool {
        debug!(slot = ctx.slot_index, ballot = ?self.current.map(|b| b.counter), "Ballot timeout");
        self.abandon_ballot(ctx, driver, 0)
    }

    /// Start (when `force` is false and no ballot exists) or bump the
    /// ballot to the next counter with `value`
    pub(crate) fn bump_state<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        value: CandidateValue,
        force: bool,
    ) -> bool {
        if !force && self.current.is_some() {
            return false;
        }
        let n = self.current.map_or(1, |b| b.counter.saturating_add(1));
        self.bump_state_to(ctx, driver, value, n)
    }

    fn bump_state_to<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        value: CandidateValue,
        counter: u32,
    ) -> bool {
        if self.phase == BallotPhase::Externalize {
            return false;
        }
        let ballot = Ballot::new(counter, self.value_override.unwrap_or(value));
        let updated = self.update_current_value(ballot);
        if updated {
            self.emit_current_state(ctx, driver);
            self.check_heard_from_quorum(ctx, driver);
        }
        updated
    }

    fn abandon_ballot<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        counter: u32,
    ) -> bool {
        let value = ctx.composite.or(self.current.map(|b| b.value));
        match value {
            Some(value) if counter == 0 => self.bump_state(ctx, driver, value, true),
            Some(value) => self.bump_state_to(ctx, driver, value, counter),
            None => false,
        }
    }

    fn update_current_value(&mut self, ballot: Ballot) -> bool {
        if self.phase == BallotPhase::Externalize {
            return false;
        }
        let Some(current) = self.current else {
            self.bump_to_ballot(ballot);
            return true;
        };
        if let Some(commit) = self.commit {
            if !commit.is_compatible(&ballot) {
                return false;
            }
        }
        if current < ballot {
            self.bump_to_ballot(ballot);
            true
        } else {
            false
        }
    }

    fn bump_to_ballot(&mut self, ballot: Ballot) {
        let bumped = self.current.map_or(true, |b| b.counter != ballot.counter);
        self.current = Some(ballot);
        // h.value == b.value
        if let Some(high) = self.high {
            if !high.is_compatible(&ballot) {
                self.high = None;
            }
        }
        if bumped {
            self.heard_from_quorum = false;
        }
    }

    fn update_current_if_needed(&mut self, high: Ballot) -> bool {
        if self.current.map_or(true, |b| b < high) {
            self.bump_to_ballot(high);
            return true;
        }
        false
    }

    fn advance_slot<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        hint: &Statement,
    ) {
        self.message_level += 1;
        if self.message_level >= MAX_ADVANCE_SLOT_RECURSION {
            error!(slot = ctx.slot_index, "Ballot protocol recursion limit reached");
            self.message_level -= 1;
            return;
        }

        let mut did_work = self.attempt_accept_prepared(ctx, driver, hint);
        did_work = self.attempt_confirm_prepared(ctx, driver, hint) || did_work;
        did_work = self.attempt_accept_commit(ctx, driver, hint) || did_work;
        did_work = self.attempt_confirm_commit(ctx, driver, hint) || did_work;

        if self.message_level == 1 {
            while self.attempt_bump(ctx, driver) {
                did_work = true;
            }
            self.check_heard_from_quorum(ctx, driver);
        }

        self.message_level -= 1;
        if did_work {
            self.send_latest_envelope(driver);
        }
    }

    /// Ballots that may have been prepared by someone, given the hint
    fn prepare_candidates(&self, hint: &Statement) -> BTreeSet<Ballot> {
        let mut hints = BTreeSet::new();
        match &hint.pledges {
            Pledges::Nominate(_) => {}
            Pledges::Prepare(p) => {
                hints.insert(p.ballot);
                hints.extend(p.prepared);
                hints.extend(p.prepared_prime);
            }
            Pledges::Confirm(c) => {
                hints.insert(Ballot::new(c.n_prepared, c.ballot.value));
                hints.insert(Ballot::new(u32::MAX, c.ballot.value));
            }
            Pledges::Externalize(e) => {
                hints.insert(Ballot::new(u32::MAX, e.commit.value));
            }
        }

        let mut candidates = BTreeSet::new();
        for top in hints.iter().rev() {
            if top.counter == 0 {
                continue;
            }
            for envelope in self.latest_envelopes.values() {
                match &envelope.statement.pledges {
                    Pledges::Nominate(_) => {}
                    Pledges::Prepare(p) => {
                        if p.ballot.counter != 0 && p.ballot.less_and_compatible(top) {
                            candidates.insert(p.ballot);
                        }
                        for b in [p.prepared, p.prepared_prime].into_iter().flatten() {
                            if b.counter != 0 && b.less_and_compatible(top) {
                                candidates.insert(b);
                            }
                        }
                    }
                    Pledges::Confirm(c) => {
                        if top.is_compatible(&c.ballot) {
                            candidates.insert(*top);
                            if c.n_prepared != 0 && c.n_prepared < top.counter {
                                candidates.insert(Ballot::new(c.n_prepared, top.value));
                            }
                        }
                    }
                    Pledges::Externalize(e) => {
                        if top.is_compatible(&e.commit) {
                            candidates.insert(*top);
                        }
                    }
                }
            }
        }
        candidates
    }

    fn attempt_accept_prepared<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        hint: &Statement,
    ) -> bool {
        if self.phase > BallotPhase::Confirm {
            return false;
        }
        let candidates = self.prepare_candidates(hint);
        for ballot in candidates.iter().rev().copied() {
            if self.phase == BallotPhase::Confirm {
                // only ballots that can raise p
                if !self.prepared.map_or(false, |p| p.less_and_compatible(&ballot)) {
                    continue;
                }
            }
            if self.prepared_prime.map_or(false, |pp| ballot <= pp) {
                continue;
            }
            if self.prepared.map_or(false, |p| ballot.less_and_compatible(&p)) {
                continue;
            }
            let accepted = federated_accept(
                &*driver,
                ctx.local,
                &self.latest_envelopes,
                |st| match &st.pledges {
                    Pledges::Nominate(_) => false,
                    Pledges::Prepare(p) => ballot.less_and_compatible(&p.ballot),
                    Pledges::Confirm(c) => ballot.is_compatible(&c.ballot),
                    Pledges::Externalize(e) => ballot.is_compatible(&e.commit),
                },
                |st| has_prepared_ballot(&ballot, st),
            );
            if accepted {
                return self.set_accept_prepared(ctx, driver, ballot);
            }
        }
        false
    }

    fn set_accept_prepared<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        ballot: Ballot,
    ) -> bool {
        let mut did_work = self.set_prepared(ballot);

        if let (Some(_), Some(high)) = (self.commit, self.high) {
            let conflicts = |b: Option<Ballot>| b.map_or(false, |b| high.less_and_incompatible(&b));
            if conflicts(self.prepared) || conflicts(self.prepared_prime) {
                self.commit = None;
                did_work = true;
            }
        }

        if did_work {
            trace!(slot = ctx.slot_index, %ballot, "Accepted prepared");
            self.emit_current_state(ctx, driver);
        }
        did_work
    }

    fn set_prepared(&mut self, ballot: Ballot) -> bool {
        let Some(prepared) = self.prepared else {
            self.prepared = Some(ballot);
            return true;
        };
        if prepared < ballot {
            if !prepared.is_compatible(&ballot) {
                self.prepared_prime = Some(prepared);
            }
            self.prepared = Some(ballot);
            true
        } else if prepared > ballot {
            let raise_prime = match self.prepared_prime {
                None => true,
                Some(pp) => pp < ballot && !prepared.is_compatible(&ballot),
            };
            if raise_prime {
                self.prepared_prime = Some(ballot);
            }
            raise_prime
        } else {
            false
        }
    }

    fn attempt_confirm_prepared<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        hint: &Statement,
    ) -> bool {
        if self.phase != BallotPhase::Prepare || self.prepared.is_none() {
            return false;
        }
        let candidates: Vec<Ballot> = self.prepare_candidates(hint).into_iter().rev().collect();

        let mut idx = 0;
        let mut new_high = None;
        while idx < candidates.len() {
            let ballot = candidates[idx];
            if self.high.map_or(false, |h| h >= ballot) {
                break;
            }
            if federated_ratify(&*driver, ctx.local, &self.latest_envelopes, |st| {
                has_prepared_ballot(&ballot, st)
            }) {
                new_high = Some(ballot);
                break;
            }
            idx += 1;
        }
        let Some(new_high) = new_high else {
            return false;
        };

        let mut new_commit = None;
        let b = self.current.unwrap_or_default();
        let blocked = |other: Option<Ballot>| other.map_or(false, |o| new_high.less_and_incompatible(&o));
        if self.commit.is_none() && !blocked(self.prepared) && !blocked(self.prepared_prime) {
            // continue from h downwards, looking for the lowest ratified c
            for ballot in candidates[idx..].iter().copied() {
                if ballot < b {
                    break;
                }
                if !ballot.less_and_compatible(&new_high) {
                    continue;
                }
                if federated_ratify(&*driver, ctx.local, &self.latest_envelopes, |st| {
                    has_prepared_ballot(&ballot, st)
                }) {
                    new_commit = Some(ballot);
                } else {
                    break;
                }
            }
        }
        self.set_confirm_prepared(ctx, driver, new_commit, new_high)
    }

    fn set_confirm_prepared<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        new_commit: Option<Ballot>,
        new_high: Ballot,
    ) -> bool {
        let mut did_work = false;
        self.value_override = Some(new_high.value);

        if self.current.map_or(true, |b| b.is_compatible(&new_high)) {
            if self.high.map_or(true, |h| new_high > h) {
                self.high = Some(new_high);
                did_work = true;
            }
            if let Some(commit) = new_commit {
                self.commit = Some(commit);
                did_work = true;
            }
        }

        did_work = self.update_current_if_needed(new_high) || did_work;
        if did_work {
            trace!(slot = ctx.slot_index, high = %new_high, "Confirmed prepared");
            self.emit_current_state(ctx, driver);
        }
        did_work
    }

    fn attempt_accept_commit<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        hint: &Statement,
    ) -> bool {
        if self.phase > BallotPhase::Confirm {
            return false;
        }
        let ballot = match &hint.pledges {
            Pledges::Nominate(_) => return false,
            Pledges::Prepare(p) if p.n_c != 0 => Ballot::new(p.n_h, p.ballot.value),
            Pledges::Prepare(_) => return false,
            Pledges::Confirm(c) => Ballot::new(c.n_h, c.ballot.value),
            Pledges::Externalize(e) => Ballot::new(e.n_h, e.commit.value),
        };
        if self.phase == BallotPhase::Confirm && !self.high.map_or(false, |h| h.is_compatible(&ballot)) {
            return false;
        }

        let boundaries = self.commit_boundaries(&ballot);
        if boundaries.is_empty() {
            return false;
        }
        let envelopes = &self.latest_envelopes;
        let local = ctx.local;
        let candidate = find_extended_interval(&boundaries, |(lo, hi)| {
            federated_accept(
                &*driver,
                local,
                envelopes,
                |st| match &st.pledges {
                    Pledges::Nominate(_) => false,
                    Pledges::Prepare(p) => {
                        ballot.is_compatible(&p.ballot) && p.n_c != 0 && p.n_c <= lo && hi <= p.n_h
                    }
                    Pledges::Confirm(c) => ballot.is_compatible(&c.ballot) && c.n_commit <= lo,
                    Pledges::Externalize(e) => ballot.is_compatible(&e.commit) && e.commit.counter <= lo,
                },
                |st| commit_predicate(&ballot, (lo, hi), st),
            )
        });

        let Some((lo, hi)) = candidate else {
            return false;
        };
        if self.phase == BallotPhase::Confirm && !self.high.map_or(true, |h| hi > h.counter) {
            return false;
        }
        self.set_accept_commit(
            ctx,
            driver,
            Ballot::new(lo, ballot.value),
            Ballot::new(hi, ballot.value),
        )
    }

    fn set_accept_commit<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        commit: Ballot,
        high: Ballot,
    ) -> bool {
        let mut did_work = false;
        self.value_override = Some(high.value);

        if self.high != Some(high) || self.commit != Some(commit) {
            self.commit = Some(commit);
            self.high = Some(high);
            did_work = true;
        }

        if self.phase == BallotPhase::Prepare {
            self.phase = BallotPhase::Confirm;
            if let Some(current) = self.current {
                if !high.less_and_compatible(&current) {
                    self.bump_to_ballot(high);
                }
            }
            self.prepared_prime = None;
            did_work = true;
        }

        if did_work {
            self.update_current_if_needed(high);
            debug!(slot = ctx.slot_index, %commit, %high, "Accepted commit");
            driver.accepted_commit(ctx.slot_index, &high);
            self.emit_current_state(ctx, driver);
        }
        did_work
    }

    fn attempt_confirm_commit<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        hint: &Statement,
    ) -> bool {
        if self.phase != BallotPhase::Confirm {
            return false;
        }
        let Some(commit) = self.commit else {
            return false;
        };
        if self.high.is_none() {
            return false;
        }
        let ballot = match &hint.pledges {
            Pledges::Nominate(_) | Pledges::Prepare(_) => return false,
            Pledges::Confirm(c) => Ballot::new(c.n_h, c.ballot.value),
            Pledges::Externalize(e) => Ballot::new(e.n_h, e.commit.value),
        };
        if !ballot.is_compatible(&commit) {
            return false;
        }

        let boundaries = self.commit_boundaries(&ballot);
        let envelopes = &self.latest_envelopes;
        let local = ctx.local;
        let candidate = find_extended_interval(&boundaries, |interval| {
            federated_ratify(&*driver, local, envelopes, |st| {
                commit_predicate(&ballot, interval, st)
            })
        });

        match candidate {
            Some((lo, hi)) => self.set_confirm_commit(
                ctx,
                driver,
                Ballot::new(lo, ballot.value),
                Ballot::new(hi, ballot.value),
            ),
            None => false,
        }
    }

    fn set_confirm_commit<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
        commit: Ballot,
        high: Ballot,
    ) -> bool {
        self.commit = Some(commit);
        self.high = Some(high);
        self.update_current_if_needed(high);
        self.phase = BallotPhase::Externalize;

        info!(slot = ctx.slot_index, value = %commit.value, %commit, %high, "Externalized");
        self.emit_current_state(ctx, driver);
        driver.stop_timer(ctx.slot_index, TimerKind::Ballot);
        driver.stop_timer(ctx.slot_index, TimerKind::Nomination);
        driver.value_externalized(ctx.slot_index, &commit.value);
        true
    }

    /// Counters of statements compatible with `ballot` that bound a commit
    /// interval
    fn commit_boundaries(&self, ballot: &Ballot) -> BTreeSet<u32> {
        let mut out = BTreeSet::new();
        for envelope in self.latest_envelopes.values() {
            match &envelope.statement.pledges {
                Pledges::Nominate(_) => {}
                Pledges::Prepare(p) => {
                    if ballot.is_compatible(&p.ballot) && p.n_c != 0 {
                        out.insert(p.n_c);
                        out.insert(p.n_h);
                    }
                }
                Pledges::Confirm(c) => {
                    if ballot.is_compatible(&c.ballot) {
                        out.insert(c.n_commit);
                        out.insert(c.n_h);
                    }
                }
                Pledges::Externalize(e) => {
                    if ballot.is_compatible(&e.commit) {
                        out.insert(e.commit.counter);
                        out.insert(e.n_h);
                        out.insert(u32::MAX);
                    }
                }
            }
        }
        out
    }

    /// Smallest counter bump that leaves no v-blocking set ahead of us
    fn attempt_bump<D: SlotDriver + ?Sized>(&mut self, ctx: &SlotContext<'_>, driver: &mut D) -> bool {
        if self.phase > BallotPhase::Confirm {
            return false;
        }
        let local_counter = self.current.map_or(0, |b| b.counter);
        let ahead_of = |n: u32| -> BTreeSet<NodeId> {
            self.latest_envelopes
                .iter()
                .filter(|(_, e)| e.statement.ballot_counter() > n)
                .map(|(id, _)| *id)
                .collect()
        };
        if !ctx.local.quorum_set.is_v_blocking(&ahead_of(local_counter)) {
            return false;
        }

        let counters: BTreeSet<u32> = self
            .latest_envelopes
            .values()
            .map(|e| e.statement.ballot_counter())
            .filter(|c| *c > local_counter)
            .collect();
        let target = counters
            .into_iter()
            .find(|n| !ctx.local.quorum_set.is_v_blocking(&ahead_of(*n)));

        match target {
            Some(n) => {
                debug!(slot = ctx.slot_index, from = local_counter, to = n, "Bumping ballot counter");
                self.abandon_ballot(ctx, driver, n)
            }
            None => false,
        }
    }

    /// Arm the ballot timer once a quorum has reached our counter
    fn check_heard_from_quorum<D: SlotDriver + ?Sized>(
        &mut self,
        ctx: &SlotContext<'_>,
        driver: &mut D,
    ) {
        let Some(current) = self.current else {
            return;
        };
        let heard = federated_ratify(&*driver, ctx.local, &self.latest_envelopes, |st| match &st.pledges {
            Pledges::Nominate(_) => false,
            Pledges::Prepare(p) => current.counter <= p.ballot.counter,
            Pledges::Confirm(_) | Pledges::Externalize(_) => true,
        });

        if heard {
            let was_heard = std::mem::replace(&mut self.heard_from_quorum, true);
            if !was_heard && self.phase != BallotPhase::Externalize {
                let timeout = driver.compute_timeout(current.counter, TimerKind::Ballot);
                trace!(slot = ctx.slot_index, counter = current.counter, ?timeout, "Heard from quorum");
                driver.setup_timer(ctx.slot_index, TimerKind::Ballot, timeout);
            }
            if self.phase == BallotPhase::Externalize {
                driver.stop_timer(ctx.slot_index, TimerKind::Ballot);
            }
        } else {
            self.heard_from_quorum = false;
            driver.stop_timer(ctx.slot_index, TimerKind::Ballot);
        }
    }

    fn current_statement(&self, ctx: &SlotContext<'_>) -> Statement {
        let counter = |b: Option<Ballot>| b.map_or(0, |b| b.counter);
        let pledges = match self.phase {
            BallotPhase::Prepare => Pledges::Prepare(Prepare {
                ballot: self.current.unwrap_or_else(|| {
                    Ballot::new(0, self.prepared.map(|p| p.value).unwrap_or_default())
                }),
                prepared: self.prepared,
                prepared_prime: self.prepared_prime,
                n_c: counter(self.commit),
                n_h: counter(self.high),
            }),
            BallotPhase::Confirm => {
                let high = self.high.unwrap_or_default();
                Pledges::Confirm(Confirm {
                    ballot: self.current.unwrap_or(high),
                    n_prepared: counter(self.prepared),
                    n_commit: counter(self.commit),
                    n_h: high.counter,
                })
            }
            BallotPhase::Externalize => Pledges::Externalize(Externalize {
                commit: self.commit.unwrap_or_default(),
                n_h: counter(self.high),
            }),
        };
        Statement {
            node_id: ctx.local.id,
            slot_index: ctx.slot_index,
            quorum_set_hash: ctx.local.quorum_set_hash,
            pledges,
        }
    }

    /// Produce the statement for the current state and run it through our
    /// own processing
    fn emit_current_state<D: SlotDriver + ?Sized>(&mut self, ctx: &SlotContext<'_>, driver: &mut D) {
        let statement = self.current_statement(ctx);
        let can_emit = self.current.is_some();

        if self
            .latest_envelopes
            .get(&ctx.local.id)
            .map_or(false, |e| e.statement == statement)
        {
            return;
        }

        let envelope = driver.sign_statement(statement);
        if self.process_envelope(ctx, driver, &envelope, true) == EnvelopeState::Invalid {
            error!(
                slot = ctx.slot_index,
                kind = envelope.statement.pledges.name(),
                "Local ballot statement rejected by own validation"
            );
            return;
        }

        let newer = self
            .last_envelope
            .as_ref()
            .map_or(true, |last| is_newer_statement(&last.statement, &envelope.statement));
        if can_emit && newer {
            self.last_envelope = Some(envelope);
            self.send_latest_envelope(driver);
        }
    }

    fn send_latest_envelope<D: SlotDriver + ?Sized>(&mut self, driver: &mut D) {
        if self.message_level != 0 || !self.fully_validated {
            return;
        }
        let Some(last) = &self.last_envelope else {
            return;
        };
        if self.last_envelope_emit.as_ref() != Some(last) {
            self.last_envelope_emit = Some(last.clone());
            driver.emit_envelope(last);
        }
    }

    fn is_newer_from(&self, statement: &Statement) -> bool {
        self.latest_envelopes
            .get(&statement.node_id)
            .map_or(true, |old| is_newer_statement(&old.statement, statement))
    }

    fn is_statement_sane<D: SlotDriver + ?Sized>(&self, driver: &D, statement: &Statement, from_self: bool) -> bool {
        let qset_ok = driver
            .quorum_set(&statement.quorum_set_hash)
            .map_or(false, |q| q.check_sanity().is_ok());
        if !qset_ok {
            return false;
        }
        match &statement.pledges {
            Pledges::Nominate(_) => false,
            Pledges::Prepare(p) => {
                let mut ok = from_self || p.ballot.counter > 0;
                if let (Some(pp), Some(prep)) = (p.prepared_prime, p.prepared) {
                    ok = ok && pp.less_and_incompatible(&prep);
                }
                ok = ok && (p.n_h == 0 || p.prepared.map_or(false, |prep| p.n_h <= prep.counter));
                ok && (p.n_c == 0 || (p.n_h != 0 && p.ballot.counter >= p.n_h && p.n_h >= p.n_c))
            }
            Pledges::Confirm(c) => c.ballot.counter > 0 && c.n_h <= c.ballot.counter && c.n_commit <= c.n_h,
            Pledges::Externalize(e) => e.commit.counter > 0 && e.n_h >= e.commit.counter,
        }
    }
}

/// True if `statement` shows its issuer accepted `ballot` as prepared
fn has_prepared_ballot(ballot: &Ballot, statement: &Statement) -> bool {
    match &statement.pledges {
        Pledges::Nominate(_) => false,
        Pledges::Prepare(p) => [p.prepared, p.prepared_prime]
            .into_iter()
            .flatten()
            .any(|b| ballot.less_and_compatible(&b)),
        Pledges::Confirm(c) => ballot.less_and_compatible(&Ballot::new(c.n_prepared, c.ballot.value)),
        Pledges::Externalize(e) => ballot.is_compatible(&e.commit),
    }
}

/// True if `statement` accepted commit for every counter of `interval`
fn commit_predicate(ballot: &Ballot, (lo, hi): (u32, u32), statement: &Statement) -> bool {
    match &statement.pledges {
        Pledges::Nominate(_) | Pledges::Prepare(_) => false,
        Pledges::Confirm(c) => ballot.is_compatible(&c.ballot) && c.n_commit <= lo && hi <= c.n_h,
        Pledges::Externalize(e) => ballot.is_compatible(&e.commit) && e.commit.counter <= lo,
    }
}

/// The ballot a statement is working with
fn working_ballot(statement: &Statement) -> Ballot {
    match &statement.pledges {
        Pledges::Nominate(_) => Ballot::default(),
        Pledges::Prepare(p) => p.ballot,
        Pledges::Confirm(c) => Ballot::new(c.n_commit, c.ballot.value),
        Pledges::Externalize(e) => e.commit,
    }
}

/// Weakest validation level among the statement's values
fn validate_values<D: SlotDriver + ?Sized>(
    ctx: &SlotContext<'_>,
    driver: &mut D,
    statement: &Statement,
) -> ValueValidation {
    let values = statement.values();
    if values.is_empty() {
        return ValueValidation::Invalid;
    }
    values
        .iter()
        .map(|v| driver.validate_value(ctx.slot_index, v, false))
        .min()
        .unwrap_or(ValueValidation::Invalid)
}

/// Scan boundaries from the top: find the highest counter satisfying
/// `pred` as a single-point interval, then extend its low end downwards
/// while `pred` still holds.
fn find_extended_interval<F>(boundaries: &BTreeSet<u32>, mut pred: F) -> Option<(u32, u32)>
where
    F: FnMut((u32, u32)) -> bool,
{
    let mut candidate: Option<(u32, u32)> = None;
    for &bound in boundaries.iter().rev() {
        let cur = match candidate {
            None => (bound, bound),
            Some((_, hi)) if bound > hi => continue,
            Some((_, hi)) => (bound, hi),
        };
        if bound == 0 {
            break;
        }
        if pred(cur) {
            candidate = Some(cur);
        } else if candidate.is_some() {
            break;
        }
    }
    candidate
}
