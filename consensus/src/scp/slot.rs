//! One consensus instance per ledger sequence number.

use super::ballot::{BallotInfo, BallotPhase, BallotProtocol};
use super::nomination::{NominationInfo, NominationProtocol};
use super::{
    CandidateValue, Envelope, EnvelopeState, LocalNode, Pledges, SlotDriver, SlotIndex, Statement,
    TimerKind,
};
use crate::quorum::{is_quorum, QuorumSet};
use crate::NodeId;
use ledger_core::Hash;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::trace;

/// Where a slot stands; never moves backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SlotPhase {
    /// No ballot yet
    Nominating,
    /// Balloting, commit not accepted
    Preparing,
    /// Commit accepted
    Confirming,
    /// Decided
    Externalized,
}

impl fmt::Display for SlotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotPhase::Nominating => "NOMINATING",
            SlotPhase::Preparing => "PREPARING",
            SlotPhase::Confirming => "CONFIRMING",
            SlotPhase::Externalized => "EXTERNALIZED",
        };
        f.write_str(s)
    }
}

/// Read-only inputs every protocol step needs
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotContext<'a> {
    pub local: &'a LocalNode,
    pub slot_index: SlotIndex,
    /// Latest nomination composite, used when abandoning a ballot
    pub composite: Option<CandidateValue>,
}

impl<'a> SlotContext<'a> {
    fn new(local: &'a LocalNode, slot_index: SlotIndex, nomination: &NominationProtocol) -> Self {
        Self {
            local,
            slot_index,
            composite: nomination.latest_composite(),
        }
    }
}

/// Diagnostic snapshot of a slot
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    /// Slot index
    pub index: SlotIndex,
    /// Phase
    pub phase: SlotPhase,
    /// Nomination state
    pub nomination: NominationInfo,
    /// Ballot state
    pub ballot: BallotInfo,
}

/// Nomination plus ballot protocol for one slot
#[derive(Debug)]
pub struct Slot {
    index: SlotIndex,
    local: LocalNode,
    nomination: NominationProtocol,
    ballot: BallotProtocol,
}

impl Slot {
    /// New slot for `index`
    pub fn new(index: SlotIndex, local: LocalNode) -> Self {
        Self {
            index,
            local,
            nomination: NominationProtocol::new(),
            ballot: BallotProtocol::new(),
        }
    }

    /// Slot index
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    /// Current phase
    pub fn phase(&self) -> SlotPhase {
        match self.ballot.phase() {
            BallotPhase::Prepare if self.ballot.current().is_none() => SlotPhase::Nominating,
            BallotPhase::Prepare => SlotPhase::Preparing,
            BallotPhase::Confirm => SlotPhase::Confirming,
            BallotPhase::Externalize => SlotPhase::Externalized,
        }
    }

    /// Nomination state
    pub fn nomination(&self) -> &NominationProtocol {
        &self.nomination
    }

    /// Ballot state
    pub fn ballot(&self) -> &BallotProtocol {
        &self.ballot
    }

    /// Decided value
    pub fn externalized_value(&self) -> Option<CandidateValue> {
        self.ballot.externalized_value()
    }

    /// Latest envelopes this node produced, ballot first
    pub fn latest_local_envelopes(&self) -> Vec<Envelope> {
        let mut out = Vec::new();
        out.extend(self.nomination.last_envelope().cloned());
        out.extend(self.ballot.last_envelope().cloned());
        out
    }

    /// Diagnostic snapshot
    pub fn info(&self) -> SlotInfo {
        SlotInfo {
            index: self.index,
            phase: self.phase(),
            nomination: self.nomination.info(),
            ballot: self.ballot.info(),
        }
    }

    /// Propose `value` for this slot on top of the ledger `previous`
    pub fn nominate<D: SlotDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        value: CandidateValue,
        previous: &Hash,
    ) -> bool {
        let ctx = SlotContext::new(&self.local, self.index, &self.nomination);
        let updated = self.nomination.nominate(&ctx, driver, value, previous, false);
        self.after_nomination(driver);
        updated
    }

    /// Feed a verified envelope for this slot
    pub fn process_envelope<D: SlotDriver + ?Sized>(
        &mut self,
        driver: &mut D,
        envelope: &Envelope,
    ) -> EnvelopeState {
        if envelope.statement.slot_index != self.index {
            return EnvelopeState::Invalid;
        }
        trace!(
            slot = self.index,
            node = %envelope.statement.node_id,
            kind = envelope.statement.pledges.name(),
            "Processing envelope"
        );
        let ctx = SlotContext::new(&self.local, self.index, &self.nomination);
        match envelope.statement.pledges {
            Pledges::Nominate(_) => {
                let state = self.nomination.process_envelope(&ctx, driver, envelope);
                self.after_nomination(driver);
                state
            }
            _ => {
                let state = self.ballot.process_envelope(&ctx, driver, envelope, false);
                self.after_ballot(driver);
                state
            }
        }
    }

    /// A slot timer fired
    pub fn timer_expired<D: SlotDriver + ?Sized>(&mut self, driver: &mut D, kind: TimerKind) -> bool {
        let ctx = SlotContext::new(&self.local, self.index, &self.nomination);
        match kind {
            TimerKind::Nomination => {
                let updated = self.nomination.timer_expired(&ctx, driver);
                self.after_nomination(driver);
                updated
            }
            TimerKind::Ballot => {
                let updated = self.ballot.timer_expired(&ctx, driver);
                self.after_ballot(driver);
                updated
            }
        }
    }

    /// Hand a fresh composite to the ballot protocol
    fn after_nomination<D: SlotDriver + ?Sized>(&mut self, driver: &mut D) {
        if let Some(composite) = self.nomination.take_new_composite() {
            let ctx = SlotContext::new(&self.local, self.index, &self.nomination);
            if self.ballot.bump_state(&ctx, driver, composite, false) {
                if let Some(b) = self.ballot.current() {
                    driver.started_ballot_protocol(self.index, b);
                }
            }
        }
        self.after_ballot(driver);
    }

    fn after_ballot<D: SlotDriver + ?Sized>(&mut self, driver: &mut D) {
        if self.ballot.phase() != BallotPhase::Prepare && self.nomination.is_running() {
            self.nomination.stop();
            driver.stop_timer(self.index, TimerKind::Nomination);
        }
    }
}

fn qset_of<D: SlotDriver + ?Sized>(
    driver: &D,
    envelopes: &BTreeMap<NodeId, Envelope>,
    node: &NodeId,
) -> Option<QuorumSet> {
    envelopes
        .get(node)
        .and_then(|e| driver.quorum_set(&e.statement.quorum_set_hash))
}

fn nodes_where<F>(envelopes: &BTreeMap<NodeId, Envelope>, pred: F) -> BTreeSet<NodeId>
where
    F: Fn(&Statement) -> bool,
{
    envelopes
        .iter()
        .filter(|(_, e)| pred(&e.statement))
        .map(|(id, _)| *id)
        .collect()
}

/// Federated accept: a v-blocking set accepted, or a quorum voted or
/// accepted
pub(crate) fn federated_accept<D, V, A>(
    driver: &D,
    local: &LocalNode,
    envelopes: &BTreeMap<NodeId, Envelope>,
    voted: V,
    accepted: A,
) -> bool
where
    D: SlotDriver + ?Sized,
    V: Fn(&Statement) -> bool,
    A: Fn(&Statement) -> bool,
{
    let acceptors = nodes_where(envelopes, &accepted);
    if local.quorum_set.is_v_blocking(&acceptors) {
        return true;
    }
    let supporters = nodes_where(envelopes, |st| voted(st) || accepted(st));
    is_quorum(&local.quorum_set, &supporters, |n| qset_of(driver, envelopes, n))
}

/// Federated ratify: a quorum satisfies `pred`
pub(crate) fn federated_ratify<D, F>(
    driver: &D,
    local: &LocalNode,
    envelopes: &BTreeMap<NodeId, Envelope>,
    pred: F,
) -> bool
where
    D: SlotDriver + ?Sized,
    F: Fn(&Statement) -> bool,
{
    let nodes = nodes_where(envelopes, pred);
    is_quorum(&local.quorum_set, &nodes, |n| qset_of(driver, envelopes, n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scp::{Ballot, Externalize, Nomination, Prepare, ValueValidation};
    use ledger_core::crypto::KeyPair;
    use std::collections::BTreeMap;
    use std::time::Duration;

    /// Driver that accepts everything not marked pending and records what
    /// the slot asks for
    #[derive(Default)]
    struct RecordingDriver {
        keys: BTreeMap<NodeId, KeyPair>,
        qsets: BTreeMap<Hash, QuorumSet>,
        emitted: Vec<Envelope>,
        externalized: Vec<(SlotIndex, CandidateValue)>,
        timers: BTreeMap<TimerKind, Duration>,
        pending: BTreeMap<CandidateValue, Option<CandidateValue>>,
    }

    impl SlotDriver for RecordingDriver {
        fn validate_value(&mut self, _: SlotIndex, value: &CandidateValue, _: bool) -> ValueValidation {
            if self.pending.contains_key(value) {
                ValueValidation::MaybeValid
            } else {
                ValueValidation::FullyValidated
            }
        }

        fn extract_valid_value(&mut self, _: SlotIndex, value: &CandidateValue) -> Option<CandidateValue> {
            self.pending.get(value).copied().flatten()
        }

        fn combine_candidates(
            &mut self,
            _: SlotIndex,
            candidates: &BTreeSet<CandidateValue>,
        ) -> Option<CandidateValue> {
            candidates.iter().next().copied()
        }

        fn quorum_set(&self, hash: &Hash) -> Option<QuorumSet> {
            self.qsets.get(hash).cloned()
        }

        fn sign_statement(&self, statement: Statement) -> Envelope {
            let kp = &self.keys[&statement.node_id];
            Envelope::sign(statement, kp)
        }

        fn emit_envelope(&mut self, envelope: &Envelope) {
            self.emitted.push(envelope.clone());
        }

        fn value_externalized(&mut self, slot: SlotIndex, value: &CandidateValue) {
            self.externalized.push((slot, *value));
        }

        fn setup_timer(&mut self, _: SlotIndex, kind: TimerKind, timeout: Duration) {
            self.timers.insert(kind, timeout);
        }

        fn stop_timer(&mut self, _: SlotIndex, kind: TimerKind) {
            self.timers.remove(&kind);
        }
    }

    fn value() -> CandidateValue {
        CandidateValue {
            tx_set_hash: [9u8; 32],
            close_time: 42,
        }
    }

    #[test]
    fn test_single_node_externalizes_own_value() {
        let kp = KeyPair::from_name("solo");
        let qset = QuorumSet::singleton(kp.identity());
        let local = LocalNode::new(kp.identity(), qset.clone());

        let mut driver = RecordingDriver::default();
        driver.qsets.insert(local.quorum_set_hash, qset);
        driver.keys.insert(kp.identity(), kp);

        let mut slot = Slot::new(2, local);
        assert_eq!(slot.phase(), SlotPhase::Nominating);
        slot.nominate(&mut driver, value(), &[1u8; 32]);

        assert_eq!(slot.phase(), SlotPhase::Externalized);
        assert_eq!(slot.externalized_value(), Some(value()));
        assert_eq!(driver.externalized, vec![(2, value())]);
        assert!(!slot.nomination().is_running());
        // no timers left armed after deciding
        assert!(driver.timers.is_empty());
        assert!(driver
            .emitted
            .iter()
            .any(|e| matches!(e.statement.pledges, Pledges::Externalize(_))));
    }

    /// Slot 7 seen from `n0` of three, after both peers accepted `peer_value`
    fn peers_accept(driver: &mut RecordingDriver, peer_value: CandidateValue) -> Slot {
        let keys: Vec<KeyPair> = (0..3).map(|i| KeyPair::from_name(&format!("n{}", i))).collect();
        let qset = QuorumSet::new(2, keys.iter().map(|k| k.identity()));
        let local = LocalNode::new(keys[0].identity(), qset.clone());
        driver.qsets.insert(local.quorum_set_hash, qset);
        for kp in &keys {
            driver.keys.insert(kp.identity(), kp.clone());
        }

        let mut slot = Slot::new(7, local.clone());
        slot.nominate(driver, value(), &[1u8; 32]);
        for kp in &keys[1..] {
            let statement = Statement {
                node_id: kp.identity(),
                slot_index: 7,
                quorum_set_hash: local.quorum_set_hash,
                pledges: Pledges::Nominate(Nomination {
                    votes: vec![peer_value],
                    accepted: vec![peer_value],
                }),
            };
            let state = slot.process_envelope(driver, &Envelope::sign(statement, kp));
            assert_ne!(state, EnvelopeState::Invalid);
        }
        slot
    }

    #[test]
    fn test_unvalidated_value_is_not_accepted() {
        let waiting = CandidateValue {
            tx_set_hash: [3u8; 32],
            close_time: 43,
        };
        let mut driver = RecordingDriver::default();
        driver.pending.insert(waiting, None);

        let slot = peers_accept(&mut driver, waiting);
        assert!(!slot.nomination().accepted().contains(&waiting));
        assert!(!slot.nomination().votes().contains(&waiting));
    }

    #[test]
    fn test_extracted_value_is_voted_for() {
        let waiting = CandidateValue {
            tx_set_hash: [3u8; 32],
            close_time: 43,
        };
        let substitute = CandidateValue {
            tx_set_hash: [4u8; 32],
            close_time: 43,
        };
        let mut driver = RecordingDriver::default();
        driver.pending.insert(waiting, Some(substitute));

        let slot = peers_accept(&mut driver, waiting);
        assert!(!slot.nomination().accepted().contains(&waiting));
        assert!(slot.nomination().votes().contains(&substitute));
        assert!(driver.emitted.iter().any(|e| matches!(
            &e.statement.pledges,
            Pledges::Nominate(n) if n.votes.contains(&substitute)
        )));
    }

    #[test]
    fn test_wrong_slot_envelope_is_invalid() {
        let kp = KeyPair::from_name("solo");
        let qset = QuorumSet::singleton(kp.identity());
        let local = LocalNode::new(kp.identity(), qset.clone());
        let mut driver = RecordingDriver::default();
        driver.qsets.insert(local.quorum_set_hash, qset);
        driver.keys.insert(kp.identity(), kp.clone());

        let statement = Statement {
            node_id: kp.identity(),
            slot_index: 3,
            quorum_set_hash: local.quorum_set_hash,
            pledges: Pledges::Externalize(Externalize {
                commit: Ballot::new(1, value()),
                n_h: 1,
            }),
        };
        let envelope = Envelope::sign(statement, &kp);
        let mut slot = Slot::new(2, local);
        assert_eq!(slot.process_envelope(&mut driver, &envelope), EnvelopeState::Invalid);
    }

    #[test]
    fn test_follows_externalize_from_quorum() {
        // 2 of 3: the other two externalizing is v-blocking for us, so we
        // accept and then confirm through our own statements
        let keys: Vec<KeyPair> = (0..3).map(|i| KeyPair::from_name(&format!("n{}", i))).collect();
        let qset = QuorumSet::new(2, keys.iter().map(|k| k.identity()));
        let local = LocalNode::new(keys[0].identity(), qset.clone());

        let mut driver = RecordingDriver::default();
        driver.qsets.insert(local.quorum_set_hash, qset);
        for kp in &keys {
            driver.keys.insert(kp.identity(), kp.clone());
        }

        let mut slot = Slot::new(5, local.clone());
        for kp in &keys[1..] {
            let statement = Statement {
                node_id: kp.identity(),
                slot_index: 5,
                quorum_set_hash: local.quorum_set_hash,
                pledges: Pledges::Externalize(Externalize {
                    commit: Ballot::new(1, value()),
                    n_h: 1,
                }),
            };
            let state = slot.process_envelope(&mut driver, &Envelope::sign(statement, kp));
            assert_ne!(state, EnvelopeState::Invalid);
        }

        assert_eq!(slot.externalized_value(), Some(value()));
        assert_eq!(driver.externalized.len(), 1);

        // a stale prepare from a peer is now rejected as incompatible or old
        let stale = Statement {
            node_id: keys[1].identity(),
            slot_index: 5,
            quorum_set_hash: local.quorum_set_hash,
            pledges: Pledges::Prepare(Prepare {
                ballot: Ballot::new(1, value()),
                prepared: None,
                prepared_prime: None,
                n_c: 0,
                n_h: 0,
            }),
        };
        assert_eq!(
            slot.process_envelope(&mut driver, &Envelope::sign(stale, &keys[1])),
            EnvelopeState::Invalid
        );
    }
}
