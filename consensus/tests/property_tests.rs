//! Property-based tests for federated voting predicates
//!
//! These tests use proptest to verify:
//! - Slices are monotone: adding nodes never breaks a slice
//! - V-blocking duality: S blocks every slice iff the rest is no slice
//! - The full validator set satisfies any sane quorum set
//! - Round timeouts grow monotonically and respect their cap

use consensus::quorum::{QuorumMember, QuorumSet};
use consensus::scp::backoff;
use consensus::NodeId;
use ledger_core::crypto::KeyPair;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;

const MAX_VALIDATORS: usize = 24;

fn validators() -> Vec<NodeId> {
    (0..MAX_VALIDATORS)
        .map(|i| KeyPair::from_name(&format!("prop-validator-{}", i)).identity())
        .collect()
}

/// Shape of a two-level quorum set: (top-level validator count, inner set
/// sizes, threshold picks as fractions)
#[derive(Debug, Clone)]
struct Shape {
    top: usize,
    inner: Vec<usize>,
    top_pick: u32,
    inner_picks: Vec<u32>,
}

fn shape_strategy() -> impl Strategy<Value = Shape> {
    (0usize..6, prop::collection::vec(1usize..5, 0..3), any::<u32>(), prop::collection::vec(any::<u32>(), 3))
        .prop_filter("needs at least one member", |(top, inner, _, _)| top + inner.len() > 0)
        .prop_map(|(top, inner, top_pick, inner_picks)| Shape {
            top,
            inner,
            top_pick,
            inner_picks,
        })
}

/// Threshold in 1..=members chosen by `pick`
fn threshold(pick: u32, members: usize) -> u32 {
    (pick % members as u32) + 1
}

/// Build a sane quorum set; every validator appears once
fn build(shape: &Shape, ids: &[NodeId]) -> QuorumSet {
    let mut next = 0;
    let mut members = Vec::new();
    for _ in 0..shape.top {
        members.push(QuorumMember::Validator(ids[next]));
        next += 1;
    }
    for (i, size) in shape.inner.iter().enumerate() {
        let inner: Vec<NodeId> = ids[next..next + size].to_vec();
        next += size;
        members.push(QuorumMember::Inner(QuorumSet::new(
            threshold(shape.inner_picks[i], *size),
            inner,
        )));
    }
    let count = members.len();
    QuorumSet {
        threshold: threshold(shape.top_pick, count),
        members,
    }
}

fn subset(all: &BTreeSet<NodeId>, mask: u32) -> BTreeSet<NodeId> {
    all.iter()
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(_, id)| *id)
        .collect()
}

proptest! {
    #[test]
    fn test_generated_sets_are_sane(shape in shape_strategy()) {
        let qset = build(&shape, &validators());
        prop_assert!(qset.check_sanity().is_ok());
    }

    #[test]
    fn test_slices_are_monotone(shape in shape_strategy(), a in any::<u32>(), b in any::<u32>()) {
        let qset = build(&shape, &validators());
        let all = qset.all_validators();
        let s = subset(&all, a);
        let bigger: BTreeSet<NodeId> = s.union(&subset(&all, b)).copied().collect();

        if qset.is_quorum_slice(&s) {
            prop_assert!(qset.is_quorum_slice(&bigger));
        }
        if qset.is_v_blocking(&s) {
            prop_assert!(qset.is_v_blocking(&bigger));
        }
    }

    #[test]
    fn test_v_blocking_is_dual_to_slice(shape in shape_strategy(), mask in any::<u32>()) {
        let qset = build(&shape, &validators());
        let all = qset.all_validators();
        let s = subset(&all, mask);
        let rest: BTreeSet<NodeId> = all.difference(&s).copied().collect();

        prop_assert_eq!(qset.is_v_blocking(&s), !qset.is_quorum_slice(&rest));
    }

    #[test]
    fn test_everyone_satisfies_a_sane_set(shape in shape_strategy()) {
        let qset = build(&shape, &validators());
        let all = qset.all_validators();
        prop_assert!(qset.is_quorum_slice(&all));
        prop_assert!(!qset.is_v_blocking(&BTreeSet::new()));
        prop_assert!(qset.is_v_blocking(&all));
    }

    #[test]
    fn test_backoff_is_monotone_and_capped(base_ms in 1u64..5_000, max_ms in 1u64..3_600_000, round in 1u32..64) {
        let base = Duration::from_millis(base_ms);
        let max = Duration::from_millis(max_ms);
        let now = backoff(base, max, round);
        let next = backoff(base, max, round + 1);

        prop_assert!(now <= max);
        prop_assert!(next >= now);
        if round == 1 {
            prop_assert_eq!(now, base.min(max));
        }
    }
}
