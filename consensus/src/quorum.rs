//! Quorum sets and federated-voting predicates.
//!
//! A [`QuorumSet`] is a threshold over members, each either a validator or a
//! nested set. A set of nodes `S` satisfies it when at least `threshold`
//! members are satisfied by `S`; a nested member counts only if it is itself
//! satisfied by the same `S`.

use crate::NodeId;
use ledger_core::Hash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Maximum nesting depth accepted from the network
pub const MAX_NESTING_DEPTH: usize = 4;

/// Maximum number of distinct validators in one quorum set
pub const MAX_QUORUM_NODES: usize = 1_000;

/// One entry of a quorum set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QuorumMember {
    /// A validator identity
    Validator(NodeId),
    /// A nested quorum set
    Inner(QuorumSet),
}

/// A validator's trust configuration
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuorumSet {
    /// Members that must be satisfied
    pub threshold: u32,
    /// Validators and nested sets
    pub members: Vec<QuorumMember>,
}

impl QuorumSet {
    /// Flat set of validators
    pub fn new(threshold: u32, validators: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            threshold,
            members: validators.into_iter().map(QuorumMember::Validator).collect(),
        }
    }

    /// Set that trusts only `node`
    pub fn singleton(node: NodeId) -> Self {
        Self::new(1, [node])
    }

    /// Add a nested set
    pub fn with_inner(mut self, inner: QuorumSet) -> Self {
        self.members.push(QuorumMember::Inner(inner));
        self
    }

    /// True if `nodes` satisfies this set's threshold
    pub fn is_quorum_slice(&self, nodes: &BTreeSet<NodeId>) -> bool {
        let mut remaining = self.threshold as usize;
        if remaining == 0 {
            return false;
        }
        for member in &self.members {
            let satisfied = match member {
                QuorumMember::Validator(id) => nodes.contains(id),
                QuorumMember::Inner(inner) => inner.is_quorum_slice(nodes),
            };
            if satisfied {
                remaining -= 1;
                if remaining == 0 {
                    return true;
                }
            }
        }
        false
    }

    /// True if `nodes` intersects every slice of this set, i.e. no slice
    /// can be formed without a member of `nodes`.
    pub fn is_v_blocking(&self, nodes: &BTreeSet<NodeId>) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let mut left_till_block = 1 + self.members.len() - (self.threshold as usize).min(self.members.len());
        for member in &self.members {
            let blocked = match member {
                QuorumMember::Validator(id) => nodes.contains(id),
                QuorumMember::Inner(inner) => inner.is_v_blocking(nodes),
            };
            if blocked {
                left_till_block -= 1;
                if left_till_block == 0 {
                    return true;
                }
            }
        }
        false
    }

    /// Every validator mentioned at any depth
    pub fn all_validators(&self) -> BTreeSet<NodeId> {
        let mut out = BTreeSet::new();
        self.collect_validators(&mut out);
        out
    }

    fn collect_validators(&self, out: &mut BTreeSet<NodeId>) {
        for member in &self.members {
            match member {
                QuorumMember::Validator(id) => {
                    out.insert(*id);
                }
                QuorumMember::Inner(inner) => inner.collect_validators(out),
            }
        }
    }

    /// Structural checks applied to every quorum set received or configured
    pub fn check_sanity(&self) -> std::result::Result<(), String> {
        let mut seen = BTreeSet::new();
        self.check_sanity_at(0, &mut seen)?;
        if seen.len() > MAX_QUORUM_NODES {
            return Err(format!("too many validators: {}", seen.len()));
        }
        Ok(())
    }

    fn check_sanity_at(&self, depth: usize, seen: &mut BTreeSet<NodeId>) -> std::result::Result<(), String> {
        if depth > MAX_NESTING_DEPTH {
            return Err("nesting too deep".to_string());
        }
        if self.threshold == 0 || self.threshold as usize > self.members.len() {
            return Err(format!(
                "threshold {} out of range for {} members",
                self.threshold,
                self.members.len()
            ));
        }
        for member in &self.members {
            match member {
                QuorumMember::Validator(id) => {
                    if !seen.insert(*id) {
                        return Err(format!("duplicate validator {}", id));
                    }
                }
                QuorumMember::Inner(inner) => inner.check_sanity_at(depth + 1, seen)?,
            }
        }
        Ok(())
    }

    /// Canonical hash; statements refer to quorum sets by this value
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.hash_into(&mut hasher);
        hasher.finalize().into()
    }

    fn hash_into(&self, hasher: &mut Sha256) {
        hasher.update(self.threshold.to_be_bytes());
        hasher.update((self.members.len() as u32).to_be_bytes());
        for member in &self.members {
            match member {
                QuorumMember::Validator(id) => {
                    hasher.update([0u8]);
                    hasher.update(id.as_bytes());
                }
                QuorumMember::Inner(inner) => {
                    hasher.update([1u8]);
                    inner.hash_into(hasher);
                }
            }
        }
    }

    /// Leader-selection weight of `node` in this set, as a fraction of
    /// `u64::MAX`: the product over nesting levels of threshold / members.
    pub fn node_weight(&self, node: &NodeId) -> u64 {
        let total = self.members.len() as u64;
        let threshold = self.threshold as u64;
        if total == 0 || threshold == 0 {
            return 0;
        }
        for member in &self.members {
            match member {
                QuorumMember::Validator(id) if id == node => {
                    return scale_weight(u64::MAX, threshold, total);
                }
                QuorumMember::Inner(inner) => {
                    let w = inner.node_weight(node);
                    if w > 0 {
                        return scale_weight(w, threshold, total);
                    }
                }
                QuorumMember::Validator(_) => {}
            }
        }
        0
    }
}

/// `ceil(m * threshold / total)` without overflow
fn scale_weight(m: u64, threshold: u64, total: u64) -> u64 {
    let numerator = (m as u128) * (threshold as u128);
    let denominator = total as u128;
    let res = numerator.div_ceil(denominator);
    res.min(u64::MAX as u128) as u64
}

/// Transitive quorum check from the local node's point of view.
///
/// Repeatedly drops nodes whose own quorum set (per `qset_of`) is not
/// satisfied by the remaining set, then checks the local set against what
/// is left.
pub fn is_quorum<F>(local: &QuorumSet, nodes: &BTreeSet<NodeId>, qset_of: F) -> bool
where
    F: Fn(&NodeId) -> Option<QuorumSet>,
{
    let mut remaining = nodes.clone();
    loop {
        let before = remaining.len();
        let kept: BTreeSet<NodeId> = remaining
            .iter()
            .filter(|n| qset_of(n).map_or(false, |q| q.is_quorum_slice(&remaining)))
            .copied()
            .collect();
        remaining = kept;
        if remaining.len() == before {
            break;
        }
    }
    local.is_quorum_slice(&remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::crypto::KeyPair;

    fn nodes(n: usize) -> Vec<NodeId> {
        (0..n)
            .map(|i| KeyPair::from_name(&format!("v{}", i)).identity())
            .collect()
    }

    fn set(ids: &[NodeId]) -> BTreeSet<NodeId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_flat_slice_and_v_blocking() {
        let v = nodes(4);
        let q = QuorumSet::new(3, v.clone());

        assert!(q.is_quorum_slice(&set(&v[..3])));
        assert!(!q.is_quorum_slice(&set(&v[..2])));

        // 4 members, threshold 3: any 2 block
        assert!(q.is_v_blocking(&set(&v[..2])));
        assert!(!q.is_v_blocking(&set(&v[..1])));
        assert!(!q.is_v_blocking(&BTreeSet::new()));
    }

    #[test]
    fn test_nested_members_count_only_when_satisfied() {
        let v = nodes(5);
        let inner = QuorumSet::new(2, v[2..5].to_vec());
        let q = QuorumSet::new(2, v[..2].to_vec()).with_inner(inner);

        // v0 plus a satisfied inner set
        assert!(q.is_quorum_slice(&set(&[v[0], v[2], v[3]])));
        // inner only has one of its three
        assert!(!q.is_quorum_slice(&set(&[v[0], v[2]])));
        // blocking the inner set needs 2 of its 3
        assert!(q.is_v_blocking(&set(&[v[0], v[1]])));
        assert!(q.is_v_blocking(&set(&[v[0], v[2], v[3]])));
        assert!(!q.is_v_blocking(&set(&[v[0], v[2]])));
    }

    #[test]
    fn test_is_quorum_prunes_unsatisfied_nodes() {
        let v = nodes(4);
        let all = QuorumSet::new(3, v.clone());
        // v3 only trusts a node outside the candidate set
        let outsider = KeyPair::from_name("outsider").identity();
        let picky = QuorumSet::new(1, [outsider]);

        let qset_of = |n: &NodeId| {
            if *n == v[3] {
                Some(picky.clone())
            } else {
                Some(all.clone())
            }
        };

        assert!(is_quorum(&all, &set(&v[..3]), qset_of));
        // v3 is pruned, leaving v0 and v1 which is below threshold
        assert!(!is_quorum(&all, &set(&[v[0], v[1], v[3]]), qset_of));
        // unknown quorum sets are pruned as well
        assert!(!is_quorum(&all, &set(&v[..3]), |_: &NodeId| None));
    }

    #[test]
    fn test_sanity() {
        let v = nodes(3);
        assert!(QuorumSet::new(2, v.clone()).check_sanity().is_ok());
        assert!(QuorumSet::new(0, v.clone()).check_sanity().is_err());
        assert!(QuorumSet::new(4, v.clone()).check_sanity().is_err());
        assert!(QuorumSet::new(1, vec![v[0], v[0]]).check_sanity().is_err());

        let mut deep = QuorumSet::new(1, [v[0]]);
        for i in 0..=MAX_NESTING_DEPTH {
            deep = QuorumSet::new(1, [KeyPair::from_name(&format!("d{}", i)).identity()])
                .with_inner(deep);
        }
        assert!(deep.check_sanity().is_err());
    }

    #[test]
    fn test_hash_is_structural() {
        let v = nodes(3);
        let a = QuorumSet::new(2, v.clone());
        let b = QuorumSet::new(2, v.clone());
        let c = QuorumSet::new(3, v.clone());
        assert_eq!(a.compute_hash(), b.compute_hash());
        assert_ne!(a.compute_hash(), c.compute_hash());
    }

    #[test]
    fn test_node_weight() {
        let v = nodes(4);
        let q = QuorumSet::new(2, v[..2].to_vec()).with_inner(QuorumSet::new(1, v[2..4].to_vec()));

        let top = q.node_weight(&v[0]);
        let nested = q.node_weight(&v[2]);
        assert!(top > nested);
        assert!(nested > 0);
        assert_eq!(q.node_weight(&KeyPair::from_name("x").identity()), 0);
        assert_eq!(
            QuorumSet::singleton(v[0]).node_weight(&v[0]),
            u64::MAX
        );
    }
}
