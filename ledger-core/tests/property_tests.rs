//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Conservation: Σ(balances) + fee_pool == total_coins
//! - Reserve: every account holds at least its minimum balance
//! - Sequence monotonicity: +1 per applied transaction, never skips
//! - Deterministic apply: same inputs → same header hash

use ledger_core::{
    crypto::KeyPair, storage::InMemoryStore, LedgerManager, LedgerParams, SignedTransaction,
    Transaction, TransactionSet,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

const RESERVE: i64 = 1_000;
const FEE: i64 = 10;
const TOTAL: i64 = 10_000_000;

fn params() -> LedgerParams {
    LedgerParams {
        base_fee: FEE,
        base_reserve: RESERVE,
        max_tx_set_size: 1_000,
        total_coins: TOTAL,
    }
}

fn keys() -> Vec<KeyPair> {
    let mut keys = vec![KeyPair::from_name("root")];
    keys.extend((0..5).map(|i| KeyPair::from_name(&format!("account-{}", i))));
    keys
}

/// A payment intent: (from index, to index, amount, sequence skew)
#[derive(Debug, Clone)]
struct Intent {
    from: usize,
    to: usize,
    amount: i64,
    skew: i8,
}

fn intent_strategy() -> impl Strategy<Value = Intent> {
    (
        0usize..6,
        0usize..6,
        1i64..2_000_000,
        prop_oneof![8 => Just(0i8), 1 => Just(1i8), 1 => Just(-1i8)],
    )
        .prop_map(|(from, to, amount, skew)| Intent {
            from,
            to,
            amount,
            skew,
        })
}

fn ledgers_strategy() -> impl Strategy<Value = Vec<Vec<Intent>>> {
    prop::collection::vec(prop::collection::vec(intent_strategy(), 0..12), 1..8)
}

fn create_test_ledger() -> LedgerManager {
    LedgerManager::genesis(
        Box::new(InMemoryStore::new()),
        params(),
        KeyPair::from_name("root").identity(),
        0,
    )
    .unwrap()
}

/// Turn intents into signed transactions against the current state. Each
/// source gets consecutive sequence numbers within one ledger.
fn build_set(ledger: &LedgerManager, keys: &[KeyPair], intents: &[Intent]) -> TransactionSet {
    let mut next: BTreeMap<usize, u64> = BTreeMap::new();
    let mut txs: Vec<SignedTransaction> = Vec::new();
    for intent in intents {
        let from = &keys[intent.from];
        let base = ledger
            .load_account(&from.identity())
            .unwrap()
            .map_or(0, |a| a.seq_num);
        let seq = next.entry(intent.from).or_insert(base + 1);
        let tx_seq = (*seq as i64 + intent.skew as i64).max(0) as u64;
        *seq += 1;
        txs.push(
            Transaction::payment(
                from.identity(),
                tx_seq,
                FEE,
                keys[intent.to].identity(),
                intent.amount,
            )
            .sign(from),
        );
    }
    TransactionSet::new(ledger.last_closed_hash(), txs)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: coins are conserved and reserves hold after every ledger
    #[test]
    fn prop_conservation_and_reserve(ledgers in ledgers_strategy()) {
        let keys = keys();
        let mut ledger = create_test_ledger();

        for (i, intents) in ledgers.iter().enumerate() {
            let set = build_set(&ledger, &keys, intents);
            let result = ledger.close_ledger(&set, (i as u64 + 1) * 5).unwrap();

            let accounts = ledger.accounts().unwrap();
            let sum: i64 = accounts.iter().map(|a| a.balance).sum();
            prop_assert_eq!(sum + ledger.last_closed().fee_pool, TOTAL);

            for account in &accounts {
                prop_assert!(account.balance >= ledger.min_balance(account.num_sub_entries));
            }

            // fees are charged exactly once per applied transaction
            let applied = result.applied_count() as i64;
            prop_assert_eq!(result.fees_charged(), applied * FEE);
        }
    }

    /// Property: sequence numbers advance by exactly one per applied transaction
    #[test]
    fn prop_sequence_monotonicity(ledgers in ledgers_strategy()) {
        let keys = keys();
        let mut ledger = create_test_ledger();

        for (i, intents) in ledgers.iter().enumerate() {
            let before: BTreeMap<_, _> = ledger
                .accounts()
                .unwrap()
                .into_iter()
                .map(|a| (a.id, a.seq_num))
                .collect();

            let set = build_set(&ledger, &keys, intents);
            let result = ledger.close_ledger(&set, (i as u64 + 1) * 5).unwrap();

            let mut applied_per_source: BTreeMap<_, u64> = BTreeMap::new();
            for (tx, r) in set.transactions().iter().zip(&result.results) {
                prop_assert_eq!(tx.hash(), r.tx_hash);
                if r.is_applied() {
                    *applied_per_source.entry(tx.tx.source).or_default() += 1;
                }
            }

            for account in ledger.accounts().unwrap() {
                let old = before.get(&account.id).copied().unwrap_or(0);
                let bumps = applied_per_source.get(&account.id).copied().unwrap_or(0);
                prop_assert_eq!(account.seq_num, old + bumps);
            }
        }
    }

    /// Property: two replicas fed the same sets produce identical headers
    #[test]
    fn prop_deterministic_apply(ledgers in ledgers_strategy()) {
        let keys = keys();
        let mut a = create_test_ledger();
        let mut b = create_test_ledger();

        for (i, intents) in ledgers.iter().enumerate() {
            let set = build_set(&a, &keys, intents);
            let reordered = TransactionSet::new(
                set.previous_ledger_hash,
                set.transactions().iter().rev().cloned().collect(),
            );
            let close_time = (i as u64 + 1) * 5;
            let ra = a.close_ledger(&set, close_time).unwrap();
            let rb = b.close_ledger(&reordered, close_time).unwrap();
            prop_assert_eq!(ra.header_hash, rb.header_hash);
            prop_assert_eq!(ra.results, rb.results);
        }
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use ledger_core::{storage::RocksStore, Config};

    #[test]
    fn test_restart_resumes_chain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            params: params(),
            ..Default::default()
        };
        let keys = keys();
        let root = KeyPair::from_name("root");

        let last_hash = {
            let store = RocksStore::open(&config).unwrap();
            let mut ledger =
                LedgerManager::genesis(Box::new(store), params(), root.identity(), 0).unwrap();
            let intents = vec![Intent {
                from: 0,
                to: 1,
                amount: 50_000,
                skew: 0,
            }];
            let set = build_set(&ledger, &keys, &intents);
            ledger.close_ledger(&set, 5).unwrap();
            ledger.last_closed_hash()
        };

        let store = RocksStore::open(&config).unwrap();
        let ledger = LedgerManager::open(Box::new(store), params()).unwrap();
        assert_eq!(ledger.next_seq(), 3);
        assert_eq!(ledger.last_closed_hash(), last_hash);
        assert_eq!(
            ledger
                .load_account(&keys[1].identity())
                .unwrap()
                .unwrap()
                .balance,
            50_000
        );
        assert!(ledger.header(1).unwrap().is_some());
    }
}
