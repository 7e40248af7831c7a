//! Pending transactions waiting for a ledger.
//!
//! At most one transaction per source account. Every transaction in the
//! pool passed validation against the last closed ledger; after a close the
//! pool is revalidated and anything whose sequence number no longer lines
//! up is dropped.

use ledger_core::types::short_hex;
use ledger_core::{Hash, Identity, LedgerManager, SignedTransaction, TxRejection};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Pending transaction pool, keyed by source account
#[derive(Debug, Default)]
pub struct TxPool {
    by_source: BTreeMap<Identity, SignedTransaction>,
    by_hash: BTreeMap<Hash, Identity>,
}

impl TxPool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending transactions
    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    /// True if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }

    /// True if a transaction with `hash` is pending
    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Pending transaction from `source`
    pub fn get(&self, source: &Identity) -> Option<&SignedTransaction> {
        self.by_source.get(source)
    }

    /// Pending transactions in source order
    pub fn iter(&self) -> impl Iterator<Item = &SignedTransaction> {
        self.by_source.values()
    }

    /// Validate `tx` against the last closed ledger and add it.
    ///
    /// A transaction with the same source and sequence number as a pending
    /// one replaces it only if it pays a strictly higher fee per operation.
    /// The outer error is a storage failure; the inner one the rejection.
    pub fn try_add(
        &mut self,
        tx: SignedTransaction,
        ledger: &LedgerManager,
    ) -> ledger_core::Result<Result<(), TxRejection>> {
        let hash = tx.hash();
        if self.by_hash.contains_key(&hash) {
            return Ok(Err(TxRejection::Duplicate));
        }
        if let Err(rejection) = ledger.check_transaction(&tx)? {
            return Ok(Err(rejection));
        }

        let source = tx.tx.source;
        if let Some(existing) = self.by_source.get(&source) {
            if existing.tx.seq_num == tx.tx.seq_num && existing.fee_per_op() >= tx.fee_per_op() {
                return Ok(Err(TxRejection::Duplicate));
            }
            let replaced = existing.hash();
            self.by_hash.remove(&replaced);
            debug!(
                source = %source,
                old = %short_hex(&replaced),
                new = %short_hex(&hash),
                "Replacing pending transaction"
            );
        }

        trace!(source = %source, tx = %short_hex(&hash), seq = tx.tx.seq_num, "Transaction pending");
        self.by_hash.insert(hash, source);
        self.by_source.insert(source, tx);
        Ok(Ok(()))
    }

    /// Greedy proposal: highest fee per operation first, ties by hash
    pub fn select(&self, max: usize) -> Vec<SignedTransaction> {
        let mut ranked: Vec<(Reverse<i64>, Hash, &SignedTransaction)> = self
            .by_source
            .values()
            .map(|tx| (Reverse(tx.fee_per_op()), tx.hash(), tx))
            .collect();
        ranked.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        ranked
            .into_iter()
            .take(max)
            .map(|(_, _, tx)| tx.clone())
            .collect()
    }

    /// Drop transactions that no longer validate against the last closed
    /// ledger. Returns how many were dropped.
    pub fn revalidate(&mut self, ledger: &LedgerManager) -> ledger_core::Result<usize> {
        let mut stale = Vec::new();
        for (source, tx) in &self.by_source {
            if let Err(rejection) = ledger.check_transaction(tx)? {
                trace!(source = %source, tx = %short_hex(&tx.hash()), %rejection, "Dropping pending transaction");
                stale.push(*source);
            }
        }
        for source in &stale {
            if let Some(tx) = self.by_source.remove(source) {
                self.by_hash.remove(&tx.hash());
            }
        }
        Ok(stale.len())
    }
}
