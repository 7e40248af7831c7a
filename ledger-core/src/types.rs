//! Core types for the ledger
//!
//! All hashes are computed over fixed big-endian field encodings so that
//! every node derives bit-identical digests for identical content.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 32-byte SHA-256 digest
pub type Hash = [u8; 32];

/// All-zero hash, used as the previous hash of the genesis ledger
pub const ZERO_HASH: Hash = [0u8; 32];

/// Short hex rendering of a hash for logs
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..4])
}

/// Public key identifying a validator or an account
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity(pub [u8; 32]);

impl Identity {
    /// Create from raw public key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw public key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| crate::Error::Config(format!("Invalid identity hex: {}", e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| crate::Error::Config("Identity must be 32 bytes".to_string()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self)
    }
}

/// Ed25519 signature (64 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "serde_bytes")]
    bytes: [u8; 64],
}

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// Verify this signature over `message` against `signer`
    pub fn verify(&self, message: &[u8], signer: &Identity) -> bool {
        crate::crypto::verify_signature(message, self, signer)
    }
}

/// Persisted per-account state. An account exists iff a record is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Account identity
    pub id: Identity,
    /// Balance in the smallest unit
    pub balance: i64,
    /// Sequence number of the last applied transaction
    pub seq_num: u64,
    /// Number of sub-entries raising the minimum reserve
    pub num_sub_entries: u32,
}

impl AccountRecord {
    /// A freshly created account
    pub fn new(id: Identity, balance: i64) -> Self {
        Self {
            id,
            balance,
            seq_num: 0,
            num_sub_entries: 0,
        }
    }

    /// Content hash, used for the ledger delta root
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.balance.to_be_bytes());
        hasher.update(self.seq_num.to_be_bytes());
        hasher.update(self.num_sub_entries.to_be_bytes());
        hasher.finalize().into()
    }
}

/// A single operation inside a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Move `amount` from the source to `destination`, creating the
    /// destination if it does not exist and `amount` covers its reserve.
    Payment {
        /// Receiving account
        destination: Identity,
        /// Amount in the smallest unit
        amount: i64,
    },
}

impl Operation {
    fn hash_into(&self, hasher: &mut Sha256) {
        match self {
            Operation::Payment {
                destination,
                amount,
            } => {
                hasher.update([0u8]);
                hasher.update(destination.as_bytes());
                hasher.update(amount.to_be_bytes());
            }
        }
    }
}

/// Unsigned transaction body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Source account, pays the fee
    pub source: Identity,
    /// Must equal the source account's sequence number plus one
    pub seq_num: u64,
    /// Fee offered, in the smallest unit
    pub fee: i64,
    /// Operations executed in order
    pub operations: Vec<Operation>,
}

impl Transaction {
    /// Single-payment transaction
    pub fn payment(source: Identity, seq_num: u64, fee: i64, destination: Identity, amount: i64) -> Self {
        Self {
            source,
            seq_num,
            fee,
            operations: vec![Operation::Payment {
                destination,
                amount,
            }],
        }
    }

    /// Transaction hash; the message covered by the signature
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        hasher.update(self.seq_num.to_be_bytes());
        hasher.update(self.fee.to_be_bytes());
        hasher.update((self.operations.len() as u32).to_be_bytes());
        for op in &self.operations {
            op.hash_into(&mut hasher);
        }
        hasher.finalize().into()
    }

    /// Minimum fee for this transaction under `base_fee`
    pub fn min_fee(&self, base_fee: i64) -> i64 {
        base_fee.saturating_mul(self.operations.len().max(1) as i64)
    }

    /// Sign with the source account's key
    pub fn sign(self, keypair: &crate::crypto::KeyPair) -> SignedTransaction {
        let signature = keypair.sign(&self.compute_hash());
        SignedTransaction {
            tx: self,
            signature,
        }
    }
}

/// Transaction plus the source account's signature over its hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// Transaction body
    pub tx: Transaction,
    /// Signature over `tx.compute_hash()`
    pub signature: Signature,
}

impl SignedTransaction {
    /// Hash of the body (the signature is not part of the identity)
    pub fn hash(&self) -> Hash {
        self.tx.compute_hash()
    }

    /// Hash of body and signature; what a transaction set commits to
    pub fn full_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.hash());
        hasher.update(self.signature.as_bytes());
        hasher.finalize().into()
    }

    /// Check the signature against the source account
    pub fn verify_signature(&self) -> bool {
        self.signature.verify(&self.hash(), &self.tx.source)
    }

    /// Fee offered per operation
    pub fn fee_per_op(&self) -> i64 {
        self.tx.fee / self.tx.operations.len().max(1) as i64
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Transactions agreed for one slot, kept in canonical (hash) order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSet {
    /// Hash of the ledger this set applies on top of
    pub previous_ledger_hash: Hash,
    /// Transactions sorted by hash, no duplicates
    transactions: Vec<SignedTransaction>,
}

impl TransactionSet {
    /// Build a set, sorting into canonical order and dropping duplicates
    pub fn new(previous_ledger_hash: Hash, transactions: Vec<SignedTransaction>) -> Self {
        let mut keyed: Vec<(Hash, SignedTransaction)> =
            transactions.into_iter().map(|tx| (tx.hash(), tx)).collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.dedup_by(|a, b| a.0 == b.0);
        Self {
            previous_ledger_hash,
            transactions: keyed.into_iter().map(|(_, tx)| tx).collect(),
        }
    }

    /// Empty set on top of `previous_ledger_hash`
    pub fn empty(previous_ledger_hash: Hash) -> Self {
        Self {
            previous_ledger_hash,
            transactions: Vec::new(),
        }
    }

    /// Transactions in canonical order
    pub fn transactions(&self) -> &[SignedTransaction] {
        &self.transactions
    }

    /// Number of transactions
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// True if the set holds no transactions
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Total number of operations across all transactions
    pub fn operation_count(&self) -> usize {
        self.transactions.iter().map(|t| t.tx.operations.len()).sum()
    }

    /// True if transactions are strictly increasing by hash
    pub fn is_canonical(&self) -> bool {
        self.transactions
            .windows(2)
            .all(|w| w[0].hash() < w[1].hash())
    }

    /// Canonical order and a valid signature on every transaction
    pub fn is_well_formed(&self) -> bool {
        self.is_canonical() && self.transactions.iter().all(SignedTransaction::verify_signature)
    }

    /// Set hash, covering the previous ledger and every transaction with
    /// its signature
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.previous_ledger_hash);
        for tx in &self.transactions {
            hasher.update(tx.full_hash());
        }
        hasher.finalize().into()
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire; the result is re-canonicalized
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let set: TransactionSet = bincode::deserialize(bytes)?;
        Ok(Self::new(set.previous_ledger_hash, set.transactions))
    }
}

/// Why a transaction was not applied at all (no fee, no sequence bump)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxRejection {
    /// Signature does not verify against the source
    BadSignature,
    /// Sequence number is not the account's next
    BadSequence {
        /// Sequence number the account expects
        expected: u64,
        /// Sequence number carried by the transaction
        actual: u64,
    },
    /// Fee below the minimum
    InsufficientFee {
        /// Minimum fee
        min: i64,
        /// Offered fee
        actual: i64,
    },
    /// Source cannot pay the fee and stay above its reserve
    InsufficientBalance,
    /// Source account does not exist
    NoAccount,
    /// No operations, or a non-positive amount
    Malformed,
    /// Same source and sequence already pending or applied
    Duplicate,
}

impl fmt::Display for TxRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxRejection::BadSignature => write!(f, "bad signature"),
            TxRejection::BadSequence { expected, actual } => {
                write!(f, "bad sequence: expected {}, got {}", expected, actual)
            }
            TxRejection::InsufficientFee { min, actual } => {
                write!(f, "insufficient fee: min {}, got {}", min, actual)
            }
            TxRejection::InsufficientBalance => write!(f, "insufficient balance"),
            TxRejection::NoAccount => write!(f, "no source account"),
            TxRejection::Malformed => write!(f, "malformed"),
            TxRejection::Duplicate => write!(f, "duplicate"),
        }
    }
}

/// Why an operation failed after the fee was charged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpFailure {
    /// Source balance would drop below its reserve
    Underfunded,
    /// Payment to a missing account does not cover its reserve
    NoDestination,
    /// Destination balance would overflow
    LineFull,
}

/// Outcome of one transaction in an apply pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutcome {
    /// All operations applied
    Success,
    /// Fee and sequence consumed, operations rolled back
    Failed(OpFailure),
    /// Left no trace in account state
    NotApplied(TxRejection),
}

impl TxOutcome {
    fn code(&self) -> u8 {
        match self {
            TxOutcome::Success => 0,
            TxOutcome::Failed(OpFailure::Underfunded) => 1,
            TxOutcome::Failed(OpFailure::NoDestination) => 2,
            TxOutcome::Failed(OpFailure::LineFull) => 3,
            TxOutcome::NotApplied(_) => 255,
        }
    }
}

/// Result of one transaction in an apply pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    /// Transaction hash
    pub tx_hash: Hash,
    /// Fee charged (zero when not applied)
    pub fee_charged: i64,
    /// Outcome
    pub outcome: TxOutcome,
}

impl TransactionResult {
    /// True if the transaction consumed its sequence number
    pub fn is_applied(&self) -> bool {
        !matches!(self.outcome, TxOutcome::NotApplied(_))
    }
}

/// Hash over the ordered results of an apply pass
pub fn results_hash(results: &[TransactionResult]) -> Hash {
    let mut hasher = Sha256::new();
    for r in results {
        hasher.update(r.tx_hash);
        hasher.update(r.fee_charged.to_be_bytes());
        hasher.update([r.outcome.code()]);
    }
    hasher.finalize().into()
}

/// Externalized summary of one slot after apply; forms a hash chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeader {
    /// Ledger sequence (the slot index it closed)
    pub seq: u64,
    /// Hash of the previous header
    pub previous_ledger_hash: Hash,
    /// Agreed close time (unix seconds)
    pub close_time: u64,
    /// Hash of the applied transaction set
    pub tx_set_hash: Hash,
    /// Hash of the per-transaction results
    pub tx_result_hash: Hash,
    /// Merkle root over every account written by this ledger
    pub delta_root: Hash,
    /// Total coins in existence
    pub total_coins: i64,
    /// Fees collected so far
    pub fee_pool: i64,
    /// Base fee per operation
    pub base_fee: i64,
    /// Base reserve per entry
    pub base_reserve: i64,
}

impl LedgerHeader {
    /// Header hash; the next ledger's `previous_ledger_hash`
    pub fn compute_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.seq.to_be_bytes());
        hasher.update(self.previous_ledger_hash);
        hasher.update(self.close_time.to_be_bytes());
        hasher.update(self.tx_set_hash);
        hasher.update(self.tx_result_hash);
        hasher.update(self.delta_root);
        hasher.update(self.total_coins.to_be_bytes());
        hasher.update(self.fee_pool.to_be_bytes());
        hasher.update(self.base_fee.to_be_bytes());
        hasher.update(self.base_reserve.to_be_bytes());
        hasher.finalize().into()
    }

    /// Minimum balance for an account with `num_sub_entries`
    pub fn min_balance(&self, num_sub_entries: u32) -> i64 {
        min_balance(self.base_reserve, num_sub_entries)
    }
}

/// `(2 + num_sub_entries) * base_reserve`
pub fn min_balance(base_reserve: i64, num_sub_entries: u32) -> i64 {
    (2 + num_sub_entries as i64).saturating_mul(base_reserve)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn signed(name: &str, seq: u64) -> SignedTransaction {
        let kp = KeyPair::from_name(name);
        Transaction::payment(kp.identity(), seq, 10, KeyPair::from_name("dest").identity(), 5)
            .sign(&kp)
    }

    #[test]
    fn test_identity_hex_round_trip() {
        let id = KeyPair::from_name("alice").identity();
        assert_eq!(Identity::from_hex(&id.to_hex()).unwrap(), id);
        assert!(Identity::from_hex("abcd").is_err());
        assert_eq!(id.to_string().len(), 8);
    }

    #[test]
    fn test_signed_transaction_verifies() {
        let tx = signed("alice", 1);
        assert!(tx.verify_signature());

        let mut forged = tx.clone();
        forged.tx.fee = 1_000;
        assert!(!forged.verify_signature());
    }

    #[test]
    fn test_transaction_set_is_canonical() {
        let txs: Vec<_> = ["a", "b", "c", "d"].iter().map(|n| signed(n, 1)).collect();
        let mut reversed = txs.clone();
        reversed.reverse();
        reversed.push(txs[0].clone());

        let s1 = TransactionSet::new(ZERO_HASH, txs);
        let s2 = TransactionSet::new(ZERO_HASH, reversed);
        assert_eq!(s1.len(), 4);
        assert!(s1.is_canonical());
        assert_eq!(s1.compute_hash(), s2.compute_hash());
    }

    #[test]
    fn test_transaction_set_hash_binds_previous_ledger() {
        let a = TransactionSet::new(ZERO_HASH, vec![signed("a", 1)]);
        let b = TransactionSet::new([1u8; 32], vec![signed("a", 1)]);
        assert_ne!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn test_transaction_set_hash_binds_signatures() {
        let honest = signed("alice", 1);
        let mut forged = honest.clone();
        forged.signature = KeyPair::from_name("mallory").sign(&forged.hash());

        let a = TransactionSet::new(ZERO_HASH, vec![honest.clone()]);
        let b = TransactionSet::new(ZERO_HASH, vec![forged.clone()]);
        assert_eq!(honest.hash(), forged.hash());
        assert_ne!(a.compute_hash(), b.compute_hash());
        assert!(a.is_well_formed());
        assert!(!b.is_well_formed());
    }

    #[test]
    fn test_wire_decoded_set_keeps_its_order() {
        let mut txs: Vec<_> = ["a", "b"].iter().map(|n| signed(n, 1)).collect();
        txs.sort_by_key(|t| std::cmp::Reverse(t.hash()));
        let bytes = bincode::serialize(&(ZERO_HASH, txs)).unwrap();

        let raw: TransactionSet = bincode::deserialize(&bytes).unwrap();
        assert!(!raw.is_canonical());
        assert!(!raw.is_well_formed());

        let repaired = TransactionSet::from_bytes(&bytes).unwrap();
        assert!(repaired.is_well_formed());
        assert_ne!(raw.compute_hash(), repaired.compute_hash());
    }

    #[test]
    fn test_min_balance() {
        assert_eq!(min_balance(10, 0), 20);
        assert_eq!(min_balance(10, 3), 50);
    }

    #[test]
    fn test_min_fee_scales_with_operations() {
        let mut tx = signed("a", 1).tx;
        assert_eq!(tx.min_fee(10), 10);
        tx.operations.push(tx.operations[0].clone());
        assert_eq!(tx.min_fee(10), 20);
    }
}
