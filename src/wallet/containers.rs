//! In-memory tables behind the wallet.
//!
//! Each table keeps the auxiliary indices its access patterns need:
//! records by insertion order and by key, spent outputs by three keys,
//! unlock jobs by height and by hash. Cross-index mutations happen
//! under the wallet's readiness latch, so every method here is plain
//! single-threaded code.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::crypto::keys::{PublicKey, SecretKey};
use crate::sync::{ContainerId, TransfersContainer};
use crate::wallet::{WalletTransaction, WalletTransfer};
use crate::Hash;

// ── Wallet records ──

/// One record per address. Balances are written only by the balance engine.
pub(crate) struct WalletRecord {
    pub spend_public_key: PublicKey,
    pub spend_secret_key: SecretKey,
    pub creation_timestamp: u64,
    pub container_id: ContainerId,
    pub container: Arc<dyn TransfersContainer>,
    pub actual_balance: u64,
    pub pending_balance: u64,
}

/// Address records in insertion order, with unique lookups by spend public
/// key and by container id. Index 0 is the designated change receiver.
#[derive(Default)]
pub(crate) struct WalletRecordTable {
    records: Vec<WalletRecord>,
    by_spend_key: HashMap<PublicKey, usize>,
    by_container: HashMap<ContainerId, usize>,
}

impl WalletRecordTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&WalletRecord> {
        self.records.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut WalletRecord> {
        self.records.get_mut(index)
    }

    pub fn index_by_spend_key(&self, key: &PublicKey) -> Option<usize> {
        self.by_spend_key.get(key).copied()
    }

    pub fn index_by_container(&self, id: ContainerId) -> Option<usize> {
        self.by_container.get(&id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WalletRecord> {
        self.records.iter()
    }

    pub fn push(&mut self, record: WalletRecord) -> usize {
        let index = self.records.len();
        self.by_spend_key.insert(record.spend_public_key, index);
        self.by_container.insert(record.container_id, index);
        self.records.push(record);
        index
    }

    /// Remove a record. Positions of later records shift down, so both
    /// lookup maps are rebuilt.
    pub fn remove_by_spend_key(&mut self, key: &PublicKey) -> Option<WalletRecord> {
        let index = self.by_spend_key.get(key).copied()?;
        let record = self.records.remove(index);
        self.by_spend_key.clear();
        self.by_container.clear();
        for (i, r) in self.records.iter().enumerate() {
            self.by_spend_key.insert(r.spend_public_key, i);
            self.by_container.insert(r.container_id, i);
        }
        Some(record)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.by_spend_key.clear();
        self.by_container.clear();
    }
}

// ── Transaction ledger ──

/// Append-only transaction list with a unique hash index.
#[derive(Default)]
pub(crate) struct TransactionLedger {
    transactions: Vec<WalletTransaction>,
    by_hash: HashMap<Hash, usize>,
}

impl TransactionLedger {
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn get(&self, id: usize) -> Option<&WalletTransaction> {
        self.transactions.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut WalletTransaction> {
        self.transactions.get_mut(id)
    }

    pub fn id_by_hash(&self, hash: &Hash) -> Option<usize> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains_hash(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn push(&mut self, transaction: WalletTransaction) -> usize {
        let id = self.transactions.len();
        self.by_hash.insert(transaction.hash, id);
        self.transactions.push(transaction);
        id
    }

    pub fn iter(&self) -> impl Iterator<Item = &WalletTransaction> {
        self.transactions.iter()
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
        self.by_hash.clear();
    }
}

// ── Transfers ──

/// `(tx id, transfer)` pairs kept sorted by tx id; insertion order is
/// preserved within one id.
#[derive(Default)]
pub(crate) struct TransferList {
    entries: Vec<(usize, WalletTransfer)>,
}

impl TransferList {
    /// Append a transfer for the newest transaction. Ids are monotonically
    /// increasing at the call sites, so a plain push keeps the order.
    pub fn push_back(&mut self, transaction_id: usize, transfer: WalletTransfer) {
        debug_assert!(self.entries.last().is_none_or(|(id, _)| *id <= transaction_id));
        self.entries.push((transaction_id, transfer));
    }

    /// Insert a transfer for an arbitrary id, after any existing entries
    /// with the same id.
    pub fn insert(&mut self, transaction_id: usize, transfer: WalletTransfer) {
        let at = self.entries.partition_point(|(id, _)| *id <= transaction_id);
        self.entries.insert(at, (transaction_id, transfer));
    }

    /// All transfers of one transaction, in insertion order.
    pub fn equal_range(&self, transaction_id: usize) -> &[(usize, WalletTransfer)] {
        let start = self.entries.partition_point(|(id, _)| *id < transaction_id);
        let end = self.entries.partition_point(|(id, _)| *id <= transaction_id);
        &self.entries[start..end]
    }

    pub fn iter(&self) -> impl Iterator<Item = &(usize, WalletTransfer)> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ── Spent outputs ──

/// An output reserved by an in-flight local transaction.
#[derive(Clone, Debug)]
pub(crate) struct SpentOutput {
    pub amount: u64,
    pub transaction_hash: Hash,
    pub output_in_transaction: u32,
    /// Spend public key of the owning wallet record.
    pub wallet: PublicKey,
    pub spending_transaction_hash: Hash,
}

type OutPoint = (Hash, u32);

/// Reservations indexed by source out-point (unique), by owning wallet, and
/// by spending transaction hash.
#[derive(Default)]
pub(crate) struct SpentOutputSet {
    by_output: HashMap<OutPoint, SpentOutput>,
    by_wallet: HashMap<PublicKey, HashSet<OutPoint>>,
    by_spending_tx: HashMap<Hash, HashSet<OutPoint>>,
}

impl SpentOutputSet {
    pub fn len(&self) -> usize {
        self.by_output.len()
    }

    pub fn contains(&self, transaction_hash: &Hash, output_in_transaction: u32) -> bool {
        self.by_output
            .contains_key(&(*transaction_hash, output_in_transaction))
    }

    pub fn insert(&mut self, output: SpentOutput) {
        let key = (output.transaction_hash, output.output_in_transaction);
        if self.by_output.contains_key(&key) {
            // out-point uniqueness: an output can back at most one reservation
            return;
        }
        self.by_wallet.entry(output.wallet).or_default().insert(key);
        self.by_spending_tx
            .entry(output.spending_transaction_hash)
            .or_default()
            .insert(key);
        self.by_output.insert(key, output);
    }

    pub fn remove_by_spending_tx(&mut self, spending_transaction_hash: &Hash) {
        let Some(keys) = self.by_spending_tx.remove(spending_transaction_hash) else {
            return;
        };
        for key in keys {
            if let Some(output) = self.by_output.remove(&key) {
                Self::unlink(&mut self.by_wallet, &output.wallet, &key);
            }
        }
    }

    pub fn remove_by_wallet(&mut self, wallet: &PublicKey) {
        let Some(keys) = self.by_wallet.remove(wallet) else {
            return;
        };
        for key in keys {
            if let Some(output) = self.by_output.remove(&key) {
                Self::unlink(
                    &mut self.by_spending_tx,
                    &output.spending_transaction_hash,
                    &key,
                );
            }
        }
    }

    /// Total amount reserved from one wallet's outputs.
    pub fn wallet_spent_amount(&self, wallet: &PublicKey) -> u64 {
        self.by_wallet
            .get(wallet)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| self.by_output.get(key))
                    .map(|output| output.amount)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpentOutput> {
        self.by_output.values()
    }

    pub fn clear(&mut self) {
        self.by_output.clear();
        self.by_wallet.clear();
        self.by_spending_tx.clear();
    }

    fn unlink<K: std::hash::Hash + Eq>(
        index: &mut HashMap<K, HashSet<OutPoint>>,
        key: &K,
        point: &OutPoint,
    ) {
        if let Some(points) = index.get_mut(key) {
            points.remove(point);
            if points.is_empty() {
                index.remove(key);
            }
        }
    }
}

// ── Unlock schedule ──

/// A maturation check queued for a future height.
#[derive(Clone, Debug)]
pub(crate) struct UnlockJob {
    pub block_height: u32,
    pub container_id: ContainerId,
    pub transaction_hash: Hash,
}

/// Jobs ordered by height, unique per source transaction hash.
#[derive(Default)]
pub(crate) struct UnlockSchedule {
    by_height: BTreeMap<u32, Vec<UnlockJob>>,
    by_hash: HashMap<Hash, u32>,
}

impl UnlockSchedule {
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn contains_hash(&self, transaction_hash: &Hash) -> bool {
        self.by_hash.contains_key(transaction_hash)
    }

    pub fn insert(&mut self, job: UnlockJob) {
        if self.by_hash.contains_key(&job.transaction_hash) {
            return;
        }
        self.by_hash.insert(job.transaction_hash, job.block_height);
        self.by_height.entry(job.block_height).or_default().push(job);
    }

    pub fn remove_by_hash(&mut self, transaction_hash: &Hash) {
        let Some(height) = self.by_hash.remove(transaction_hash) else {
            return;
        };
        if let Some(jobs) = self.by_height.get_mut(&height) {
            jobs.retain(|job| job.transaction_hash != *transaction_hash);
            if jobs.is_empty() {
                self.by_height.remove(&height);
            }
        }
    }

    /// Remove and return every job scheduled at or below `height`, in
    /// height order.
    pub fn drain_up_to(&mut self, height: u32) -> Vec<UnlockJob> {
        let heights: Vec<u32> = self
            .by_height
            .range(..=height)
            .map(|(h, _)| *h)
            .collect();
        let mut drained = Vec::new();
        for h in heights {
            if let Some(jobs) = self.by_height.remove(&h) {
                for job in &jobs {
                    self.by_hash.remove(&job.transaction_hash);
                }
                drained.extend(jobs);
            }
        }
        drained
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnlockJob> {
        self.by_height.values().flatten()
    }

    pub fn clear(&mut self) {
        self.by_height.clear();
        self.by_hash.clear();
    }
}
