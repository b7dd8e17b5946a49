//! Blockchain synchronizer seam.
//!
//! The synchronizer owns the chain-scanning machinery. The wallet registers
//! one subscription per address; each subscription exposes a
//! [`TransfersContainer`] that becomes the authoritative per-address source
//! of outputs and balances. The synchronizer reports progress and per-
//! transaction changes through a [`SyncObserver`]; those callbacks arrive
//! on the synchronizer's own threads, and the wallet marshals each onto its
//! scheduler before touching any state.

use std::sync::Arc;

use crate::crypto::keys::PublicKey;
use crate::node::NodeError;
use crate::transaction::AccountKeys;
use crate::Hash;

/// Identifies a transfers container across the observer boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(pub u64);

/// Where a new subscription starts scanning.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncStart {
    pub timestamp: u64,
    pub height: u32,
}

/// Parameters for one per-address subscription.
#[derive(Clone)]
pub struct AccountSubscription {
    pub keys: AccountKeys,
    pub sync_start: SyncStart,
    /// Blocks a key output must age before it is reported spendable.
    pub transaction_spendable_age: u32,
}

/// A registered subscription: the container handle plus its id.
#[derive(Clone)]
pub struct Subscription {
    pub container_id: ContainerId,
    pub container: Arc<dyn TransfersContainer>,
}

/// Output listing filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFilter {
    /// Key outputs that are unlocked and old enough to spend.
    KeyUnlocked,
}

/// Balance aggregation filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalanceFilter {
    AllUnlocked,
    AllLocked,
}

/// One spendable output as the synchronizer sees it.
#[derive(Clone, Debug)]
pub struct TransactionOutputInfo {
    pub amount: u64,
    /// Index within the chain-global bucket for this amount.
    pub global_output_index: u32,
    /// Index of the output inside its source transaction.
    pub output_in_transaction: u32,
    pub transaction_public_key: PublicKey,
    pub transaction_hash: Hash,
    pub output_key: PublicKey,
}

/// Chain-level facts about a transaction touching a subscription.
#[derive(Clone, Debug)]
pub struct TransactionInfo {
    pub transaction_hash: Hash,
    /// [`crate::constants::UNCONFIRMED_TRANSACTION_HEIGHT`] while in the pool.
    pub block_height: u32,
    pub timestamp: u64,
    pub unlock_time: u64,
    pub total_amount_in: u64,
    pub total_amount_out: u64,
    pub extra: Vec<u8>,
}

/// Per-address ledger of outputs and balances, maintained by the
/// synchronizer and read by the wallet under its readiness latch.
pub trait TransfersContainer: Send + Sync {
    fn outputs(&self, filter: OutputFilter) -> Vec<TransactionOutputInfo>;

    fn balance(&self, filter: BalanceFilter) -> u64;

    /// Facts plus the net balance change this transaction caused for the
    /// subscribed address (positive credit, negative debit).
    fn transaction_information(&self, transaction_hash: &Hash) -> Option<(TransactionInfo, i64)>;
}

/// Callbacks the synchronizer delivers. All arrive on external threads.
pub trait SyncObserver: Send + Sync {
    fn synchronization_progress_updated(&self, processed: u32, total: u32);

    fn on_transaction_updated(&self, container: ContainerId, transaction_hash: Hash);

    fn on_transaction_deleted(&self, container: ContainerId, transaction_hash: Hash);

    /// Sync errors surface through the synchronizer's own retry loop; the
    /// wallet ignores them.
    fn on_error(&self, _container: ContainerId, _height: u32, _error: NodeError) {}
}

/// The blockchain synchronizer as the wallet drives it.
pub trait TransfersSynchronizer: Send + Sync {
    fn add_subscription(&self, subscription: AccountSubscription) -> Subscription;

    /// Returns true if a subscription existed for the spend key.
    fn remove_subscription(&self, spend_public_key: &PublicKey) -> bool;

    fn subscriptions(&self) -> Vec<PublicKey>;

    fn add_observer(&self, observer: Arc<dyn SyncObserver>);

    fn remove_observer(&self);

    fn start(&self);

    fn stop(&self);
}
