//! The wallet core.
//!
//! [`Wallet`] owns every table: per-address records, the transaction ledger
//! and its transfers, spent-output reservations, the unlock schedule, and
//! the change map. All mutation funnels through a single readiness latch so
//! application calls and synchronizer callbacks never interleave.

mod containers;
mod core;
mod events;
mod selection;
mod serialization;

pub use self::core::{Wallet, WalletError};

use serde::{Deserialize, Serialize};

use crate::Hash;

/// Lifecycle state of a ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletTransactionState {
    /// Relayed, or observed on-chain.
    Succeeded,
    /// Created locally but relay failed; may be retried.
    Failed,
    /// The chain dropped it after relay.
    Cancelled,
}

/// One ledger entry. After creation only `state`, `block_height`, and
/// `timestamp` change.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub state: WalletTransactionState,
    /// When the transaction was first seen in a block; 0 while unconfirmed.
    pub timestamp: u64,
    /// [`crate::constants::UNCONFIRMED_TRANSACTION_HEIGHT`] until confirmed.
    pub block_height: u32,
    pub hash: Hash,
    /// Negative for outgoing (destinations + fee), positive for incoming.
    pub total_amount: i64,
    pub fee: u64,
    pub creation_time: u64,
    pub unlock_time: u64,
    pub extra: Vec<u8>,
}

/// A (destination, amount) leg of a transaction. Outgoing legs carry the
/// negated requested amount; incoming legs the net credit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransfer {
    pub address: String,
    pub amount: i64,
}

/// Domain events delivered through [`Wallet::get_event`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    TransactionCreated { transaction_index: usize },
    TransactionUpdated { transaction_index: usize },
    BalanceUnlocked,
}
