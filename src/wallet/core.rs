//! The wallet state machine and transfer pipeline.
//!
//! All mutating work, application-initiated transfers and synchronizer
//! callbacks alike, serializes on a single readiness latch
//! (`tokio::sync::Mutex<()>`), so the tables never see interleaved writers
//! even though the pipeline suspends while waiting on the node. Callbacks
//! arrive on the synchronizer's threads and are marshaled onto the wallet's
//! runtime before they may touch state.
//!
//! Read-only accessors take the state lock but not the latch: a balance
//! read concurrent with an in-flight transfer observes the ledger as of the
//! last suspension point.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex as StdMutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::constants::{
    DUST_THRESHOLD, SYNC_TIMESTAMP_WINDOW, TRANSACTION_SPENDABLE_AGE,
    UNCONFIRMED_TRANSACTION_HEIGHT, WALLET_SOFTLOCK_BLOCKS_COUNT,
};
use crate::crypto::keys::{KeyPair, PublicKey};
use crate::currency::{AccountAddress, Currency};
use crate::node::{decode_wire_transaction, NodeError, NodeRpc, RandomAmountOuts};
use crate::sync::{
    AccountSubscription, BalanceFilter, ContainerId, OutputFilter, SyncObserver, SyncStart,
    TransfersSynchronizer,
};
use crate::transaction::{
    AccountKeys, GlobalOutput, InputKeyInfo, RealOutputRef, ReceiverAmounts, TransactionBuilder,
    TransactionFactory,
};
use crate::wallet::containers::{
    SpentOutput, SpentOutputSet, TransactionLedger, TransferList, UnlockJob, UnlockSchedule,
    WalletRecord, WalletRecordTable,
};
use crate::wallet::events::EventQueue;
use crate::wallet::selection::{select_transfers, SelectedOutput, WalletOuts};
use crate::wallet::serialization;
use crate::wallet::{WalletEvent, WalletTransaction, WalletTransactionState, WalletTransfer};
use crate::Hash;

/// Errors surfaced by wallet operations.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("wallet is not initialized")]
    NotInitialized,
    #[error("wallet is already initialized")]
    AlreadyInitialized,
    #[error("operation is not allowed in the current state")]
    WrongState,
    #[error("wrong password")]
    WrongPassword,
    #[error("bad account address")]
    BadAddress,
    #[error("destination list is empty or a destination amount is zero")]
    ZeroDestination,
    #[error("destination amounts overflow")]
    SumOverflow,
    #[error("not enough money")]
    WrongAmount,
    #[error("node cannot supply the requested mixin count")]
    MixinCountTooBig,
    #[error("transaction exceeds the relay size limit")]
    TransactionSizeTooBig,
    #[error("internal wallet error")]
    InternalWalletError,
    #[error("operation cancelled")]
    OperationCancelled,
    #[error("invalid argument")]
    InvalidArgument,
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("wallet serialization failed: {0}")]
    Serialization(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WalletStatus {
    NotInitialized,
    Initialized,
}

pub(crate) struct WalletState {
    pub status: WalletStatus,
    pub password: Zeroizing<String>,
    pub view_keys: Option<KeyPair>,
    pub wallets: WalletRecordTable,
    pub ledger: TransactionLedger,
    pub transfers: TransferList,
    pub spent_outputs: SpentOutputSet,
    pub unlock_jobs: UnlockSchedule,
    pub change: HashMap<Hash, u64>,
    pub actual_balance: u64,
    pub pending_balance: u64,
}

impl WalletState {
    pub(crate) fn new() -> Self {
        WalletState {
            status: WalletStatus::NotInitialized,
            password: Zeroizing::new(String::new()),
            view_keys: None,
            wallets: WalletRecordTable::default(),
            ledger: TransactionLedger::default(),
            transfers: TransferList::default(),
            spent_outputs: SpentOutputSet::default(),
            unlock_jobs: UnlockSchedule::default(),
            change: HashMap::new(),
            actual_balance: 0,
            pending_balance: 0,
        }
    }

    fn ensure_initialized(&self) -> Result<(), WalletError> {
        if self.status != WalletStatus::Initialized {
            return Err(WalletError::NotInitialized);
        }
        Ok(())
    }

    fn view_keys(&self) -> &KeyPair {
        self.view_keys
            .as_ref()
            .expect("view keys exist while initialized")
    }

    pub(crate) fn change_total(&self) -> u64 {
        self.change.values().sum()
    }
}

struct WalletInner {
    runtime: Handle,
    currency: Arc<Currency>,
    node: Arc<dyn NodeRpc>,
    synchronizer: Arc<dyn TransfersSynchronizer>,
    transactions: Arc<dyn TransactionFactory>,
    state: RwLock<WalletState>,
    /// The readiness latch: exactly one mutating operation at a time.
    ready: Mutex<()>,
    events: EventQueue,
    /// Cancelled by `stop()`, replaced with a fresh token by `start()`.
    stopped: StdMutex<CancellationToken>,
}

/// A selected input paired with the builder-ready key info.
struct InputInfo {
    key_info: InputKeyInfo,
    wallet: PublicKey,
}

/// The multi-address wallet.
///
/// Construct with [`Wallet::new`], then either [`initialize`] a fresh wallet
/// or [`load`] a saved one. All methods take `&self`; share the wallet
/// behind an [`Arc`] to consume events from one task while transferring
/// from another.
///
/// [`initialize`]: Wallet::initialize
/// [`load`]: Wallet::load
pub struct Wallet {
    inner: Arc<WalletInner>,
}

impl Wallet {
    /// `runtime` is where synchronizer callbacks are re-dispatched; pass the
    /// handle of the runtime that drives the wallet.
    pub fn new(
        runtime: Handle,
        currency: Arc<Currency>,
        node: Arc<dyn NodeRpc>,
        synchronizer: Arc<dyn TransfersSynchronizer>,
        transactions: Arc<dyn TransactionFactory>,
    ) -> Self {
        Wallet {
            inner: Arc::new(WalletInner {
                runtime,
                currency,
                node,
                synchronizer,
                transactions,
                state: RwLock::new(WalletState::new()),
                ready: Mutex::new(()),
                events: EventQueue::default(),
                stopped: StdMutex::new(CancellationToken::new()),
            }),
        }
    }

    // ── Lifecycle ──

    /// Create a fresh wallet: generates the view key pair and registers the
    /// synchronizer observer. Fails with `AlreadyInitialized` if called twice.
    pub fn initialize(&self, password: &str) -> Result<(), WalletError> {
        {
            let mut state = self.inner.write_state();
            if state.status != WalletStatus::NotInitialized {
                return Err(WalletError::AlreadyInitialized);
            }
            self.inner.throw_if_stopped()?;

            state.view_keys = Some(KeyPair::generate());
            state.password = Zeroizing::new(password.to_owned());
            state.status = WalletStatus::Initialized;
        }
        self.inner
            .synchronizer
            .add_observer(self.inner.observer());
        tracing::info!("wallet initialized");
        Ok(())
    }

    /// Stop syncing, clear every table, drain pending events, and return to
    /// the uninitialized state.
    pub fn shutdown(&self) -> Result<(), WalletError> {
        self.inner.read_state().ensure_initialized()?;
        self.inner.do_shutdown();
        Ok(())
    }

    /// Clear the stopped state set by [`stop`]: a fresh cancellation token
    /// is armed for subsequent operations.
    ///
    /// [`stop`]: Wallet::stop
    pub fn start(&self) {
        *self.inner.stopped.lock().expect("stop token lock poisoned") =
            CancellationToken::new();
    }

    /// Make every public operation fail with `OperationCancelled` and wake
    /// any task blocked in [`get_event`]. State is preserved.
    ///
    /// [`get_event`]: Wallet::get_event
    pub fn stop(&self) {
        self.inner
            .stopped
            .lock()
            .expect("stop token lock poisoned")
            .cancel();
    }

    /// Rotate the wallet password. `old` must match the stored password
    /// byte for byte.
    pub fn change_password(&self, old: &str, new: &str) -> Result<(), WalletError> {
        let mut state = self.inner.write_state();
        state.ensure_initialized()?;
        self.inner.throw_if_stopped()?;

        if !crate::constant_time_eq(state.password.as_bytes(), old.as_bytes()) {
            return Err(WalletError::WrongPassword);
        }
        state.password = Zeroizing::new(new.to_owned());
        Ok(())
    }

    // ── Persistence ──

    /// Serialize the wallet. `save_details` includes the ledger and
    /// transfers; `save_cache` includes balances, reservations, unlock jobs
    /// and the change map. Syncing pauses for the duration when any address
    /// exists.
    pub fn save<W: Write>(
        &self,
        destination: &mut W,
        save_details: bool,
        save_cache: bool,
    ) -> Result<(), WalletError> {
        let has_wallets = {
            let state = self.inner.read_state();
            state.ensure_initialized()?;
            self.inner.throw_if_stopped()?;
            !state.wallets.is_empty()
        };

        if has_wallets {
            self.inner.synchronizer.stop();
        }
        serialization::save_wallet(
            &self.inner.read_state(),
            destination,
            save_details,
            save_cache,
        )?;
        if has_wallets {
            self.inner.synchronizer.start();
        }
        Ok(())
    }

    /// Load a previously saved wallet into this (uninitialized) instance.
    /// Recreates one synchronizer subscription per address and starts
    /// syncing if any address exists.
    pub fn load<R: Read>(&self, source: &mut R, password: &str) -> Result<(), WalletError> {
        {
            let state = self.inner.read_state();
            if state.status != WalletStatus::NotInitialized {
                return Err(WalletError::WrongState);
            }
            self.inner.throw_if_stopped()?;
        }

        let loaded = serialization::load_wallet(source, password)?;
        let view_keys = KeyPair::from_secret(loaded.view_secret_key);

        let mut state = self.inner.write_state();
        for record in loaded.records {
            let spend_keys = KeyPair::from_secret(record.spend_secret_key);
            let subscription = self.inner.synchronizer.add_subscription(AccountSubscription {
                keys: AccountKeys {
                    address: AccountAddress {
                        spend_public_key: spend_keys.public,
                        view_public_key: view_keys.public,
                    },
                    view_secret_key: view_keys.secret.clone(),
                    spend_secret_key: spend_keys.secret.clone(),
                },
                sync_start: SyncStart {
                    timestamp: record.creation_timestamp.saturating_sub(SYNC_TIMESTAMP_WINDOW),
                    height: 0,
                },
                transaction_spendable_age: TRANSACTION_SPENDABLE_AGE,
            });
            state.wallets.push(WalletRecord {
                spend_public_key: spend_keys.public,
                spend_secret_key: spend_keys.secret,
                creation_timestamp: record.creation_timestamp,
                container_id: subscription.container_id,
                container: subscription.container,
                actual_balance: record.actual_balance,
                pending_balance: record.pending_balance,
            });
        }

        for transaction in loaded.transactions {
            state.ledger.push(transaction);
        }
        for (transaction_id, transfer) in loaded.transfers {
            state.transfers.insert(transaction_id, transfer);
        }
        for output in loaded.spent_outputs {
            state.spent_outputs.insert(output);
        }
        for job in loaded.unlock_jobs {
            let Some(index) = state.wallets.index_by_spend_key(&job.wallet) else {
                continue;
            };
            let container_id = state.wallets.get(index).expect("index just looked up").container_id;
            state.unlock_jobs.insert(UnlockJob {
                block_height: job.block_height,
                container_id,
                transaction_hash: job.transaction_hash,
            });
        }
        state.change = loaded.change;
        state.actual_balance = loaded.actual_balance;
        state.pending_balance = loaded.pending_balance;
        state.view_keys = Some(view_keys);
        state.password = Zeroizing::new(password.to_owned());
        state.status = WalletStatus::Initialized;
        let has_wallets = !state.wallets.is_empty();
        drop(state);

        self.inner
            .synchronizer
            .add_observer(self.inner.observer());
        if has_wallets {
            self.inner.synchronizer.start();
        }
        tracing::info!("wallet loaded");
        Ok(())
    }

    // ── Events ──

    /// Pop the next wallet event, suspending until one arrives. Fails with
    /// `OperationCancelled` when [`stop`] fires while blocked.
    ///
    /// [`stop`]: Wallet::stop
    pub async fn get_event(&self) -> Result<WalletEvent, WalletError> {
        self.inner.read_state().ensure_initialized()?;
        self.inner.throw_if_stopped()?;

        // the token is cloned before waiting, so a stop() racing the
        // receive still cancels this exact token
        let stopped = self.inner.stop_token();
        tokio::select! {
            biased;
            _ = stopped.cancelled() => Err(WalletError::OperationCancelled),
            event = self.inner.events.recv() => Ok(event),
        }
    }

    // ── Addresses ──

    /// Create an address with a freshly generated spend key pair.
    pub fn create_address(&self) -> Result<String, WalletError> {
        self.create_address_with_keys(KeyPair::generate())
    }

    /// Create an address from an imported spend key pair.
    pub fn create_address_with_keys(&self, spend_keys: KeyPair) -> Result<String, WalletError> {
        let (view_keys, has_wallets) = {
            let state = self.inner.read_state();
            state.ensure_initialized()?;
            self.inner.throw_if_stopped()?;
            (state.view_keys().clone(), !state.wallets.is_empty())
        };

        // Pause syncing so the new subscription starts cleanly.
        if has_wallets {
            self.inner.synchronizer.stop();
        }

        let creation_timestamp = unix_time();
        let subscription = self.inner.synchronizer.add_subscription(AccountSubscription {
            keys: AccountKeys {
                address: AccountAddress {
                    spend_public_key: spend_keys.public,
                    view_public_key: view_keys.public,
                },
                view_secret_key: view_keys.secret.clone(),
                spend_secret_key: spend_keys.secret.clone(),
            },
            sync_start: SyncStart {
                timestamp: creation_timestamp.saturating_sub(SYNC_TIMESTAMP_WINDOW),
                height: 0,
            },
            transaction_spendable_age: TRANSACTION_SPENDABLE_AGE,
        });

        let address = {
            let mut state = self.inner.write_state();
            state.wallets.push(WalletRecord {
                spend_public_key: spend_keys.public,
                spend_secret_key: spend_keys.secret,
                creation_timestamp,
                container_id: subscription.container_id,
                container: subscription.container,
                actual_balance: 0,
                pending_balance: 0,
            });
            self.inner.currency.account_address_as_string(&AccountAddress {
                spend_public_key: spend_keys.public,
                view_public_key: view_keys.public,
            })
        };

        self.inner.synchronizer.start();
        tracing::debug!(address = %address, "created address");
        Ok(address)
    }

    /// Delete an address: its subscription, its spent-output reservations,
    /// and its cached contribution to the global balances.
    pub fn delete_address(&self, address: &str) -> Result<(), WalletError> {
        let spend_public_key = {
            let state = self.inner.read_state();
            state.ensure_initialized()?;
            self.inner.throw_if_stopped()?;

            let parsed = self
                .inner
                .currency
                .parse_account_address_string(address)
                .map_err(|_| WalletError::BadAddress)?;
            if state.wallets.index_by_spend_key(&parsed.spend_public_key).is_none() {
                return Err(WalletError::InvalidArgument);
            }
            parsed.spend_public_key
        };

        self.inner.synchronizer.stop();

        let has_wallets = {
            let mut state = self.inner.write_state();
            if let Some(index) = state.wallets.index_by_spend_key(&spend_public_key) {
                let record = state.wallets.get(index).expect("index just looked up");
                let (actual, pending) = (record.actual_balance, record.pending_balance);
                state.actual_balance = state.actual_balance.saturating_sub(actual);
                state.pending_balance = state.pending_balance.saturating_sub(pending);
            }
            self.inner.synchronizer.remove_subscription(&spend_public_key);
            state.spent_outputs.remove_by_wallet(&spend_public_key);
            state.wallets.remove_by_spend_key(&spend_public_key);
            !state.wallets.is_empty()
        };

        if has_wallets {
            self.inner.synchronizer.start();
        }
        tracing::debug!(address = %address, "deleted address");
        Ok(())
    }

    pub fn address_count(&self) -> Result<usize, WalletError> {
        let state = self.inner.checked_read()?;
        Ok(state.wallets.len())
    }

    pub fn address(&self, index: usize) -> Result<String, WalletError> {
        let state = self.inner.checked_read()?;
        let record = state.wallets.get(index).ok_or(WalletError::InvalidArgument)?;
        Ok(self.inner.currency.account_address_as_string(&AccountAddress {
            spend_public_key: record.spend_public_key,
            view_public_key: state.view_keys().public,
        }))
    }

    // ── Balances ──

    pub fn actual_balance(&self) -> Result<u64, WalletError> {
        let state = self.inner.checked_read()?;
        Ok(state.actual_balance)
    }

    pub fn pending_balance(&self) -> Result<u64, WalletError> {
        let state = self.inner.checked_read()?;
        Ok(state.pending_balance)
    }

    pub fn actual_balance_of(&self, address: &str) -> Result<u64, WalletError> {
        let state = self.inner.checked_read()?;
        let index = self.inner.wallet_index_for(&state, address)?;
        Ok(state.wallets.get(index).expect("index just looked up").actual_balance)
    }

    pub fn pending_balance_of(&self, address: &str) -> Result<u64, WalletError> {
        let state = self.inner.checked_read()?;
        let index = self.inner.wallet_index_for(&state, address)?;
        Ok(state.wallets.get(index).expect("index just looked up").pending_balance)
    }

    // ── Ledger ──

    pub fn transaction_count(&self) -> Result<usize, WalletError> {
        let state = self.inner.checked_read()?;
        Ok(state.ledger.len())
    }

    pub fn transaction(&self, index: usize) -> Result<WalletTransaction, WalletError> {
        let state = self.inner.checked_read()?;
        state
            .ledger
            .get(index)
            .cloned()
            .ok_or(WalletError::InvalidArgument)
    }

    pub fn transaction_transfer_count(&self, transaction_index: usize) -> Result<usize, WalletError> {
        let state = self.inner.checked_read()?;
        Ok(state.transfers.equal_range(transaction_index).len())
    }

    pub fn transaction_transfer(
        &self,
        transaction_index: usize,
        transfer_index: usize,
    ) -> Result<WalletTransfer, WalletError> {
        let state = self.inner.checked_read()?;
        let range = state.transfers.equal_range(transaction_index);
        range
            .get(transfer_index)
            .map(|(_, transfer)| transfer.clone())
            .ok_or(WalletError::InvalidArgument)
    }

    // ── Transfers ──

    /// Send to `destinations`, funding the payment from every address.
    /// Returns the ledger id of the created transaction.
    pub async fn transfer(
        &self,
        destinations: &[WalletTransfer],
        fee: u64,
        mixin: u64,
        extra: &[u8],
        unlock_timestamp: u64,
    ) -> Result<usize, WalletError> {
        let _ready = self.inner.ready.lock().await;

        let wallet_outs = {
            let state = self.inner.read_state();
            state.ensure_initialized()?;
            self.inner.throw_if_stopped()?;
            self.inner.pick_wallets_with_money(&state)
        };

        self.inner
            .do_transfer(wallet_outs, destinations, fee, mixin, extra, unlock_timestamp)
            .await
    }

    /// Send to `destinations` funding the payment only from
    /// `source_address`.
    pub async fn transfer_from(
        &self,
        source_address: &str,
        destinations: &[WalletTransfer],
        fee: u64,
        mixin: u64,
        extra: &[u8],
        unlock_timestamp: u64,
    ) -> Result<usize, WalletError> {
        let _ready = self.inner.ready.lock().await;

        let wallet_outs = {
            let state = self.inner.read_state();
            state.ensure_initialized()?;
            self.inner.throw_if_stopped()?;
            let index = self.inner.wallet_index_for(&state, source_address)?;
            let source = self.inner.pick_wallet(&state, index);
            if source.outs.is_empty() {
                Vec::new()
            } else {
                vec![source]
            }
        };

        self.inner
            .do_transfer(wallet_outs, destinations, fee, mixin, extra, unlock_timestamp)
            .await
    }
}

impl Drop for Wallet {
    fn drop(&mut self) {
        // in-flight callback tasks hold only a Weak reference and become
        // no-ops once the state returns to NotInitialized
        if self.inner.read_state().status == WalletStatus::Initialized {
            self.inner.do_shutdown();
        }
    }
}

impl WalletInner {
    fn read_state(&self) -> RwLockReadGuard<'_, WalletState> {
        self.state.read().expect("wallet state lock poisoned")
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, WalletState> {
        self.state.write().expect("wallet state lock poisoned")
    }

    /// Read guard with the standard entry checks applied.
    fn checked_read(&self) -> Result<RwLockReadGuard<'_, WalletState>, WalletError> {
        let state = self.read_state();
        state.ensure_initialized()?;
        self.throw_if_stopped()?;
        Ok(state)
    }

    fn throw_if_stopped(&self) -> Result<(), WalletError> {
        if self.stop_token().is_cancelled() {
            return Err(WalletError::OperationCancelled);
        }
        Ok(())
    }

    fn stop_token(&self) -> CancellationToken {
        self.stopped
            .lock()
            .expect("stop token lock poisoned")
            .clone()
    }

    fn observer(self: &Arc<Self>) -> Arc<dyn SyncObserver> {
        Arc::new(SyncCallbacks {
            inner: Arc::downgrade(self),
            runtime: self.runtime.clone(),
        })
    }

    fn do_shutdown(&self) {
        self.synchronizer.stop();
        self.synchronizer.remove_observer();

        for spend_public_key in self.synchronizer.subscriptions() {
            self.synchronizer.remove_subscription(&spend_public_key);
        }

        let mut state = self.write_state();
        state.wallets.clear();
        state.spent_outputs.clear();
        state.unlock_jobs.clear();
        state.ledger.clear();
        state.transfers.clear();
        state.change.clear();
        state.actual_balance = 0;
        state.pending_balance = 0;
        state.view_keys = None;
        state.status = WalletStatus::NotInitialized;
        drop(state);

        self.events.clear();
        tracing::info!("wallet shut down");
    }

    fn wallet_index_for(
        &self,
        state: &WalletState,
        address: &str,
    ) -> Result<usize, WalletError> {
        let parsed = self
            .currency
            .parse_account_address_string(address)
            .map_err(|_| WalletError::BadAddress)?;
        state
            .wallets
            .index_by_spend_key(&parsed.spend_public_key)
            .ok_or(WalletError::InvalidArgument)
    }

    // ── Transfer pipeline ──

    fn pick_wallets_with_money(&self, state: &WalletState) -> Vec<WalletOuts> {
        let mut wallet_outs = Vec::new();
        for index in 0..state.wallets.len() {
            let record = state.wallets.get(index).expect("index within len");
            if record.actual_balance == 0 {
                continue;
            }
            wallet_outs.push(self.pick_wallet(state, index));
        }
        wallet_outs
    }

    fn pick_wallet(&self, state: &WalletState, index: usize) -> WalletOuts {
        let record = state.wallets.get(index).expect("index within len");
        WalletOuts {
            wallet: record.spend_public_key,
            outs: record.container.outputs(OutputFilter::KeyUnlocked),
        }
    }

    async fn do_transfer(
        &self,
        wallet_outs: Vec<WalletOuts>,
        destinations: &[WalletTransfer],
        fee: u64,
        mixin: u64,
        extra: &[u8],
        unlock_timestamp: u64,
    ) -> Result<usize, WalletError> {
        if destinations.is_empty() {
            return Err(WalletError::ZeroDestination);
        }
        for destination in destinations {
            self.currency
                .parse_account_address_string(&destination.address)
                .map_err(|_| WalletError::BadAddress)?;
        }

        let needed_money = count_needed_money(destinations, fee)?;

        let (found_money, selected) = {
            let state = self.read_state();
            select_transfers(
                needed_money,
                mixin == 0,
                DUST_THRESHOLD,
                wallet_outs,
                &state.spent_outputs,
            )
        };
        if found_money < needed_money {
            return Err(WalletError::WrongAmount);
        }

        let mixin_result = if mixin != 0 {
            self.request_mixin_outs(&selected, mixin).await?
        } else {
            Vec::new()
        };

        let keys_info = prepare_inputs(&selected, &mixin_result, mixin);

        let (change_receiver, change_address) = {
            let state = self.read_state();
            let first = state.wallets.get(0).expect("selection implies an address");
            let receiver = AccountAddress {
                spend_public_key: first.spend_public_key,
                view_public_key: state.view_keys().public,
            };
            (receiver, self.currency.account_address_as_string(&receiver))
        };
        let change_amount = found_money - needed_money;

        let decomposed = self.split_destinations(destinations, change_receiver, change_amount)?;

        let transaction =
            self.make_transaction(&decomposed, &keys_info, extra, unlock_timestamp);
        let transaction_hash = transaction.transaction_hash();

        let transaction_id = {
            let mut state = self.write_state();
            let id = insert_outgoing_transaction(
                &mut state,
                transaction_hash,
                -(needed_money as i64),
                fee,
                transaction.extra(),
                unlock_timestamp,
            );
            for destination in destinations {
                state.transfers.push_back(
                    id,
                    WalletTransfer {
                        address: destination.address.clone(),
                        amount: -destination.amount,
                    },
                );
            }
            id
        };

        if let Err(error) = self.send_transaction(transaction.as_ref()).await {
            // the entry stays FAILED; the caller may retry with fresh outputs
            tracing::warn!(
                tx = %hex::encode(&transaction_hash[..8]),
                error = %error,
                "transaction relay failed"
            );
            self.events.push(WalletEvent::TransactionCreated {
                transaction_index: transaction_id,
            });
            return Err(error);
        }

        {
            let mut state = self.write_state();
            if let Some(entry) = state.ledger.get_mut(transaction_id) {
                entry.state = WalletTransactionState::Succeeded;
            }
            for output in &selected {
                state.spent_outputs.insert(SpentOutput {
                    amount: output.out.amount,
                    transaction_hash: output.out.transaction_hash,
                    output_in_transaction: output.out.output_in_transaction,
                    wallet: output.wallet,
                    spending_transaction_hash: transaction_hash,
                });
            }
            state.change.insert(transaction_hash, change_amount);
            update_used_wallets_balances(&mut state, &selected);
        }

        tracing::info!(
            tx = %hex::encode(&transaction_hash[..8]),
            amount = needed_money,
            fee,
            mixin,
            change = change_amount,
            change_to = %change_address,
            "transaction relayed"
        );
        self.events.push(WalletEvent::TransactionCreated {
            transaction_index: transaction_id,
        });
        Ok(transaction_id)
    }

    async fn request_mixin_outs(
        &self,
        selected: &[SelectedOutput],
        mixin: u64,
    ) -> Result<Vec<RandomAmountOuts>, WalletError> {
        let amounts: Vec<u64> = selected.iter().map(|output| output.out.amount).collect();
        let bucket_count = amounts.len();

        self.throw_if_stopped()?;
        let result = self.node.random_outputs_by_amounts(amounts, mixin).await;
        self.throw_if_stopped()?;

        let mixin_result = result?;
        validate_mixin_result(&mixin_result, mixin, bucket_count)?;
        Ok(mixin_result)
    }

    fn split_destinations(
        &self,
        destinations: &[WalletTransfer],
        change_receiver: AccountAddress,
        change_amount: u64,
    ) -> Result<Vec<ReceiverAmounts>, WalletError> {
        let mut decomposed = Vec::with_capacity(destinations.len() + 1);
        for destination in destinations {
            let receiver = self
                .currency
                .parse_account_address_string(&destination.address)
                .map_err(|_| WalletError::BadAddress)?;
            decomposed.push(ReceiverAmounts {
                receiver,
                amounts: self
                    .currency
                    .decompose_amount(destination.amount as u64, DUST_THRESHOLD),
            });
        }
        // change is always appended, even when zero (decomposes to nothing)
        decomposed.push(ReceiverAmounts {
            receiver: change_receiver,
            amounts: self.currency.decompose_amount(change_amount, DUST_THRESHOLD),
        });
        Ok(decomposed)
    }

    fn make_transaction(
        &self,
        decomposed: &[ReceiverAmounts],
        keys_info: &[InputInfo],
        extra: &[u8],
        unlock_timestamp: u64,
    ) -> Box<dyn TransactionBuilder> {
        let mut transaction = self.transactions.create_transaction();

        for output in decomposed {
            for &amount in &output.amounts {
                transaction.add_output(amount, &output.receiver);
            }
        }

        transaction.set_unlock_time(unlock_timestamp);
        transaction.append_extra(extra);

        let state = self.read_state();
        let mut ephemeral_keys = Vec::with_capacity(keys_info.len());
        for input in keys_info {
            let account_keys = account_keys(&state, &input.wallet);
            ephemeral_keys.push(transaction.add_input(&account_keys, &input.key_info));
        }
        drop(state);

        for (index, (input, ephemeral)) in keys_info.iter().zip(&ephemeral_keys).enumerate() {
            transaction.sign_input_key(index, &input.key_info, ephemeral);
        }

        transaction
    }

    async fn send_transaction(
        &self,
        transaction: &dyn TransactionBuilder,
    ) -> Result<(), WalletError> {
        let data = transaction.transaction_data();
        let size_limit = self.currency.max_transaction_size_limit();

        if data.len() > size_limit {
            return Err(WalletError::TransactionSizeTooBig);
        }
        let wire = decode_wire_transaction(&data, size_limit)
            .ok_or(WalletError::InternalWalletError)?;

        self.throw_if_stopped()?;
        self.node.relay_transaction(&wire).await?;
        self.throw_if_stopped()?;
        Ok(())
    }

    // ── Synchronizer callbacks ──

    async fn handle_progress(self: Arc<Self>, current: u32) {
        let _ready = self.ready.lock().await;

        let mut state = self.write_state();
        if state.status == WalletStatus::NotInitialized {
            return;
        }

        let jobs = state.unlock_jobs.drain_up_to(current);
        for job in &jobs {
            update_balance(&mut state, job.container_id);
        }
        drop(state);

        tracing::trace!(height = current, unlocked = jobs.len(), "sync progress");
        self.events.push(WalletEvent::BalanceUnlocked);
    }

    async fn handle_transaction_updated(
        self: Arc<Self>,
        container_id: ContainerId,
        transaction_hash: Hash,
    ) {
        let _ready = self.ready.lock().await;

        let mut state = self.write_state();
        if state.status == WalletStatus::NotInitialized {
            return;
        }

        // the chain observed our spend: the local reservation can go
        state.spent_outputs.remove_by_spending_tx(&transaction_hash);

        let Some(wallet_index) = state.wallets.index_by_container(container_id) else {
            return;
        };
        let container = Arc::clone(
            &state
                .wallets
                .get(wallet_index)
                .expect("index just looked up")
                .container,
        );
        let Some((info, transaction_balance)) = container.transaction_information(&transaction_hash)
        else {
            tracing::warn!(
                tx = %hex::encode(&transaction_hash[..8]),
                "container reported an update for an unknown transaction"
            );
            return;
        };

        let event = if let Some(id) = state.ledger.id_by_hash(&info.transaction_hash) {
            let entry = state.ledger.get_mut(id).expect("id from hash index");
            entry.block_height = info.block_height;
            // a transaction may be deleted first and then observed again
            entry.state = WalletTransactionState::Succeeded;
            WalletEvent::TransactionUpdated { transaction_index: id }
        } else {
            let id = state.ledger.push(WalletTransaction {
                state: WalletTransactionState::Succeeded,
                timestamp: info.timestamp,
                block_height: info.block_height,
                hash: info.transaction_hash,
                total_amount: transaction_balance,
                fee: info.total_amount_in.saturating_sub(info.total_amount_out),
                creation_time: info.timestamp,
                unlock_time: info.unlock_time,
                extra: info.extra.clone(),
            });
            let address = {
                let record = state.wallets.get(wallet_index).expect("index just looked up");
                self.currency.account_address_as_string(&AccountAddress {
                    spend_public_key: record.spend_public_key,
                    view_public_key: state.view_keys().public,
                })
            };
            state.transfers.insert(
                id,
                WalletTransfer {
                    address,
                    amount: transaction_balance,
                },
            );
            WalletEvent::TransactionCreated { transaction_index: id }
        };

        if info.block_height != UNCONFIRMED_TRANSACTION_HEIGHT {
            state.change.remove(&transaction_hash);
            state.unlock_jobs.insert(UnlockJob {
                block_height: unlock_height_for(info.block_height, info.unlock_time),
                container_id,
                transaction_hash,
            });
        }

        update_balance(&mut state, container_id);
        drop(state);

        tracing::debug!(
            tx = %hex::encode(&transaction_hash[..8]),
            height = info.block_height,
            "transaction updated"
        );
        self.events.push(event);
    }

    async fn handle_transaction_deleted(
        self: Arc<Self>,
        container_id: ContainerId,
        transaction_hash: Hash,
    ) {
        let _ready = self.ready.lock().await;

        let mut state = self.write_state();
        if state.status == WalletStatus::NotInitialized {
            return;
        }

        let Some(id) = state.ledger.id_by_hash(&transaction_hash) else {
            return;
        };

        state.unlock_jobs.remove_by_hash(&transaction_hash);
        state.change.remove(&transaction_hash);
        state.spent_outputs.remove_by_spending_tx(&transaction_hash);

        let entry = state.ledger.get_mut(id).expect("id from hash index");
        entry.state = WalletTransactionState::Cancelled;
        entry.block_height = UNCONFIRMED_TRANSACTION_HEIGHT;

        update_balance(&mut state, container_id);
        drop(state);

        tracing::debug!(
            tx = %hex::encode(&transaction_hash[..8]),
            "transaction deleted by the chain"
        );
        self.events.push(WalletEvent::TransactionUpdated { transaction_index: id });
    }
}

/// Observer registered with the synchronizer. Each callback is re-dispatched
/// onto the wallet's runtime, where the task contends for the readiness
/// latch like any application-initiated operation.
struct SyncCallbacks {
    inner: Weak<WalletInner>,
    runtime: Handle,
}

impl SyncObserver for SyncCallbacks {
    fn synchronization_progress_updated(&self, processed: u32, _total: u32) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        self.runtime.spawn(inner.handle_progress(processed));
    }

    fn on_transaction_updated(&self, container: ContainerId, transaction_hash: Hash) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        self.runtime
            .spawn(inner.handle_transaction_updated(container, transaction_hash));
    }

    fn on_transaction_deleted(&self, container: ContainerId, transaction_hash: Hash) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        self.runtime
            .spawn(inner.handle_transaction_deleted(container, transaction_hash));
    }
}

// ── Pipeline helpers ──

fn count_needed_money(destinations: &[WalletTransfer], fee: u64) -> Result<u64, WalletError> {
    let mut needed_money = 0u64;
    for transfer in destinations {
        if transfer.amount == 0 {
            return Err(WalletError::ZeroDestination);
        }
        if transfer.amount < 0 {
            return Err(WalletError::InvalidArgument);
        }
        needed_money = needed_money
            .checked_add(transfer.amount as u64)
            .ok_or(WalletError::SumOverflow)?;
    }
    needed_money.checked_add(fee).ok_or(WalletError::SumOverflow)
}

/// Check the node gave every amount bucket at least `mixin` decoys.
///
/// The `mixin == 0` empty-result branch cannot be reached through the
/// pipeline (the request is skipped for mixin 0) but stays in place: an
/// empty answer where buckets were expected means the node cannot supply
/// decoys, same as a short bucket.
fn validate_mixin_result(
    mixin_result: &[RandomAmountOuts],
    mixin: u64,
    expected_buckets: usize,
) -> Result<(), WalletError> {
    if mixin == 0 && mixin_result.is_empty() {
        return Err(WalletError::MixinCountTooBig);
    }
    if mixin_result.len() < expected_buckets {
        return Err(WalletError::MixinCountTooBig);
    }
    if mixin_result
        .iter()
        .any(|bucket| (bucket.outs.len() as u64) < mixin)
    {
        return Err(WalletError::MixinCountTooBig);
    }
    Ok(())
}

/// Assemble ring inputs: decoys sorted by global index, up to `mixin` of
/// them with the real output's index skipped, and the real output spliced
/// into the first position that keeps the ring sorted. That position is
/// recorded for the signer.
fn prepare_inputs(
    selected: &[SelectedOutput],
    mixin_result: &[RandomAmountOuts],
    mixin: u64,
) -> Vec<InputInfo> {
    let mut keys_info = Vec::with_capacity(selected.len());

    for (i, input) in selected.iter().enumerate() {
        let mut outputs: Vec<GlobalOutput> = Vec::new();
        if let Some(bucket) = mixin_result.get(i) {
            let mut decoys = bucket.outs.clone();
            decoys.sort_by_key(|entry| entry.global_amount_index);
            for decoy in decoys {
                if decoy.global_amount_index == input.out.global_output_index {
                    continue;
                }
                outputs.push(GlobalOutput {
                    output_index: decoy.global_amount_index,
                    target_key: decoy.out_key,
                });
                if outputs.len() >= mixin as usize {
                    break;
                }
            }
        }

        let insert_at = outputs
            .iter()
            .position(|output| output.output_index >= input.out.global_output_index)
            .unwrap_or(outputs.len());
        outputs.insert(
            insert_at,
            GlobalOutput {
                output_index: input.out.global_output_index,
                target_key: input.out.output_key,
            },
        );

        keys_info.push(InputInfo {
            key_info: InputKeyInfo {
                amount: input.out.amount,
                outputs,
                real_output: RealOutputRef {
                    transaction_public_key: input.out.transaction_public_key,
                    transaction_index: insert_at,
                    output_in_transaction: input.out.output_in_transaction,
                },
            },
            wallet: input.wallet,
        });
    }

    keys_info
}

fn account_keys(state: &WalletState, spend_public_key: &PublicKey) -> AccountKeys {
    let index = state
        .wallets
        .index_by_spend_key(spend_public_key)
        .expect("selected output owner exists");
    let record = state.wallets.get(index).expect("index just looked up");
    let view_keys = state.view_keys();
    AccountKeys {
        address: AccountAddress {
            spend_public_key: record.spend_public_key,
            view_public_key: view_keys.public,
        },
        view_secret_key: view_keys.secret.clone(),
        spend_secret_key: record.spend_secret_key.clone(),
    }
}

fn insert_outgoing_transaction(
    state: &mut WalletState,
    transaction_hash: Hash,
    total_amount: i64,
    fee: u64,
    extra: Vec<u8>,
    unlock_timestamp: u64,
) -> usize {
    state.ledger.push(WalletTransaction {
        // flipped to Succeeded only after the node accepts the relay
        state: WalletTransactionState::Failed,
        timestamp: 0,
        block_height: UNCONFIRMED_TRANSACTION_HEIGHT,
        hash: transaction_hash,
        total_amount,
        fee,
        creation_time: unix_time(),
        unlock_time: unlock_timestamp,
        extra,
    })
}

/// Re-run the balance engine for every wallet that contributed an output,
/// plus wallet 0, which receives the change.
fn update_used_wallets_balances(state: &mut WalletState, selected: &[SelectedOutput]) {
    let mut container_ids = Vec::new();
    if let Some(first) = state.wallets.get(0) {
        container_ids.push(first.container_id);
    }
    for output in selected {
        if let Some(index) = state.wallets.index_by_spend_key(&output.wallet) {
            let id = state.wallets.get(index).expect("index just looked up").container_id;
            if !container_ids.contains(&id) {
                container_ids.push(id);
            }
        }
    }
    for container_id in container_ids {
        update_balance(state, container_id);
    }
}

/// The balance engine: recompute one wallet's cached balances from its
/// container, the spent-output reservations, and (for wallet 0) the change
/// map, then fold the delta into the global totals.
fn update_balance(state: &mut WalletState, container_id: ContainerId) {
    let Some(index) = state.wallets.index_by_container(container_id) else {
        // the container belongs to a just-removed wallet
        return;
    };
    let record = state.wallets.get(index).expect("index just looked up");
    let container = Arc::clone(&record.container);
    let spend_public_key = record.spend_public_key;
    let (old_actual, old_pending) = (record.actual_balance, record.pending_balance);

    let reserved = state.spent_outputs.wallet_spent_amount(&spend_public_key);
    let actual = container
        .balance(BalanceFilter::AllUnlocked)
        .saturating_sub(reserved);
    let mut pending = container.balance(BalanceFilter::AllLocked);
    if index == 0 {
        // local change is visible as pending before it confirms
        pending += state.change_total();
    }

    if old_actual < actual {
        state.actual_balance += actual - old_actual;
    } else {
        state.actual_balance -= old_actual - actual;
    }
    if old_pending < pending {
        state.pending_balance += pending - old_pending;
    } else {
        state.pending_balance -= old_pending - pending;
    }

    let record = state.wallets.get_mut(index).expect("index just looked up");
    record.actual_balance = actual;
    record.pending_balance = pending;
}

/// Height at which funds from a confirmed transaction become actual.
///
/// Known limitation: `unlock_time` may be a timestamp rather than a height.
/// The value is truncated to 32 bits and the additions wrap, so a
/// timestamp-valued unlock time lands on an arbitrary height, usually far
/// in the future, and the funds stay pending until then.
/// TODO: separate timestamp-valued unlock times from height-valued ones.
fn unlock_height_for(block_height: u32, unlock_time: u64) -> u32 {
    block_height
        .wrapping_add(unlock_time as u32)
        .wrapping_add(WALLET_SOFTLOCK_BLOCKS_COUNT)
        .wrapping_add(1)
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
