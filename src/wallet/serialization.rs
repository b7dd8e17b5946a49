//! Wallet-file serialization.
//!
//! Layout: 4-byte magic, Argon2id salt, XChaCha20 nonce, then the
//! Poly1305-sealed bincode body. The body always carries the key material
//! and per-address records; the ledger/transfers section and the cache
//! section (balances, reservations, unlock jobs, change) are optional at
//! save time. The file is always encrypted under the wallet password, which
//! may be empty.

use std::collections::HashMap;
use std::io::{Read, Write};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::keys::{PublicKey, SecretKey};
use crate::wallet::containers::SpentOutput;
use crate::wallet::core::{WalletError, WalletState};
use crate::wallet::{WalletTransaction, WalletTransfer};
use crate::Hash;

const WALLET_FILE_VERSION: u32 = 1;
const WALLET_MAGIC: [u8; 4] = *b"OBW1";
const WALLET_SALT_SIZE: usize = 32;
const WALLET_NONCE_SIZE: usize = 24;

#[derive(Serialize, Deserialize)]
struct WalletBody {
    version: u32,
    view_secret_key: [u8; 32],
    actual_balance: u64,
    pending_balance: u64,
    records: Vec<SerializedWalletRecord>,
    details: Option<WalletDetails>,
    cache: Option<WalletCache>,
}

#[derive(Serialize, Deserialize)]
struct SerializedWalletRecord {
    spend_secret_key: [u8; 32],
    creation_timestamp: u64,
    actual_balance: u64,
    pending_balance: u64,
}

#[derive(Serialize, Deserialize)]
struct WalletDetails {
    transactions: Vec<WalletTransaction>,
    transfers: Vec<(u64, WalletTransfer)>,
}

#[derive(Serialize, Deserialize)]
struct WalletCache {
    spent_outputs: Vec<SerializedSpentOutput>,
    unlock_jobs: Vec<SerializedUnlockJob>,
    change: Vec<(Hash, u64)>,
}

#[derive(Serialize, Deserialize)]
struct SerializedSpentOutput {
    amount: u64,
    transaction_hash: Hash,
    output_in_transaction: u32,
    wallet: PublicKey,
    spending_transaction_hash: Hash,
}

#[derive(Serialize, Deserialize)]
struct SerializedUnlockJob {
    block_height: u32,
    wallet: PublicKey,
    transaction_hash: Hash,
}

/// Everything `load_wallet` recovers; the wallet core rebuilds
/// subscriptions and container links from it.
pub(crate) struct LoadedWallet {
    pub view_secret_key: SecretKey,
    pub actual_balance: u64,
    pub pending_balance: u64,
    pub records: Vec<LoadedRecord>,
    pub transactions: Vec<WalletTransaction>,
    pub transfers: Vec<(usize, WalletTransfer)>,
    pub spent_outputs: Vec<SpentOutput>,
    pub unlock_jobs: Vec<LoadedUnlockJob>,
    pub change: HashMap<Hash, u64>,
}

pub(crate) struct LoadedRecord {
    pub spend_secret_key: SecretKey,
    pub creation_timestamp: u64,
    pub actual_balance: u64,
    pub pending_balance: u64,
}

/// An unlock job with its container reference reduced to the owning
/// wallet's spend key; resolved back to a container after resubscription.
pub(crate) struct LoadedUnlockJob {
    pub block_height: u32,
    pub wallet: PublicKey,
    pub transaction_hash: Hash,
}

/// Argon2id parameters for the wallet file key.
/// 64 MiB memory, 3 iterations, 4 lanes.
fn derive_wallet_key(password: &str, salt: &[u8; WALLET_SALT_SIZE]) -> [u8; 32] {
    use argon2::Argon2;
    let params = argon2::Params::new(65536, 3, 4, Some(32)).expect("valid Argon2 params");
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .expect("Argon2 hash_password_into failed");
    key
}

pub(crate) fn save_wallet<W: Write>(
    state: &WalletState,
    destination: &mut W,
    save_details: bool,
    save_cache: bool,
) -> Result<(), WalletError> {
    let view_keys = state
        .view_keys
        .as_ref()
        .expect("view keys exist while initialized");

    let records = state
        .wallets
        .iter()
        .map(|record| SerializedWalletRecord {
            spend_secret_key: *record.spend_secret_key.as_bytes(),
            creation_timestamp: record.creation_timestamp,
            actual_balance: record.actual_balance,
            pending_balance: record.pending_balance,
        })
        .collect();

    let details = save_details.then(|| WalletDetails {
        transactions: state.ledger.iter().cloned().collect(),
        transfers: state
            .transfers
            .iter()
            .map(|(id, transfer)| (*id as u64, transfer.clone()))
            .collect(),
    });

    let cache = save_cache.then(|| {
        let unlock_jobs = state
            .unlock_jobs
            .iter()
            .filter_map(|job| {
                let index = state.wallets.index_by_container(job.container_id)?;
                Some(SerializedUnlockJob {
                    block_height: job.block_height,
                    wallet: state.wallets.get(index)?.spend_public_key,
                    transaction_hash: job.transaction_hash,
                })
            })
            .collect();
        WalletCache {
            spent_outputs: state
                .spent_outputs
                .iter()
                .map(|output| SerializedSpentOutput {
                    amount: output.amount,
                    transaction_hash: output.transaction_hash,
                    output_in_transaction: output.output_in_transaction,
                    wallet: output.wallet,
                    spending_transaction_hash: output.spending_transaction_hash,
                })
                .collect(),
            unlock_jobs,
            change: state.change.iter().map(|(hash, amount)| (*hash, *amount)).collect(),
        }
    });

    let body = WalletBody {
        version: WALLET_FILE_VERSION,
        view_secret_key: *view_keys.secret.as_bytes(),
        actual_balance: state.actual_balance,
        pending_balance: state.pending_balance,
        records,
        details,
        cache,
    };

    let mut plaintext = bincode::serialize(&body)
        .map_err(|e| WalletError::Serialization(format!("serialize failed: {e}")))?;

    let mut salt = [0u8; WALLET_SALT_SIZE];
    let mut nonce = [0u8; WALLET_NONCE_SIZE];
    rand::rng().fill_bytes(&mut salt);
    rand::rng().fill_bytes(&mut nonce);

    let mut key = derive_wallet_key(&state.password, &salt);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| WalletError::Serialization("encryption failed".into()))?;
    key.zeroize();
    plaintext.zeroize();

    destination
        .write_all(&WALLET_MAGIC)
        .and_then(|_| destination.write_all(&salt))
        .and_then(|_| destination.write_all(&nonce))
        .and_then(|_| destination.write_all(&ciphertext))
        .map_err(|e| WalletError::Serialization(format!("write failed: {e}")))
}

pub(crate) fn load_wallet<R: Read>(
    source: &mut R,
    password: &str,
) -> Result<LoadedWallet, WalletError> {
    let mut raw = Vec::new();
    source
        .read_to_end(&mut raw)
        .map_err(|e| WalletError::Serialization(format!("read failed: {e}")))?;

    // magic(4) + salt(32) + nonce(24) + tag(16)
    let min_len = 4 + WALLET_SALT_SIZE + WALLET_NONCE_SIZE + 16;
    if raw.len() < min_len || raw[..4] != WALLET_MAGIC {
        return Err(WalletError::Serialization("not a wallet file".into()));
    }

    let salt: [u8; WALLET_SALT_SIZE] = raw[4..4 + WALLET_SALT_SIZE]
        .try_into()
        .expect("slice length checked");
    let nonce: [u8; WALLET_NONCE_SIZE] = raw
        [4 + WALLET_SALT_SIZE..4 + WALLET_SALT_SIZE + WALLET_NONCE_SIZE]
        .try_into()
        .expect("slice length checked");
    let ciphertext = &raw[4 + WALLET_SALT_SIZE + WALLET_NONCE_SIZE..];

    let mut key = derive_wallet_key(password, &salt);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(&nonce), ciphertext)
        .map_err(|_| WalletError::WrongPassword)?;
    key.zeroize();

    let body: WalletBody = bincode::deserialize(&plaintext)
        .map_err(|e| WalletError::Serialization(format!("deserialization failed: {e}")))?;
    if body.version != WALLET_FILE_VERSION {
        return Err(WalletError::Serialization(format!(
            "unsupported wallet version: {} (expected {})",
            body.version, WALLET_FILE_VERSION
        )));
    }

    let records = body
        .records
        .into_iter()
        .map(|record| LoadedRecord {
            spend_secret_key: SecretKey(record.spend_secret_key),
            creation_timestamp: record.creation_timestamp,
            actual_balance: record.actual_balance,
            pending_balance: record.pending_balance,
        })
        .collect();

    let (transactions, transfers) = match body.details {
        Some(details) => (
            details.transactions,
            details
                .transfers
                .into_iter()
                .map(|(id, transfer)| (id as usize, transfer))
                .collect(),
        ),
        None => (Vec::new(), Vec::new()),
    };

    let (spent_outputs, unlock_jobs, change) = match body.cache {
        Some(cache) => (
            cache
                .spent_outputs
                .into_iter()
                .map(|output| SpentOutput {
                    amount: output.amount,
                    transaction_hash: output.transaction_hash,
                    output_in_transaction: output.output_in_transaction,
                    wallet: output.wallet,
                    spending_transaction_hash: output.spending_transaction_hash,
                })
                .collect(),
            cache
                .unlock_jobs
                .into_iter()
                .map(|job| LoadedUnlockJob {
                    block_height: job.block_height,
                    wallet: job.wallet,
                    transaction_hash: job.transaction_hash,
                })
                .collect(),
            cache.change.into_iter().collect(),
        ),
        None => (Vec::new(), Vec::new(), HashMap::new()),
    };

    Ok(LoadedWallet {
        view_secret_key: SecretKey(body.view_secret_key),
        actual_balance: body.actual_balance,
        pending_balance: body.pending_balance,
        records,
        transactions,
        transfers,
        spent_outputs,
        unlock_jobs,
        change,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeyPair;
    use crate::wallet::{WalletTransactionState, WalletTransfer};
    use zeroize::Zeroizing;

    fn initialized_state(password: &str) -> WalletState {
        let mut state = WalletState::new();
        state.view_keys = Some(KeyPair::generate());
        state.password = Zeroizing::new(password.to_owned());
        state
    }

    #[test]
    fn rejects_non_wallet_data() {
        let mut garbage: &[u8] = b"definitely not a wallet";
        assert!(matches!(
            load_wallet(&mut garbage, ""),
            Err(WalletError::Serialization(_))
        ));
    }

    #[test]
    fn wrong_password_fails_decryption() {
        let state = initialized_state("secret");
        let mut image = Vec::new();
        save_wallet(&state, &mut image, false, false).unwrap();

        assert!(matches!(
            load_wallet(&mut image.as_slice(), "other"),
            Err(WalletError::WrongPassword)
        ));
    }

    #[test]
    fn round_trips_keys_and_details() {
        let mut state = initialized_state("");
        state.actual_balance = 44;
        state.pending_balance = 55;
        state.ledger.push(crate::wallet::WalletTransaction {
            state: WalletTransactionState::Succeeded,
            timestamp: 9,
            block_height: 120,
            hash: [3u8; 32],
            total_amount: -500,
            fee: 10,
            creation_time: 8,
            unlock_time: 0,
            extra: vec![1, 2],
        });
        state.transfers.push_back(
            0,
            WalletTransfer {
                address: "obsdead".into(),
                amount: -490,
            },
        );
        state.change.insert([3u8; 32], 70);

        let mut image = Vec::new();
        save_wallet(&state, &mut image, true, true).unwrap();
        let loaded = load_wallet(&mut image.as_slice(), "").unwrap();

        assert_eq!(
            loaded.view_secret_key.as_bytes(),
            state.view_keys.as_ref().unwrap().secret.as_bytes()
        );
        assert_eq!(loaded.actual_balance, 44);
        assert_eq!(loaded.pending_balance, 55);
        assert_eq!(loaded.transactions.len(), 1);
        assert_eq!(loaded.transactions[0].hash, [3u8; 32]);
        assert_eq!(loaded.transfers.len(), 1);
        assert_eq!(loaded.transfers[0].1.amount, -490);
        assert_eq!(loaded.change.get(&[3u8; 32]), Some(&70));
    }

    #[test]
    fn details_and_cache_are_optional() {
        let mut state = initialized_state("");
        state.ledger.push(crate::wallet::WalletTransaction {
            state: WalletTransactionState::Failed,
            timestamp: 0,
            block_height: crate::constants::UNCONFIRMED_TRANSACTION_HEIGHT,
            hash: [4u8; 32],
            total_amount: -1,
            fee: 1,
            creation_time: 0,
            unlock_time: 0,
            extra: Vec::new(),
        });
        state.change.insert([4u8; 32], 9);

        let mut image = Vec::new();
        save_wallet(&state, &mut image, false, false).unwrap();
        let loaded = load_wallet(&mut image.as_slice(), "").unwrap();

        assert!(loaded.transactions.is_empty());
        assert!(loaded.transfers.is_empty());
        assert!(loaded.change.is_empty());
        assert!(loaded.spent_outputs.is_empty());
    }
}
