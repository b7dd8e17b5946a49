//! Chain parameter object: addresses, amount decomposition, limits.
//!
//! A [`Currency`] bundles everything about the chain the wallet must agree
//! on with the node: the address encoding, the genesis block hash, the relay
//! size limit, and the canonical decomposition of amounts into denominations.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::PublicKey;
use crate::{hash_domain, Hash};

/// Default address prefix.
const ADDRESS_PREFIX: &str = "obs";
/// Bytes of the checksum appended to the address payload.
const ADDRESS_CHECKSUM_LEN: usize = 4;
/// Default upper bound on a relayed transaction's serialized size.
const DEFAULT_MAX_TRANSACTION_SIZE: usize = 300 * 1024;

/// A standard account address: the owner's spend public key plus the
/// wallet-wide view public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountAddress {
    pub spend_public_key: PublicKey,
    pub view_public_key: PublicKey,
}

/// Address parse failure. The wallet maps this to its own error codes.
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed account address")]
pub struct AddressParseError;

/// Chain parameters shared between the wallet and the node.
#[derive(Clone, Debug)]
pub struct Currency {
    genesis_block_hash: Hash,
    max_transaction_size_limit: usize,
}

impl Currency {
    pub fn new(genesis_block_hash: Hash) -> Self {
        Currency {
            genesis_block_hash,
            max_transaction_size_limit: DEFAULT_MAX_TRANSACTION_SIZE,
        }
    }

    /// Override the relay size limit (test networks use small blocks).
    pub fn with_max_transaction_size(mut self, limit: usize) -> Self {
        self.max_transaction_size_limit = limit;
        self
    }

    pub fn genesis_block_hash(&self) -> Hash {
        self.genesis_block_hash
    }

    pub fn max_transaction_size_limit(&self) -> usize {
        self.max_transaction_size_limit
    }

    /// Render an account address as a string: prefix, hex payload, hex
    /// checksum. The checksum is domain-separated so an address can never
    /// double as any other hex-encoded protocol object.
    pub fn account_address_as_string(&self, address: &AccountAddress) -> String {
        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(address.spend_public_key.as_bytes());
        payload.extend_from_slice(address.view_public_key.as_bytes());
        let checksum = address_checksum(&payload);
        format!(
            "{}{}{}",
            ADDRESS_PREFIX,
            hex::encode(&payload),
            hex::encode(&checksum[..ADDRESS_CHECKSUM_LEN])
        )
    }

    /// Parse an address string produced by [`account_address_as_string`].
    ///
    /// [`account_address_as_string`]: Currency::account_address_as_string
    pub fn parse_account_address_string(
        &self,
        address: &str,
    ) -> Result<AccountAddress, AddressParseError> {
        let body = address.strip_prefix(ADDRESS_PREFIX).ok_or(AddressParseError)?;
        let bytes = hex::decode(body).map_err(|_| AddressParseError)?;
        if bytes.len() != 64 + ADDRESS_CHECKSUM_LEN {
            return Err(AddressParseError);
        }
        let (payload, checksum) = bytes.split_at(64);
        if checksum != &address_checksum(payload)[..ADDRESS_CHECKSUM_LEN] {
            return Err(AddressParseError);
        }
        let mut spend = [0u8; 32];
        let mut view = [0u8; 32];
        spend.copy_from_slice(&payload[..32]);
        view.copy_from_slice(&payload[32..]);
        Ok(AccountAddress {
            spend_public_key: PublicKey(spend),
            view_public_key: PublicKey(view),
        })
    }

    /// Decompose `amount` into canonical denominations.
    ///
    /// Splits the amount into decimal digit chunks (`digit * 10^k`), largest
    /// last. Digits that together stay at or below `dust_threshold` are
    /// accumulated and emitted as a single leading dust term. Zero amounts
    /// decompose to nothing.
    pub fn decompose_amount(&self, amount: u64, dust_threshold: u64) -> Vec<u64> {
        let mut decomposed = Vec::new();
        let mut dust = 0u64;
        let mut dust_emitted = false;
        let mut order = 1u64;
        let mut rest = amount;
        while rest != 0 {
            let chunk = (rest % 10) * order;
            rest /= 10;
            order = order.saturating_mul(10);
            if dust + chunk <= dust_threshold {
                dust += chunk;
            } else {
                if !dust_emitted && dust != 0 {
                    decomposed.push(dust);
                    dust_emitted = true;
                }
                if chunk != 0 {
                    decomposed.push(chunk);
                }
            }
        }
        if !dust_emitted && dust != 0 {
            decomposed.push(dust);
        }
        decomposed
    }
}

fn address_checksum(payload: &[u8]) -> Hash {
    hash_domain(b"obscura.address.checksum", payload)
}
