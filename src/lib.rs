//! # Obscura wallet core
//!
//! The state machine of a multi-address wallet for CryptoNote-family chains:
//! - **One view key, many spend keys** — every address shares the wallet's
//!   view key pair and owns its own spend key pair
//! - **Ledger under concurrent callbacks** — transactions and transfers are
//!   reconciled with events pushed by an external blockchain synchronizer
//! - **Randomized UTXO selection** — outputs are drawn across addresses with
//!   a dust policy tied to the requested mixin size
//! - **Ring-signature pipeline** — decoy request, input ordering, amount
//!   decomposition, and signing are driven through an external builder
//!
//! The heavy collaborators (synchronizer, node RPC, low-level transaction
//! builder) live behind trait seams in [`sync`], [`node`], and
//! [`transaction`]; the wallet itself is in [`wallet`].

pub mod crypto;
pub mod currency;
pub mod node;
pub mod sync;
pub mod transaction;
pub mod wallet;

/// Protocol constants
pub mod constants {
    /// Outputs at or below this amount are dust: excluded from normal
    /// selection because their anonymity set is too small.
    pub const DUST_THRESHOLD: u64 = 10_000;
    /// Extra blocks beyond the consensus unlock time during which incoming
    /// funds and change stay pending.
    pub const WALLET_SOFTLOCK_BLOCKS_COUNT: u32 = 1;
    /// Blocks a key output must age before the synchronizer reports it as
    /// spendable.
    pub const TRANSACTION_SPENDABLE_AGE: u32 = 10;
    /// New subscriptions start scanning this many seconds in the past so a
    /// freshly created address catches payments already in flight.
    pub const SYNC_TIMESTAMP_WINDOW: u64 = 60 * 60 * 24;
    /// Sentinel block height for transactions not yet included in a block.
    pub const UNCONFIRMED_TRANSACTION_HEIGHT: u32 = u32::MAX;
}

/// 32-byte hash used throughout the wallet
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid UTF-8 (all Obscura domains use ASCII).
/// Panics at runtime if domain is not valid UTF-8 — this is a programming error.
pub fn hash_domain(domain: &[u8], data: &[u8]) -> Hash {
    let domain_str = std::str::from_utf8(domain).expect("hash_domain: domain must be valid UTF-8");
    let mut hasher = blake3::Hasher::new_derive_key(domain_str);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Constant-time comparison of two byte slices.
///
/// Returns true only if the slices have equal length and identical contents.
/// Uses the `subtle` crate's audited constant-time operations.
///
/// Note: The length comparison is NOT constant-time (leaks whether lengths
/// match). Acceptable here: lengths are not secret, contents are.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
