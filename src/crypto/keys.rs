//! Key material for wallet accounts.
//!
//! A wallet holds exactly one view [`KeyPair`] plus one spend [`KeyPair`]
//! per address. The wallet core treats keys as opaque 32-byte values: ring
//! signatures, key images, and output derivation are the business of the
//! external transaction builder, which receives secret keys through
//! [`crate::transaction::AccountKeys`] and never hands them back.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{hash_domain, Hash};

/// A 32-byte public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}…)", hex::encode(&self.0[..8]))
    }
}

/// A 32-byte secret key. Zeroized on drop.
///
/// Inner bytes are `pub(crate)` so external crates can neither read nor
/// construct secret keys directly; use [`KeyPair::generate`] or
/// [`KeyPair::from_secret`].
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(pub(crate) [u8; 32]);

impl SecretKey {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(…)")
    }
}

/// A public/secret key pair.
///
/// Implements [`Clone`] because spend key pairs are handed to the
/// synchronizer inside subscriptions while the wallet record keeps its own
/// copy. The secret half is zeroized on drop via [`SecretKey`].
#[derive(Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        let pair = Self::from_secret(SecretKey(secret));
        secret.zeroize();
        pair
    }

    /// Rebuild a key pair from its secret half.
    ///
    /// The public key is derived deterministically, so a pair restored from
    /// a wallet file is identical to the originally generated one.
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = PublicKey(derive_public_key(&secret));
        KeyPair { public, secret }
    }
}

fn derive_public_key(secret: &SecretKey) -> Hash {
    hash_domain(b"obscura.keys.public", &secret.0)
}
