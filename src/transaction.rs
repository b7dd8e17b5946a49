//! Low-level transaction builder seam.
//!
//! The wallet core never touches ring-signature math. It assembles the
//! inputs (real output plus ordered decoys), decomposes the outputs, and
//! drives an external [`TransactionBuilder`] through the add/sign sequence.
//! A [`TransactionFactory`] mints one builder per transfer; the builder is
//! uniquely owned for the duration of the pipeline.

use crate::crypto::keys::{KeyPair, PublicKey, SecretKey};
use crate::currency::AccountAddress;
use crate::Hash;

/// Full key material for one address: the shared view keys plus the
/// address's own spend keys. Handed to the builder when adding an input so
/// it can derive the ephemeral signing key.
#[derive(Clone)]
pub struct AccountKeys {
    pub address: AccountAddress,
    pub view_secret_key: SecretKey,
    pub spend_secret_key: SecretKey,
}

/// One ring member: an output identified by its global index within the
/// amount bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalOutput {
    pub output_index: u32,
    pub target_key: PublicKey,
}

/// Position of the real output inside an input's ring.
#[derive(Clone, Debug)]
pub struct RealOutputRef {
    pub transaction_public_key: PublicKey,
    /// Index of the real member within [`InputKeyInfo::outputs`].
    pub transaction_index: usize,
    pub output_in_transaction: u32,
}

/// Everything the builder needs to sign one input: the amount bucket, the
/// ordered ring (decoys plus the real output), and which member is real.
#[derive(Clone, Debug)]
pub struct InputKeyInfo {
    pub amount: u64,
    pub outputs: Vec<GlobalOutput>,
    pub real_output: RealOutputRef,
}

/// Decomposed amounts for one receiver.
#[derive(Clone, Debug)]
pub struct ReceiverAmounts {
    pub receiver: AccountAddress,
    pub amounts: Vec<u64>,
}

/// An in-progress transaction owned by the wallet while it builds and signs.
///
/// Call order: `add_output` for every decomposed amount, `set_unlock_time`,
/// `append_extra`, `add_input` for every selected UTXO (keeping the returned
/// ephemeral keys), then `sign_input_key` for each input in insertion order.
pub trait TransactionBuilder: Send {
    fn add_output(&mut self, amount: u64, receiver: &AccountAddress);

    /// Add a ring input. Returns the ephemeral key pair derived for the real
    /// output; the caller passes it back to [`sign_input_key`].
    ///
    /// [`sign_input_key`]: TransactionBuilder::sign_input_key
    fn add_input(&mut self, keys: &AccountKeys, input: &InputKeyInfo) -> KeyPair;

    fn set_unlock_time(&mut self, unlock_time: u64);

    fn append_extra(&mut self, extra: &[u8]);

    fn sign_input_key(&mut self, index: usize, input: &InputKeyInfo, ephemeral: &KeyPair);

    fn transaction_hash(&self) -> Hash;

    /// Serialized transaction, bincode-encoded in the node's wire form.
    fn transaction_data(&self) -> Vec<u8>;

    fn extra(&self) -> Vec<u8>;
}

/// Mints builders. Implemented by the cryptographic backend.
pub trait TransactionFactory: Send + Sync {
    fn create_transaction(&self) -> Box<dyn TransactionBuilder>;
}
