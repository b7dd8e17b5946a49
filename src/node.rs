//! Node RPC seam.
//!
//! The wallet talks to a chain node for exactly two things: relaying a
//! freshly signed transaction and fetching random outputs to use as ring
//! decoys. Both calls suspend the calling task until the node answers;
//! implementations are free to run them over any transport.

use async_trait::async_trait;
use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::crypto::keys::PublicKey;
use crate::Hash;

/// Errors surfaced by the node. Wallet operations pass these through to the
/// caller unchanged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    #[error("transaction rejected by node: {0}")]
    RelayFailed(String),
    #[error("node request failed: {0}")]
    Request(String),
}

/// One decoy candidate: an output addressed by its global index within its
/// amount bucket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutEntry {
    pub global_amount_index: u32,
    pub out_key: PublicKey,
}

/// Random outputs the node returned for a single amount.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RandomAmountOuts {
    pub amount: u64,
    pub outs: Vec<OutEntry>,
}

/// The wire form a node accepts for relay.
///
/// The external transaction builder emits this structure bincode-encoded
/// from `transaction_data()`; [`decode_wire_transaction`] converts the blob
/// back before handing it to the node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireTransaction {
    pub unlock_time: u64,
    pub inputs: Vec<WireInput>,
    pub outputs: Vec<WireOutput>,
    pub extra: Vec<u8>,
    pub signatures: Vec<Vec<u8>>,
}

/// A ring input on the wire: amount bucket plus the ring member offsets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireInput {
    pub amount: u64,
    pub key_offsets: Vec<u32>,
    pub key_image: Hash,
}

/// A one-time key output on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireOutput {
    pub amount: u64,
    pub target_key: PublicKey,
}

/// Decode a builder-produced transaction blob into the node's wire form.
///
/// `limit` bounds the decoder's allocation; callers pass the currency's
/// relay size limit, which the blob has already been checked against.
pub fn decode_wire_transaction(data: &[u8], limit: usize) -> Option<WireTransaction> {
    bincode::DefaultOptions::new()
        .with_limit(limit as u64)
        .deserialize(data)
        .ok()
}

/// Encode a wire transaction the way `decode_wire_transaction` expects.
/// Builders and tests use this to produce relay blobs.
pub fn encode_wire_transaction(tx: &WireTransaction) -> Vec<u8> {
    bincode::DefaultOptions::new()
        .serialize(tx)
        .expect("wire transaction serialization cannot fail")
}

/// RPC surface of a chain node.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Relay a signed transaction to the network.
    async fn relay_transaction(&self, transaction: &WireTransaction) -> Result<(), NodeError>;

    /// Fetch up to `count` random outputs for every amount in `amounts`,
    /// used as ring decoys. Buckets come back in request order.
    async fn random_outputs_by_amounts(
        &self,
        amounts: Vec<u64>,
        count: u64,
    ) -> Result<Vec<RandomAmountOuts>, NodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> WireTransaction {
        WireTransaction {
            unlock_time: 9,
            inputs: vec![WireInput {
                amount: 700_000,
                key_offsets: vec![3, 17, 40],
                key_image: [2u8; 32],
            }],
            outputs: vec![WireOutput {
                amount: 700_000,
                target_key: PublicKey([5u8; 32]),
            }],
            extra: vec![1, 2, 3],
            signatures: vec![vec![0u8; 64]],
        }
    }

    #[test]
    fn wire_round_trip() {
        let tx = sample_tx();
        let blob = encode_wire_transaction(&tx);
        let decoded = decode_wire_transaction(&blob, blob.len()).unwrap();
        assert_eq!(decoded.unlock_time, tx.unlock_time);
        assert_eq!(decoded.inputs[0].key_offsets, tx.inputs[0].key_offsets);
        assert_eq!(decoded.outputs[0].amount, 700_000);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_wire_transaction(b"not a transaction", 1024).is_none());
    }
}
