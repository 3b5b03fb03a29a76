//! Block proposals.

use crate::committee::Committee;
use crate::crypto::{verify_signature, CryptoError, KeyPair, Signature, DOMAIN_PROPOSAL};
use crate::hash::{Hash, Hasher};
use crate::identifiers::{BlockId, SchainId, SchainIndex};
use serde::{Deserialize, Serialize};

/// An opaque transaction batch entry.
///
/// The engine never inspects transaction contents; batches are ordered and
/// replicated as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction(pub Vec<u8>);

impl Transaction {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A block proposed by one committee member for one height.
///
/// The content hash covers every field except `signature`, in a fixed
/// canonical order, so honest nodes compute byte-identical hashes for the
/// same logical proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProposal {
    pub schain_id: SchainId,
    pub block_id: BlockId,
    pub proposer_index: SchainIndex,
    /// Proposal wall-clock timestamp, seconds part.
    pub timestamp_s: u64,
    /// Proposal wall-clock timestamp, millisecond remainder.
    pub timestamp_ms: u32,
    /// Hash of the previously committed block (`Hash::ZERO` at height 1).
    pub prev_hash: Hash,
    pub transactions: Vec<Transaction>,
    /// Proposer signature over the content hash.
    pub signature: Signature,
}

impl BlockProposal {
    /// Build and sign a proposal.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        schain_id: SchainId,
        block_id: BlockId,
        proposer_index: SchainIndex,
        timestamp_s: u64,
        timestamp_ms: u32,
        prev_hash: Hash,
        transactions: Vec<Transaction>,
        key: &KeyPair,
    ) -> BlockProposal {
        let mut proposal = BlockProposal {
            schain_id,
            block_id,
            proposer_index,
            timestamp_s,
            timestamp_ms,
            prev_hash,
            transactions,
            signature: Signature::zero(),
        };
        proposal.signature = key.sign(&proposal.signing_message());
        proposal
    }

    /// Canonical content hash over all fields except the signature.
    pub fn hash(&self) -> Hash {
        let mut h = Hasher::with_domain(DOMAIN_PROPOSAL);
        h.update_u64(self.schain_id.0)
            .update_u64(self.block_id.0)
            .update_u64(self.proposer_index.0)
            .update_u64(self.timestamp_s)
            .update_u64(self.timestamp_ms as u64)
            .update_bytes(self.prev_hash.as_bytes())
            .update_u64(self.transactions.len() as u64);
        for tx in &self.transactions {
            h.update_bytes(tx.as_bytes());
        }
        h.finalize()
    }

    fn signing_message(&self) -> Vec<u8> {
        self.hash().as_bytes().to_vec()
    }

    /// Verify the proposer signature against the committee.
    pub fn verify_signature(&self, committee: &Committee) -> Result<(), CryptoError> {
        let public_key = committee
            .public_key(self.proposer_index)
            .ok_or(CryptoError::UnknownSigner(self.proposer_index))?;
        verify_signature(&public_key, &self.signing_message(), &self.signature)
    }

    /// Encode for persistence: `magic || u64 BE body-length || JSON body`.
    pub fn serialize(&self) -> Vec<u8> {
        let body = serde_json::to_vec(self).expect("proposal serialization cannot fail");
        crate::block::encode_framed(&body)
    }

    /// Validate a serialized proposal's frame and decode it, rejecting
    /// proposals whose signature field is empty.
    pub fn deserialize(bytes: &[u8]) -> Result<BlockProposal, crate::block::BlockError> {
        let body = crate::block::framed_body(bytes)?;
        let proposal: BlockProposal = serde_json::from_slice(body)
            .map_err(|e| crate::block::BlockError::Decode(e.to_string()))?;
        if proposal.signature.is_zero() {
            return Err(crate::block::BlockError::Decode(
                "proposal signature is empty".to_string(),
            ));
        }
        Ok(proposal)
    }
}
