//! Committed blocks and their on-disk encoding.

use crate::committee::Committee;
use crate::crypto::{block_sign_message, CryptoError, ThresholdSignature};
use crate::hash::Hash;
use crate::identifiers::BlockId;
use crate::proposal::BlockProposal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First byte of every serialized committed block.
pub const BLOCK_MAGIC: u8 = 0x33;

/// Bytes of header before the JSON body: magic + u64 length.
const HEADER_LEN: usize = 1 + 8;

/// Errors decoding a serialized block.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("serialized block too short: {0} bytes")]
    TooShort(usize),
    #[error("bad magic byte: {0:#04x}")]
    BadMagic(u8),
    #[error("length prefix {prefix} does not match body length {body}")]
    LengthMismatch { prefix: u64, body: usize },
    #[error("body decode failed: {0}")]
    Decode(String),
    #[error("block signature invalid: {0}")]
    Signature(#[from] CryptoError),
}

/// A block finalized by consensus: the winning proposal plus the aggregate
/// block signature from `q` distinct committee members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedBlock {
    pub proposal: BlockProposal,
    pub threshold_sig: ThresholdSignature,
}

/// Frame a JSON body as `magic || u64 BE body-length || body`.
pub(crate) fn encode_framed(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(BLOCK_MAGIC);
    out.extend_from_slice(&(body.len() as u64).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Validate the frame header and return the body.
pub(crate) fn framed_body(bytes: &[u8]) -> Result<&[u8], BlockError> {
    if bytes.len() < HEADER_LEN {
        return Err(BlockError::TooShort(bytes.len()));
    }
    if bytes[0] != BLOCK_MAGIC {
        return Err(BlockError::BadMagic(bytes[0]));
    }
    let prefix = u64::from_be_bytes(bytes[1..9].try_into().expect("9-byte header"));
    let body = &bytes[HEADER_LEN..];
    if prefix != body.len() as u64 {
        return Err(BlockError::LengthMismatch {
            prefix,
            body: body.len(),
        });
    }
    Ok(body)
}

impl CommittedBlock {
    pub fn block_id(&self) -> BlockId {
        self.proposal.block_id
    }

    /// Content hash of the underlying proposal.
    pub fn hash(&self) -> Hash {
        self.proposal.hash()
    }

    /// Verify the aggregate block signature against the committee.
    pub fn verify(&self, committee: &Committee) -> Result<(), BlockError> {
        let message = block_sign_message(&self.hash());
        self.threshold_sig.verify(committee, &message)?;
        Ok(())
    }

    /// Encode as `magic || u64 BE body-length || JSON body`.
    pub fn serialize(&self) -> Vec<u8> {
        let body = serde_json::to_vec(self).expect("block serialization cannot fail");
        encode_framed(&body)
    }

    /// Validate the header of a serialized block without decoding the body.
    pub fn serialized_sanity_check(bytes: &[u8]) -> Result<(), BlockError> {
        framed_body(bytes).map(|_| ())
    }

    /// Decode a serialized block, sanity-checking the header first.
    pub fn deserialize(bytes: &[u8]) -> Result<CommittedBlock, BlockError> {
        let body = framed_body(bytes)?;
        serde_json::from_slice(body).map_err(|e| BlockError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{SigShareSet, da_proof_message};
    use crate::identifiers::{SchainId, SchainIndex};
    use crate::proposal::Transaction;
    use crate::test_utils::test_committee;

    fn sample_block() -> (Committee, CommittedBlock) {
        let (committee, keys) = test_committee(4);
        let proposal = BlockProposal::build(
            SchainId(1),
            BlockId(1),
            SchainIndex(2),
            1_700_000_000,
            42,
            Hash::ZERO,
            vec![Transaction(b"payload".to_vec())],
            &keys[1],
        );
        let message = block_sign_message(&proposal.hash());
        let mut shares = SigShareSet::new(message.clone(), committee.quorum());
        for k in &keys[0..3] {
            shares.add_share(k.sign_share(&message), &committee).unwrap();
        }
        let threshold_sig = shares.aggregate().unwrap();
        (
            committee,
            CommittedBlock {
                proposal,
                threshold_sig,
            },
        )
    }

    #[test]
    fn test_serialize_round_trip() {
        let (committee, block) = sample_block();
        let bytes = block.serialize();
        assert_eq!(bytes[0], BLOCK_MAGIC);
        let decoded = CommittedBlock::deserialize(&bytes).unwrap();
        assert_eq!(decoded, block);
        decoded.verify(&committee).unwrap();
    }

    #[test]
    fn test_sanity_check_rejects_bad_magic() {
        let (_, block) = sample_block();
        let mut bytes = block.serialize();
        bytes[0] = 0x44;
        assert!(matches!(
            CommittedBlock::serialized_sanity_check(&bytes),
            Err(BlockError::BadMagic(0x44))
        ));
    }

    #[test]
    fn test_sanity_check_rejects_truncation() {
        let (_, block) = sample_block();
        let bytes = block.serialize();
        assert!(matches!(
            CommittedBlock::serialized_sanity_check(&bytes[..bytes.len() - 1]),
            Err(BlockError::LengthMismatch { .. })
        ));
        assert!(matches!(
            CommittedBlock::serialized_sanity_check(&bytes[..4]),
            Err(BlockError::TooShort(4))
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_subject() {
        let (committee, mut block) = sample_block();
        // Threshold signature over the DA domain must not verify as a block
        // signature.
        let message = da_proof_message(&block.hash());
        let (_, keys) = test_committee(4);
        let mut shares = SigShareSet::new(message.clone(), committee.quorum());
        for k in &keys[0..3] {
            shares.add_share(k.sign_share(&message), &committee).unwrap();
        }
        block.threshold_sig = shares.aggregate().unwrap();
        assert!(block.verify(&committee).is_err());
    }
}
