//! Data-availability proofs.

use crate::committee::Committee;
use crate::crypto::{da_proof_message, CryptoError, ThresholdSignature};
use crate::hash::Hash;
use crate::identifiers::{BlockId, SchainIndex};
use serde::{Deserialize, Serialize};

/// A threshold signature over one proposal's hash by `q` distinct committee
/// members, witnessing that a quorum holds the block bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaProof {
    pub block_id: BlockId,
    pub proposer_index: SchainIndex,
    pub block_hash: Hash,
    pub threshold_sig: ThresholdSignature,
}

impl DaProof {
    /// Verify the aggregate against the committee and the claimed hash.
    pub fn verify(&self, committee: &Committee) -> Result<(), CryptoError> {
        let message = da_proof_message(&self.block_hash);
        self.threshold_sig.verify(committee, &message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigShareSet;
    use crate::test_utils::test_committee;

    #[test]
    fn test_da_proof_verifies() {
        let (committee, keys) = test_committee(4);
        let block_hash = Hash::digest(b"proposal bytes");
        let message = da_proof_message(&block_hash);
        let mut shares = SigShareSet::new(message.clone(), committee.quorum());
        for k in &keys[1..4] {
            shares.add_share(k.sign_share(&message), &committee).unwrap();
        }
        let proof = DaProof {
            block_id: BlockId(9),
            proposer_index: SchainIndex(2),
            block_hash,
            threshold_sig: shares.aggregate().unwrap(),
        };
        proof.verify(&committee).unwrap();

        // A proof for a different hash must not verify.
        let wrong = DaProof {
            block_hash: Hash::digest(b"other bytes"),
            ..proof
        };
        assert!(wrong.verify(&committee).is_err());
    }
}
