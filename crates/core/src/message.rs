//! Message types exchanged between committee members.

use conclave_types::crypto::DOMAIN_ENVELOPE;
use conclave_types::{
    verify_signature, BinRound, BlockId, BlockProposal, Committee, CryptoError, DaProof, Hash,
    Hasher, KeyPair, MsgId, SchainIndex, SigShare, Signature,
};
use serde::{Deserialize, Serialize};

/// An item carried by the per-peer delivery queues.
///
/// Only proposals and DA-proofs ride the reliable queues; binary-consensus
/// traffic is fire-and-forget (consensus tolerates loss, the queues do not
/// need to carry it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundItem {
    Proposal(BlockProposal),
    DaProof(DaProof),
}

impl OutboundItem {
    /// The height this item belongs to.
    pub fn block_id(&self) -> BlockId {
        match self {
            OutboundItem::Proposal(p) => p.block_id,
            OutboundItem::DaProof(p) => p.block_id,
        }
    }

    /// Human-readable name for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundItem::Proposal(_) => "Proposal",
            OutboundItem::DaProof(_) => "DaProof",
        }
    }
}

/// Step of the binary-agreement protocol a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsensusKind {
    /// Binary-value broadcast.
    Bv,
    /// Auxiliary-value broadcast; carries the sender's coin share.
    Aux,
    /// Decision announcement.
    Commit,
}

/// One binary-consensus protocol message.
///
/// The envelope is signed by the sender; the coordinator verifies the
/// signature and the signer range before routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    /// Committee seat of the sender.
    pub src_index: SchainIndex,
    /// Per-sender monotonic message id.
    pub msg_id: MsgId,
    pub block_id: BlockId,
    pub proposer_index: SchainIndex,
    pub round: BinRound,
    pub kind: ConsensusKind,
    pub bit: bool,
    /// Present on `Aux` messages: the sender's share of this round's coin.
    pub coin_share: Option<SigShare>,
    /// Envelope signature over all fields above.
    pub signature: Signature,
}

impl ConsensusMessage {
    fn envelope_hash(&self) -> Hash {
        let mut h = Hasher::with_domain(DOMAIN_ENVELOPE);
        h.update_u64(self.src_index.0)
            .update_u64(self.msg_id.0)
            .update_u64(self.block_id.0)
            .update_u64(self.proposer_index.0)
            .update_u64(self.round.0)
            .update_u64(match self.kind {
                ConsensusKind::Bv => 0,
                ConsensusKind::Aux => 1,
                ConsensusKind::Commit => 2,
            })
            .update_u64(u64::from(self.bit));
        if let Some(share) = &self.coin_share {
            h.update_u64(share.signer.0).update_bytes(&share.digest);
        }
        h.finalize()
    }

    /// Sign the envelope in place.
    pub fn sign(&mut self, key: &KeyPair) {
        self.signature = key.sign(self.envelope_hash().as_bytes());
    }

    /// Verify the envelope signature against the committee.
    pub fn verify(&self, committee: &Committee) -> Result<(), CryptoError> {
        let public_key = committee
            .public_key(self.src_index)
            .ok_or(CryptoError::UnknownSigner(self.src_index))?;
        verify_signature(
            &public_key,
            self.envelope_hash().as_bytes(),
            &self.signature,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::test_utils::test_committee;

    fn sample_message(key: &KeyPair) -> ConsensusMessage {
        let mut msg = ConsensusMessage {
            src_index: key.index(),
            msg_id: MsgId(7),
            block_id: BlockId(3),
            proposer_index: SchainIndex(2),
            round: BinRound(0),
            kind: ConsensusKind::Bv,
            bit: true,
            coin_share: None,
            signature: Signature::zero(),
        };
        msg.sign(key);
        msg
    }

    #[test]
    fn test_envelope_signature_verifies() {
        let (committee, keys) = test_committee(4);
        let msg = sample_message(&keys[0]);
        msg.verify(&committee).unwrap();
    }

    #[test]
    fn test_tampered_envelope_rejected() {
        let (committee, keys) = test_committee(4);
        let mut msg = sample_message(&keys[0]);
        msg.bit = false;
        assert!(msg.verify(&committee).is_err());
    }

    #[test]
    fn test_spoofed_sender_rejected() {
        let (committee, keys) = test_committee(4);
        let mut msg = sample_message(&keys[0]);
        msg.src_index = SchainIndex(2);
        assert!(msg.verify(&committee).is_err());
    }

    #[test]
    fn test_wire_round_trip() {
        let (_, keys) = test_committee(4);
        let msg = sample_message(&keys[3]);
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: ConsensusMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }
}
