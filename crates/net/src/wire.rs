//! Wire framing and message envelope.
//!
//! Every peer connection begins with a 64-bit big-endian magic number;
//! mismatch terminates the connection. Thereafter each message is a 64-bit
//! big-endian length followed by a JSON object whose first field is
//! `"type"`.

use conclave_core::{ConsensusKind, ConsensusMessage, Event};
use conclave_types::{BlockId, BlockProposal, CommittedBlock, DaProof, Hash, SchainIndex, SigShare};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Connection magic: the ASCII bytes `CONCLAVE` as one big-endian word.
pub const WIRE_MAGIC: u64 = u64::from_be_bytes(*b"CONCLAVE");

/// Largest frame body we accept, protecting the reader from hostile length
/// prefixes.
pub const MAX_FRAME_LEN: u64 = 32 * 1024 * 1024;

/// Errors from the wire codec.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("bad magic: expected {WIRE_MAGIC:#018x}, got {0:#018x}")]
    BadMagic(u64),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(u64),
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("JSON decode error: {0}")]
    Decode(String),
    #[error("message type {tag} does not match consensus kind {kind:?}")]
    KindMismatch { tag: &'static str, kind: ConsensusKind },
}

/// All messages that cross the wire, tagged by `"type"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// A proposer pushes its block proposal (reliable queue path).
    #[serde(rename = "PROPOSAL_REQ")]
    ProposalReq { proposal: BlockProposal },

    /// A proposer pushes a completed DA-proof (reliable queue path).
    #[serde(rename = "DA_PROOF_REQ")]
    DaProofReq { proof: DaProof },

    /// The receiver of a proposal answers with its DA signature share on
    /// the reverse path.
    #[serde(rename = "DA_SHARE_RSP")]
    DaShareRsp {
        block_id: BlockId,
        proposer_index: SchainIndex,
        block_hash: Hash,
        share: SigShare,
    },

    /// Request committed blocks starting at a height.
    #[serde(rename = "CATCHUP_REQ")]
    CatchupReq { from_block: BlockId },

    /// Contiguous committed blocks answering a catch-up request.
    #[serde(rename = "CATCHUP_RSP")]
    CatchupRsp { blocks: Vec<CommittedBlock> },

    /// Block-signature share for a decided height.
    #[serde(rename = "BLOCK_SIGN_BROADCAST")]
    BlockSignBroadcast {
        block_id: BlockId,
        block_hash: Hash,
        share: SigShare,
    },

    /// Binary-value broadcast of one agreement instance.
    #[serde(rename = "BV_BROADCAST")]
    BvBroadcast { msg: ConsensusMessage },

    /// Auxiliary broadcast of one agreement instance.
    #[serde(rename = "AUX_BROADCAST")]
    AuxBroadcast { msg: ConsensusMessage },

    /// Decision announcement of one agreement instance.
    #[serde(rename = "CONSENSUS_COMMIT")]
    ConsensusCommit { msg: ConsensusMessage },
}

impl WireMessage {
    /// Wrap a consensus message in the wire variant matching its kind.
    pub fn from_consensus(msg: ConsensusMessage) -> WireMessage {
        match msg.kind {
            ConsensusKind::Bv => WireMessage::BvBroadcast { msg },
            ConsensusKind::Aux => WireMessage::AuxBroadcast { msg },
            ConsensusKind::Commit => WireMessage::ConsensusCommit { msg },
        }
    }

    /// Translate into the event the dispatch queue carries.
    ///
    /// `CatchupReq` is a server-side request, not an event; the runner
    /// answers it directly and gets `None` here. Consensus variants whose
    /// tag disagrees with the embedded `kind` are rejected.
    pub fn into_event(self) -> Result<Option<Event>, WireError> {
        let event = match self {
            WireMessage::ProposalReq { proposal } => Event::ProposalReceived { proposal },
            WireMessage::DaProofReq { proof } => Event::DaProofReceived { proof },
            WireMessage::DaShareRsp {
                block_id,
                proposer_index,
                block_hash,
                share,
            } => Event::DaShareReceived {
                block_id,
                proposer_index,
                block_hash,
                share,
            },
            WireMessage::CatchupReq { .. } => return Ok(None),
            WireMessage::CatchupRsp { blocks } => Event::CatchupBlocksReceived { blocks },
            WireMessage::BlockSignBroadcast {
                block_id,
                block_hash,
                share,
            } => Event::BlockSignShareReceived {
                block_id,
                block_hash,
                share,
            },
            WireMessage::BvBroadcast { msg } => {
                if msg.kind != ConsensusKind::Bv {
                    return Err(WireError::KindMismatch {
                        tag: "BV_BROADCAST",
                        kind: msg.kind,
                    });
                }
                Event::ConsensusReceived { msg }
            }
            WireMessage::AuxBroadcast { msg } => {
                if msg.kind != ConsensusKind::Aux {
                    return Err(WireError::KindMismatch {
                        tag: "AUX_BROADCAST",
                        kind: msg.kind,
                    });
                }
                Event::ConsensusReceived { msg }
            }
            WireMessage::ConsensusCommit { msg } => {
                if msg.kind != ConsensusKind::Commit {
                    return Err(WireError::KindMismatch {
                        tag: "CONSENSUS_COMMIT",
                        kind: msg.kind,
                    });
                }
                Event::ConsensusReceived { msg }
            }
        };
        Ok(Some(event))
    }
}

/// Encode the connection-opening magic.
pub fn encode_magic() -> [u8; 8] {
    WIRE_MAGIC.to_be_bytes()
}

/// Validate the 8 magic bytes a peer sent on connect.
pub fn check_magic(bytes: &[u8; 8]) -> Result<(), WireError> {
    let got = u64::from_be_bytes(*bytes);
    if got == WIRE_MAGIC {
        Ok(())
    } else {
        Err(WireError::BadMagic(got))
    }
}

/// Encode one message as `u64 BE length || JSON body`.
pub fn encode_frame(msg: &WireMessage) -> Vec<u8> {
    let body = serde_json::to_vec(msg).expect("wire serialization cannot fail");
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(body.len() as u64).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decode one message from the front of `bytes`; returns the message and
/// the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(WireMessage, usize), WireError> {
    if bytes.len() < 8 {
        return Err(WireError::Truncated {
            need: 8,
            have: bytes.len(),
        });
    }
    let len = u64::from_be_bytes(bytes[..8].try_into().expect("8-byte prefix"));
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let total = 8 + len as usize;
    if bytes.len() < total {
        return Err(WireError::Truncated {
            need: total,
            have: bytes.len(),
        });
    }
    let msg = serde_json::from_slice(&bytes[8..total]).map_err(|e| WireError::Decode(e.to_string()))?;
    Ok((msg, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::test_utils::{test_committee, test_proposal};
    use conclave_types::{BinRound, KeyPair, MsgId, Signature};

    fn consensus_msg(key: &KeyPair, kind: ConsensusKind) -> ConsensusMessage {
        let mut msg = ConsensusMessage {
            src_index: key.index(),
            msg_id: MsgId(1),
            block_id: BlockId(2),
            proposer_index: SchainIndex(3),
            round: BinRound(0),
            kind,
            bit: true,
            coin_share: None,
            signature: Signature::zero(),
        };
        msg.sign(key);
        msg
    }

    #[test]
    fn test_magic_round_trip() {
        check_magic(&encode_magic()).unwrap();
        assert!(check_magic(&[0; 8]).is_err());
    }

    #[test]
    fn test_frame_round_trip() {
        let (committee, keys) = test_committee(4);
        let msg = WireMessage::ProposalReq {
            proposal: test_proposal(&committee, &keys[0], BlockId(1), Hash::ZERO),
        };
        let bytes = encode_frame(&msg);
        let (decoded, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_type_field_is_first_class() {
        let (_, keys) = test_committee(4);
        let msg = WireMessage::BvBroadcast {
            msg: consensus_msg(&keys[0], ConsensusKind::Bv),
        };
        let bytes = encode_frame(&msg);
        let json: serde_json::Value = serde_json::from_slice(&bytes[8..]).unwrap();
        assert_eq!(json["type"], "BV_BROADCAST");
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let (committee, keys) = test_committee(4);
        let msg = WireMessage::ProposalReq {
            proposal: test_proposal(&committee, &keys[0], BlockId(1), Hash::ZERO),
        };
        let bytes = encode_frame(&msg);
        assert!(matches!(
            decode_frame(&bytes[..bytes.len() - 3]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_hostile_length_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u64::MAX.to_be_bytes());
        bytes.extend_from_slice(b"{}");
        assert!(matches!(
            decode_frame(&bytes),
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let (_, keys) = test_committee(4);
        // An AUX message smuggled under a BV tag must not dispatch.
        let msg = WireMessage::BvBroadcast {
            msg: consensus_msg(&keys[0], ConsensusKind::Aux),
        };
        assert!(matches!(
            msg.into_event(),
            Err(WireError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_catchup_req_is_not_an_event() {
        let msg = WireMessage::CatchupReq {
            from_block: BlockId(100),
        };
        assert!(msg.into_event().unwrap().is_none());
    }
}
