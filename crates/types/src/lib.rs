//! Foundation types for the Conclave consensus engine.
//!
//! This crate provides the types used throughout the engine:
//!
//! - **Identifiers**: `SchainId`, `NodeId`, `SchainIndex`, `BlockId`, ...
//! - **Primitives**: the BLAKE3 [`Hash`], signing keys, threshold shares
//! - **Committee**: fixed ordered membership with quorum math
//! - **Consensus data**: [`BlockProposal`], [`CommittedBlock`], [`DaProof`],
//!   persisted ABBA snapshots
//!
//! # Design Philosophy
//!
//! This crate is self-contained and depends on no other workspace crates,
//! making it the foundation layer. The signature scheme is a deterministic
//! stand-in with the contracts consensus needs (see [`crypto`]); a real
//! threshold backend slots in behind the same types.

mod bin_state;
mod block;
mod committee;
pub mod crypto;
mod da_proof;
mod hash;
mod identifiers;
mod proposal;

pub use bin_state::{BinStateRecord, BitPair};
pub use block::{BlockError, CommittedBlock, BLOCK_MAGIC};
pub use committee::{Committee, CommitteeError, NodeRecord};
pub use crypto::{
    block_sign_message, coin_message, coin_value, da_proof_message, verify_share,
    verify_signature, CryptoError, KeyPair, PublicKey, ShareOutcome, SigShare, SigShareSet,
    Signature, ThresholdSignature,
};
pub use da_proof::DaProof;
pub use hash::{Hash, Hasher, HexError};
pub use identifiers::{BinRound, BlockId, MsgId, NodeId, SchainId, SchainIndex};
pub use proposal::{BlockProposal, Transaction};

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    pub use crate::committee::test_committee;
    use crate::*;

    /// Build a signed proposal with deterministic contents for one seat.
    pub fn test_proposal(
        committee: &Committee,
        key: &KeyPair,
        block_id: BlockId,
        prev_hash: Hash,
    ) -> BlockProposal {
        let index = key.index();
        BlockProposal::build(
            committee.schain_id(),
            block_id,
            index,
            1_700_000_000 + block_id.0,
            0,
            prev_hash,
            vec![Transaction(
                format!("tx-{}-{}", block_id.0, index.0).into_bytes(),
            )],
            key,
        )
    }

    /// Aggregate a threshold signature over `message` from the first `q`
    /// keys.
    pub fn test_threshold(
        committee: &Committee,
        keys: &[KeyPair],
        message: &[u8],
    ) -> ThresholdSignature {
        let mut set = SigShareSet::new(message.to_vec(), committee.quorum());
        for key in keys.iter().take(committee.quorum() as usize) {
            set.add_share(key.sign_share(message), committee)
                .expect("test share is valid");
        }
        set.aggregate().expect("quorum reached")
    }
}
