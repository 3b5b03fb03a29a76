//! Signing primitives and threshold-signature aggregation.
//!
//! The engine treats the signature scheme as an opaque primitive with two
//! contracts: ordinary signatures authenticate a single sender, and a
//! threshold signature over a message proves that `q = 2f+1` distinct
//! committee members signed it. The implementation here is a deterministic
//! BLAKE3-based stand-in for an external threshold scheme (the original
//! engine ships an equivalent mockup next to its BLS backend): it preserves
//! every property consensus relies on - shares are bound to a signer and a
//! message, aggregates require `q` distinct signers, and the aggregate is
//! *unique* for a given message regardless of which `q` shares produced it,
//! which is what makes the common coin globally agreed.

use crate::committee::Committee;
use crate::hash::{Hash, Hasher};
use crate::identifiers::{BinRound, BlockId, SchainId, SchainIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Domain tag for block-proposal signatures.
pub const DOMAIN_PROPOSAL: &[u8] = b"conclave:proposal";
/// Domain tag for DA signature shares over a proposal hash.
pub const DOMAIN_DA_PROOF: &[u8] = b"conclave:da";
/// Domain tag for block-signature shares over the committed proposal hash.
pub const DOMAIN_BLOCK_SIGN: &[u8] = b"conclave:blocksign";
/// Domain tag for common-coin shares.
pub const DOMAIN_COIN: &[u8] = b"conclave:coin";
/// Domain tag for consensus-message envelopes.
pub const DOMAIN_ENVELOPE: &[u8] = b"conclave:envelope";

/// Errors at the cryptographic boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("signer index {0} out of range 1..={1}")]
    SignerOutOfRange(u64, u64),
    #[error("share digest does not match message for signer {0}")]
    BadShare(SchainIndex),
    #[error("signature verification failed")]
    BadSignature,
    #[error("threshold signature has {got} signers, quorum is {quorum}")]
    NotEnoughSigners { got: usize, quorum: usize },
    #[error("duplicate signer {0} in threshold signature")]
    DuplicateSigner(SchainIndex),
    #[error("no public key for signer index {0}")]
    UnknownSigner(SchainIndex),
}

/// A node's public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

/// An ordinary single-signer signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub [u8; 32]);

impl Signature {
    /// Placeholder signature (used only by tests).
    pub fn zero() -> Signature {
        Signature([0u8; 32])
    }

    /// Whether this is the placeholder signature.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

/// A single signer's contribution toward a threshold signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigShare {
    /// Committee seat of the signer.
    pub signer: SchainIndex,
    /// Share digest, bound to the signer's key and the message.
    pub digest: [u8; 32],
}

/// A `q`-of-`n` threshold signature.
///
/// `digest` is a pure function of the signed message, so any quorum of
/// shares over the same message aggregates to the same value on every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSignature {
    /// The signer set, in ascending seat order.
    pub signers: Vec<SchainIndex>,
    /// The aggregate digest.
    pub digest: [u8; 32],
}

/// Signing key for one committee seat.
#[derive(Clone)]
pub struct KeyPair {
    index: SchainIndex,
    secret: [u8; 32],
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("KeyPair").field("index", &self.index).finish()
    }
}

impl KeyPair {
    /// Derive a key pair deterministically from a seed.
    pub fn from_seed(index: SchainIndex, seed: &[u8]) -> KeyPair {
        let mut h = Hasher::with_domain(b"conclave:key");
        h.update_u64(index.0).update_bytes(seed);
        KeyPair {
            index,
            secret: h.finalize().0,
        }
    }

    /// The seat this key signs for.
    pub fn index(&self) -> SchainIndex {
        self.index
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        let mut h = Hasher::with_domain(b"conclave:pub");
        h.update_bytes(&self.secret);
        PublicKey(h.finalize().0)
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(signature_digest(&self.public_key(), message).0)
    }

    /// Produce this signer's share over a message.
    pub fn sign_share(&self, message: &[u8]) -> SigShare {
        SigShare {
            signer: self.index,
            digest: share_digest(&self.public_key(), message).0,
        }
    }
}

fn signature_digest(public_key: &PublicKey, message: &[u8]) -> Hash {
    let mut h = Hasher::with_domain(b"conclave:sig");
    h.update_bytes(&public_key.0).update_bytes(message);
    h.finalize()
}

fn share_digest(public_key: &PublicKey, message: &[u8]) -> Hash {
    let mut h = Hasher::with_domain(b"conclave:share");
    h.update_bytes(&public_key.0).update_bytes(message);
    h.finalize()
}

fn aggregate_digest(message: &[u8]) -> Hash {
    let mut h = Hasher::with_domain(b"conclave:threshold");
    h.update_bytes(message);
    h.finalize()
}

/// Verify an ordinary signature against the claimed signer's public key.
pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), CryptoError> {
    if signature.0 == signature_digest(public_key, message).0 {
        Ok(())
    } else {
        Err(CryptoError::BadSignature)
    }
}

/// Verify a single share against the claimed signer's public key.
pub fn verify_share(
    public_key: &PublicKey,
    message: &[u8],
    share: &SigShare,
) -> Result<(), CryptoError> {
    if share.digest == share_digest(public_key, message).0 {
        Ok(())
    } else {
        Err(CryptoError::BadShare(share.signer))
    }
}

impl ThresholdSignature {
    /// Verify against a committee: `q` distinct in-range signers and the
    /// aggregate digest recomputed from the message.
    pub fn verify(&self, committee: &Committee, message: &[u8]) -> Result<(), CryptoError> {
        if self.signers.len() < committee.quorum() as usize {
            return Err(CryptoError::NotEnoughSigners {
                got: self.signers.len(),
                quorum: committee.quorum() as usize,
            });
        }
        let mut seen = std::collections::BTreeSet::new();
        for signer in &self.signers {
            if signer.0 == 0 || signer.0 > committee.n() {
                return Err(CryptoError::SignerOutOfRange(signer.0, committee.n()));
            }
            if !seen.insert(*signer) {
                return Err(CryptoError::DuplicateSigner(*signer));
            }
        }
        if self.digest != aggregate_digest(message).0 {
            return Err(CryptoError::BadSignature);
        }
        Ok(())
    }

    /// Hash of the aggregate, used to seed the proposer priority order.
    pub fn hash(&self) -> Hash {
        let mut h = Hasher::with_domain(b"conclave:threshold-hash");
        h.update_bytes(&self.digest);
        for signer in &self.signers {
            h.update_u64(signer.0);
        }
        h.finalize()
    }
}

/// Accumulates signature shares over one message until quorum.
///
/// Idempotent: re-adding a share for a signer that is already present is
/// reported as "no change". Shares are validated against the signer's
/// public key before insertion, so a completed set always aggregates.
#[derive(Debug, Clone)]
pub struct SigShareSet {
    message: Vec<u8>,
    quorum: u64,
    shares: BTreeMap<SchainIndex, SigShare>,
}

/// Result of adding a share to a [`SigShareSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    /// The share was inserted and the set is still short of quorum.
    Added,
    /// The share was inserted and the set just reached quorum.
    ReachedQuorum,
    /// A share from this signer was already present; nothing changed.
    Duplicate,
}

impl SigShareSet {
    /// New empty set over `message`.
    pub fn new(message: Vec<u8>, quorum: u64) -> SigShareSet {
        SigShareSet {
            message,
            quorum,
            shares: BTreeMap::new(),
        }
    }

    /// Validate and insert a share.
    pub fn add_share(
        &mut self,
        share: SigShare,
        committee: &Committee,
    ) -> Result<ShareOutcome, CryptoError> {
        if share.signer.0 == 0 || share.signer.0 > committee.n() {
            return Err(CryptoError::SignerOutOfRange(share.signer.0, committee.n()));
        }
        let public_key = committee
            .public_key(share.signer)
            .ok_or(CryptoError::UnknownSigner(share.signer))?;
        verify_share(&public_key, &self.message, &share)?;

        if self.shares.contains_key(&share.signer) {
            return Ok(ShareOutcome::Duplicate);
        }
        let was_below = (self.shares.len() as u64) < self.quorum;
        self.shares.insert(share.signer, share);
        if was_below && self.shares.len() as u64 >= self.quorum {
            Ok(ShareOutcome::ReachedQuorum)
        } else {
            Ok(ShareOutcome::Added)
        }
    }

    /// Number of distinct shares collected.
    pub fn len(&self) -> usize {
        self.shares.len()
    }

    /// Whether no share has been collected yet.
    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    /// Whether the set holds at least `q` shares.
    pub fn has_quorum(&self) -> bool {
        self.shares.len() as u64 >= self.quorum
    }

    /// Aggregate the first `q` shares (in seat order) into a threshold
    /// signature. Returns `None` below quorum.
    pub fn aggregate(&self) -> Option<ThresholdSignature> {
        if !self.has_quorum() {
            return None;
        }
        let signers: Vec<SchainIndex> = self
            .shares
            .keys()
            .take(self.quorum as usize)
            .copied()
            .collect();
        Some(ThresholdSignature {
            signers,
            digest: aggregate_digest(&self.message).0,
        })
    }

    /// The message the shares are over.
    pub fn message(&self) -> &[u8] {
        &self.message
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Signing message construction
// ═══════════════════════════════════════════════════════════════════════════

/// Message bytes for DA signature shares over a proposal hash.
pub fn da_proof_message(block_hash: &Hash) -> Vec<u8> {
    let mut m = Vec::with_capacity(DOMAIN_DA_PROOF.len() + 32);
    m.extend_from_slice(DOMAIN_DA_PROOF);
    m.extend_from_slice(block_hash.as_bytes());
    m
}

/// Message bytes for block-signature shares over the committed proposal hash.
pub fn block_sign_message(block_hash: &Hash) -> Vec<u8> {
    let mut m = Vec::with_capacity(DOMAIN_BLOCK_SIGN.len() + 32);
    m.extend_from_slice(DOMAIN_BLOCK_SIGN);
    m.extend_from_slice(block_hash.as_bytes());
    m
}

/// Message bytes for the common coin of one ABBA round.
pub fn coin_message(
    schain_id: SchainId,
    block_id: BlockId,
    proposer_index: SchainIndex,
    round: BinRound,
) -> Vec<u8> {
    let mut m = Vec::with_capacity(DOMAIN_COIN.len() + 32);
    m.extend_from_slice(DOMAIN_COIN);
    m.extend_from_slice(&schain_id.0.to_be_bytes());
    m.extend_from_slice(&block_id.0.to_be_bytes());
    m.extend_from_slice(&proposer_index.0.to_be_bytes());
    m.extend_from_slice(&round.0.to_be_bytes());
    m
}

/// Derive the common coin bit from a completed coin threshold signature.
pub fn coin_value(signature: &ThresholdSignature) -> bool {
    let mut h = Hasher::with_domain(b"conclave:coin-value");
    h.update_bytes(&signature.digest);
    h.finalize().0[0] & 1 == 1
}
