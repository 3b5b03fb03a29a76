//! Content hash type.
//!
//! All content hashes in the engine are 32-byte BLAKE3 digests. The same
//! logical value always hashes to the same bytes on every node; this is what
//! makes proposal hashes, DA-proof subjects, and coin seeds comparable
//! across the committee.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A 32-byte BLAKE3 content hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

/// Error decoding a hash from hex.
#[derive(Debug, Error)]
pub enum HexError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("wrong length: expected 32 bytes, got {0}")]
    WrongLength(usize),
}

impl Hash {
    /// The all-zero hash, used as `prev_hash` of the first block.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Hash arbitrary bytes.
    pub fn digest(data: &[u8]) -> Hash {
        Hash(*blake3::hash(data).as_bytes())
    }

    /// Wrap raw digest bytes without hashing.
    pub fn from_hash_bytes(bytes: &[u8; 32]) -> Hash {
        Hash(*bytes)
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Hash, HexError> {
        let bytes = hex::decode(s).map_err(|e| HexError::InvalidHex(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| HexError::WrongLength(bytes.len()))?;
        Ok(Hash(arr))
    }

    /// Hex encoding of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 hex chars are enough to tell hashes apart in logs.
        write!(f, "Hash({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental hasher for canonical multi-field hashing.
///
/// Variable-length fields are length-prefixed so that field boundaries are
/// unambiguous and the encoding is canonical.
pub struct Hasher(blake3::Hasher);

impl Hasher {
    /// Start a new hash with a domain tag.
    pub fn with_domain(domain: &[u8]) -> Hasher {
        let mut h = blake3::Hasher::new();
        h.update(&(domain.len() as u64).to_be_bytes());
        h.update(domain);
        Hasher(h)
    }

    /// Append a fixed-width integer.
    pub fn update_u64(&mut self, v: u64) -> &mut Self {
        self.0.update(&v.to_be_bytes());
        self
    }

    /// Append a variable-length byte field, length-prefixed.
    pub fn update_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(&(bytes.len() as u64).to_be_bytes());
        self.0.update(bytes);
        self
    }

    /// Finish and return the digest.
    pub fn finalize(&self) -> Hash {
        Hash(*self.0.finalize().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic() {
        assert_eq!(Hash::digest(b"abc"), Hash::digest(b"abc"));
        assert_ne!(Hash::digest(b"abc"), Hash::digest(b"abd"));
    }

    #[test]
    fn test_hex_round_trip() {
        let h = Hash::digest(b"round trip");
        let parsed = Hash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn test_length_prefix_disambiguates_fields() {
        // ("ab", "c") and ("a", "bc") must hash differently.
        let mut h1 = Hasher::with_domain(b"test");
        h1.update_bytes(b"ab").update_bytes(b"c");
        let mut h2 = Hasher::with_domain(b"test");
        h2.update_bytes(b"a").update_bytes(b"bc");
        assert_ne!(h1.finalize(), h2.finalize());
    }
}
