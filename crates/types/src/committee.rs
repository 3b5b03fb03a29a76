//! Committee membership.
//!
//! A schain runs on a fixed, ordered committee of `n` nodes. The committee
//! is the single source of truth for membership, quorum math, and public
//! keys; everything that validates a signer consults it.

use crate::crypto::PublicKey;
use crate::identifiers::{NodeId, SchainId, SchainIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One committee member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    /// Seat in the committee, `1..=n`.
    pub schain_index: SchainIndex,
    pub ip: String,
    pub base_port: u16,
    pub public_key: PublicKey,
}

/// Errors constructing a committee.
#[derive(Debug, Error)]
pub enum CommitteeError {
    #[error("committee needs at least 4 nodes, got {0}")]
    TooSmall(usize),
    #[error("seat indices must be exactly 1..=n, found {0}")]
    BadIndex(SchainIndex),
    #[error("duplicate node id {0}")]
    DuplicateNodeId(NodeId),
}

/// The fixed ordered committee of a schain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Committee {
    schain_id: SchainId,
    /// Records sorted by seat, `records[i].schain_index == i + 1`.
    records: Vec<NodeRecord>,
}

impl Committee {
    /// Build a committee, validating seat numbering and uniqueness.
    pub fn new(schain_id: SchainId, mut records: Vec<NodeRecord>) -> Result<Committee, CommitteeError> {
        if records.len() < 4 {
            return Err(CommitteeError::TooSmall(records.len()));
        }
        records.sort_by_key(|r| r.schain_index);
        let mut seen_ids = std::collections::BTreeSet::new();
        for (i, record) in records.iter().enumerate() {
            if record.schain_index.0 != (i + 1) as u64 {
                return Err(CommitteeError::BadIndex(record.schain_index));
            }
            if !seen_ids.insert(record.node_id) {
                return Err(CommitteeError::DuplicateNodeId(record.node_id));
            }
        }
        Ok(Committee { schain_id, records })
    }

    /// The schain this committee serves.
    pub fn schain_id(&self) -> SchainId {
        self.schain_id
    }

    /// Committee size `n`.
    pub fn n(&self) -> u64 {
        self.records.len() as u64
    }

    /// Fault tolerance `f = ⌊(n-1)/3⌋`.
    pub fn f(&self) -> u64 {
        (self.n() - 1) / 3
    }

    /// Quorum `q = 2f + 1`.
    pub fn quorum(&self) -> u64 {
        2 * self.f() + 1
    }

    /// Whether `index` is a valid seat.
    pub fn contains(&self, index: SchainIndex) -> bool {
        index.0 >= 1 && index.0 <= self.n()
    }

    /// Record at a seat.
    pub fn record(&self, index: SchainIndex) -> Option<&NodeRecord> {
        if self.contains(index) {
            Some(&self.records[(index.0 - 1) as usize])
        } else {
            None
        }
    }

    /// Public key at a seat.
    pub fn public_key(&self, index: SchainIndex) -> Option<PublicKey> {
        self.record(index).map(|r| r.public_key)
    }

    /// Seat of a node id, if it is a member.
    pub fn index_of(&self, node_id: NodeId) -> Option<SchainIndex> {
        self.records
            .iter()
            .find(|r| r.node_id == node_id)
            .map(|r| r.schain_index)
    }

    /// All seats in ascending order.
    pub fn seats(&self) -> impl Iterator<Item = SchainIndex> + '_ {
        self.records.iter().map(|r| r.schain_index)
    }

    /// All records in seat order.
    pub fn records(&self) -> &[NodeRecord] {
        &self.records
    }
}

/// Build a deterministic test committee of `n` nodes with seeded keys.
///
/// Returns the committee and the key pair for every seat (seat `i` is at
/// `keys[i - 1]`).
#[cfg(any(test, feature = "test-utils"))]
pub fn test_committee(n: u64) -> (Committee, Vec<crate::crypto::KeyPair>) {
    use crate::crypto::KeyPair;
    let keys: Vec<KeyPair> = (1..=n)
        .map(|i| {
            let mut seed = [0u8; 16];
            seed[..8].copy_from_slice(&i.to_le_bytes());
            seed[8..].copy_from_slice(&0x517cc1b727220a95u64.to_le_bytes());
            KeyPair::from_seed(SchainIndex(i), &seed)
        })
        .collect();
    let records = keys
        .iter()
        .enumerate()
        .map(|(i, k)| NodeRecord {
            node_id: NodeId(100 + i as u64),
            schain_index: SchainIndex(i as u64 + 1),
            ip: format!("10.0.0.{}", i + 1),
            base_port: 26_000 + i as u16 * 10,
            public_key: k.public_key(),
        })
        .collect();
    let committee = Committee::new(SchainId(1), records).expect("test committee is valid");
    (committee, keys)
}
