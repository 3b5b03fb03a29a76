//! Persisted agreement snapshots and DA-proofs.

use crate::db::{Category, OrderedByteMap, StorageError};
use conclave_types::{BinStateRecord, BlockId, DaProof, SchainIndex};
use std::sync::Arc;

fn slot_key(block_id: BlockId, proposer_index: SchainIndex) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&block_id.0.to_be_bytes());
    key[8..].copy_from_slice(&proposer_index.0.to_be_bytes());
    key
}

fn height_prefix(block_id: BlockId) -> [u8; 8] {
    block_id.0.to_be_bytes()
}

/// ABBA snapshots keyed by `(block_id, proposer_index)`.
///
/// One record per slot, overwritten on every round transition; restart
/// resumes each in-flight instance from its latest snapshot.
pub struct BinStateDb {
    store: Arc<dyn OrderedByteMap>,
}

impl BinStateDb {
    pub fn new(store: Arc<dyn OrderedByteMap>) -> BinStateDb {
        BinStateDb { store }
    }

    pub fn put(&self, record: &BinStateRecord) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(record).expect("snapshot serialization cannot fail");
        self.store.put(
            Category::ConsensusState,
            &slot_key(record.block_id, record.proposer_index),
            &bytes,
        )
    }

    pub fn get(
        &self,
        block_id: BlockId,
        proposer_index: SchainIndex,
    ) -> Result<Option<BinStateRecord>, StorageError> {
        let Some(bytes) = self
            .store
            .get(Category::ConsensusState, &slot_key(block_id, proposer_index))?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: format!("{block_id}/{proposer_index}"),
                reason: e.to_string(),
            })
    }

    /// All snapshots for one height, in seat order.
    pub fn get_height(&self, block_id: BlockId) -> Result<Vec<BinStateRecord>, StorageError> {
        let mut out = Vec::new();
        for (key, bytes) in self
            .store
            .scan_prefix(Category::ConsensusState, &height_prefix(block_id))?
        {
            let record = serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                key: format!("{key:?}"),
                reason: e.to_string(),
            })?;
            out.push(record);
        }
        Ok(out)
    }

    /// Delete snapshots for heights below `block_id`.
    pub fn prune_below(&self, block_id: BlockId) -> Result<(), StorageError> {
        let bound = height_prefix(block_id);
        for (key, _) in self.store.scan_prefix(Category::ConsensusState, &[])? {
            if key.as_slice() < bound.as_slice() {
                self.store.delete(Category::ConsensusState, &key)?;
            }
        }
        Ok(())
    }
}

/// DA-proofs keyed by `(block_id, proposer_index)`.
pub struct DaProofDb {
    store: Arc<dyn OrderedByteMap>,
}

impl DaProofDb {
    pub fn new(store: Arc<dyn OrderedByteMap>) -> DaProofDb {
        DaProofDb { store }
    }

    pub fn put(&self, proof: &DaProof) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(proof).expect("proof serialization cannot fail");
        self.store.put(
            Category::DaProofs,
            &slot_key(proof.block_id, proof.proposer_index),
            &bytes,
        )
    }

    /// All proofs held for one height, in seat order.
    pub fn get_height(&self, block_id: BlockId) -> Result<Vec<DaProof>, StorageError> {
        let mut out = Vec::new();
        for (key, bytes) in self
            .store
            .scan_prefix(Category::DaProofs, &height_prefix(block_id))?
        {
            let proof = serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                key: format!("{key:?}"),
                reason: e.to_string(),
            })?;
            out.push(proof);
        }
        Ok(out)
    }

    /// Delete proofs for heights below `block_id`.
    pub fn prune_below(&self, block_id: BlockId) -> Result<(), StorageError> {
        let bound = height_prefix(block_id);
        for (key, _) in self.store.scan_prefix(Category::DaProofs, &[])? {
            if key.as_slice() < bound.as_slice() {
                self.store.delete(Category::DaProofs, &key)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemStore;
    use conclave_types::test_utils::{test_committee, test_threshold};
    use conclave_types::{da_proof_message, BinRound, BitPair, Hash};

    fn record(block: u64, proposer: u64, round: u64) -> BinStateRecord {
        BinStateRecord {
            block_id: BlockId(block),
            proposer_index: SchainIndex(proposer),
            round: BinRound(round),
            est: true,
            bin_values: BitPair::default(),
            aux_sent: BitPair::default(),
            decided: None,
        }
    }

    #[test]
    fn test_snapshot_overwrites_per_slot() {
        let db = BinStateDb::new(Arc::new(MemStore::new().unwrap()));
        db.put(&record(10, 2, 0)).unwrap();
        db.put(&record(10, 2, 1)).unwrap();
        let loaded = db.get(BlockId(10), SchainIndex(2)).unwrap().unwrap();
        assert_eq!(loaded.round, BinRound(1));
    }

    #[test]
    fn test_height_scan_is_seat_ordered() {
        let db = BinStateDb::new(Arc::new(MemStore::new().unwrap()));
        db.put(&record(10, 3, 0)).unwrap();
        db.put(&record(10, 1, 0)).unwrap();
        db.put(&record(11, 2, 0)).unwrap();
        let records = db.get_height(BlockId(10)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].proposer_index, SchainIndex(1));
        assert_eq!(records[1].proposer_index, SchainIndex(3));
    }

    #[test]
    fn test_prune_below_height() {
        let db = BinStateDb::new(Arc::new(MemStore::new().unwrap()));
        for h in 8..=12 {
            db.put(&record(h, 1, 0)).unwrap();
        }
        db.prune_below(BlockId(11)).unwrap();
        assert!(db.get(BlockId(10), SchainIndex(1)).unwrap().is_none());
        assert!(db.get(BlockId(11), SchainIndex(1)).unwrap().is_some());
        assert!(db.get(BlockId(12), SchainIndex(1)).unwrap().is_some());
    }

    #[test]
    fn test_da_proof_round_trip() {
        let (committee, keys) = test_committee(4);
        let db = DaProofDb::new(Arc::new(MemStore::new().unwrap()));
        let block_hash = Hash::digest(b"proposal");
        let proof = DaProof {
            block_id: BlockId(4),
            proposer_index: SchainIndex(2),
            block_hash,
            threshold_sig: test_threshold(&committee, &keys, &da_proof_message(&block_hash)),
        };
        db.put(&proof).unwrap();
        let held = db.get_height(BlockId(4)).unwrap();
        assert_eq!(held, vec![proof]);
        assert!(db.get_height(BlockId(5)).unwrap().is_empty());
    }
}
