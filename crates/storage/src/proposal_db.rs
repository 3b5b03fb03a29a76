//! Proposal store: LRU cache for everyone's proposals, disk only for our
//! own.
//!
//! Remote proposals can be re-fetched from their proposer during catch-up,
//! so only the local node's proposals survive a restart.

use crate::db::{Category, OrderedByteMap, StorageError};
use conclave_types::{BlockId, BlockProposal, SchainIndex};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;

/// Cached proposals per committee seat.
const PROPOSAL_CACHE_SIZE: usize = 3;

/// Keyed by `(block_id, proposer_index)`.
pub struct ProposalDb {
    store: Arc<dyn OrderedByteMap>,
    own_index: SchainIndex,
    cache: Mutex<LruCache<(BlockId, SchainIndex), BlockProposal>>,
}

impl ProposalDb {
    pub fn new(store: Arc<dyn OrderedByteMap>, own_index: SchainIndex, n: u64) -> ProposalDb {
        let capacity = NonZeroUsize::new(n as usize * PROPOSAL_CACHE_SIZE)
            .expect("committee is non-empty");
        ProposalDb {
            store,
            own_index,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn key(block_id: BlockId, proposer_index: SchainIndex) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&block_id.0.to_be_bytes());
        key[8..].copy_from_slice(&proposer_index.0.to_be_bytes());
        key
    }

    /// Cache a proposal; persist it when it is our own.
    pub fn put(&self, proposal: &BlockProposal) -> Result<(), StorageError> {
        trace!(
            block_id = %proposal.block_id,
            proposer = %proposal.proposer_index,
            "Storing proposal"
        );
        let slot = (proposal.block_id, proposal.proposer_index);
        {
            let mut cache = self.cache.lock();
            if !cache.contains(&slot) {
                cache.put(slot, proposal.clone());
            }
        }
        if proposal.proposer_index != self.own_index {
            return Ok(());
        }
        self.store.put(
            Category::Proposals,
            &Self::key(proposal.block_id, proposal.proposer_index),
            &proposal.serialize(),
        )
    }

    /// Fetch a proposal. Remote proposals come from the cache only; our own
    /// fall back to disk with a frame sanity check.
    pub fn get(
        &self,
        block_id: BlockId,
        proposer_index: SchainIndex,
    ) -> Result<Option<BlockProposal>, StorageError> {
        if let Some(p) = self.cache.lock().get(&(block_id, proposer_index)) {
            return Ok(Some(p.clone()));
        }
        if proposer_index != self.own_index {
            return Ok(None);
        }
        let Some(bytes) = self
            .store
            .get(Category::Proposals, &Self::key(block_id, proposer_index))?
        else {
            return Ok(None);
        };
        let proposal = BlockProposal::deserialize(&bytes).map_err(|e| StorageError::Corrupt {
            key: format!("{block_id}/{proposer_index}"),
            reason: e.to_string(),
        })?;
        self.cache
            .lock()
            .put((block_id, proposer_index), proposal.clone());
        Ok(Some(proposal))
    }

    /// Whether a proposal for the slot is held (cache or own-disk).
    pub fn exists(
        &self,
        block_id: BlockId,
        proposer_index: SchainIndex,
    ) -> Result<bool, StorageError> {
        if self.cache.lock().contains(&(block_id, proposer_index)) {
            return Ok(true);
        }
        if proposer_index != self.own_index {
            return Ok(false);
        }
        Ok(self
            .store
            .get(Category::Proposals, &Self::key(block_id, proposer_index))?
            .is_some())
    }

    /// Delete persisted own proposals below a height.
    pub fn prune_below(&self, block_id: BlockId) -> Result<(), StorageError> {
        let bound = Self::key(block_id, SchainIndex(0));
        for (key, _) in self.store.scan_prefix(Category::Proposals, &[])? {
            if key.as_slice() < bound.as_slice() {
                self.store.delete(Category::Proposals, &key)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemStore;
    use conclave_types::test_utils::{test_committee, test_proposal};
    use conclave_types::Hash;

    #[test]
    fn test_own_proposal_survives_cache_eviction() {
        let (committee, keys) = test_committee(4);
        let db = ProposalDb::new(
            Arc::new(MemStore::new().unwrap()),
            SchainIndex(1),
            committee.n(),
        );
        let own = test_proposal(&committee, &keys[0], BlockId(1), Hash::ZERO);
        db.put(&own).unwrap();

        // Flood the cache far past capacity.
        for h in 2..40 {
            let p = test_proposal(&committee, &keys[1], BlockId(h), Hash::ZERO);
            db.put(&p).unwrap();
        }

        assert_eq!(db.get(BlockId(1), SchainIndex(1)).unwrap(), Some(own));
    }

    #[test]
    fn test_remote_proposal_is_cache_only() {
        let (committee, keys) = test_committee(4);
        let db = ProposalDb::new(
            Arc::new(MemStore::new().unwrap()),
            SchainIndex(1),
            committee.n(),
        );
        let remote = test_proposal(&committee, &keys[2], BlockId(1), Hash::ZERO);
        db.put(&remote).unwrap();
        assert!(db.exists(BlockId(1), SchainIndex(3)).unwrap());

        for h in 2..40 {
            let p = test_proposal(&committee, &keys[1], BlockId(h), Hash::ZERO);
            db.put(&p).unwrap();
        }

        // Evicted and never persisted.
        assert_eq!(db.get(BlockId(1), SchainIndex(3)).unwrap(), None);
        assert!(!db.exists(BlockId(1), SchainIndex(3)).unwrap());
    }

    #[test]
    fn test_first_proposal_for_slot_wins_cache() {
        let (committee, keys) = test_committee(4);
        let db = ProposalDb::new(
            Arc::new(MemStore::new().unwrap()),
            SchainIndex(4),
            committee.n(),
        );
        let first = test_proposal(&committee, &keys[1], BlockId(1), Hash::ZERO);
        let conflicting = test_proposal(&committee, &keys[1], BlockId(1), Hash::digest(b"x"));
        db.put(&first).unwrap();
        db.put(&conflicting).unwrap();
        assert_eq!(db.get(BlockId(1), SchainIndex(2)).unwrap(), Some(first));
    }

    #[test]
    fn test_prune_below() {
        let (committee, keys) = test_committee(4);
        let store = Arc::new(MemStore::new().unwrap());
        let db = ProposalDb::new(store.clone(), SchainIndex(1), committee.n());
        for h in 1..=5 {
            db.put(&test_proposal(&committee, &keys[0], BlockId(h), Hash::ZERO))
                .unwrap();
        }
        db.prune_below(BlockId(4)).unwrap();

        // A fresh instance over the same backing store has a cold cache, so
        // reads go to disk.
        let reopened = ProposalDb::new(store, SchainIndex(1), committee.n());
        assert!(reopened.get(BlockId(3), SchainIndex(1)).unwrap().is_none());
        assert!(reopened.get(BlockId(4), SchainIndex(1)).unwrap().is_some());
        assert!(reopened.get(BlockId(5), SchainIndex(1)).unwrap().is_some());
    }
}
