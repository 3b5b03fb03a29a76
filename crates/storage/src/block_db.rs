//! Height-keyed persisted blocks (and chain metadata).

use crate::db::{Category, OrderedByteMap, StorageError};
use conclave_types::{BlockId, CommittedBlock};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::warn;

const LAST_COMMITTED_KEY: &[u8] = b"last_committed";
const LAST_TIMESTAMP_KEY: &[u8] = b"last_timestamp_s";

/// Default number of decoded blocks kept in memory.
const BLOCK_CACHE_SIZE: usize = 256;

/// Append-only, height-keyed block database.
pub struct BlockDb {
    store: Arc<dyn OrderedByteMap>,
    cache: Mutex<LruCache<BlockId, CommittedBlock>>,
}

impl BlockDb {
    pub fn new(store: Arc<dyn OrderedByteMap>) -> BlockDb {
        BlockDb {
            store,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(BLOCK_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    fn key(block_id: BlockId) -> [u8; 8] {
        block_id.0.to_be_bytes()
    }

    /// Persist a committed block. Append-only: re-saving an existing height
    /// is a no-op.
    pub fn save(&self, block: &CommittedBlock) -> Result<(), StorageError> {
        let key = Self::key(block.block_id());
        if self.store.get(Category::Blocks, &key)?.is_some() {
            return Ok(());
        }
        self.store
            .put(Category::Blocks, &key, &block.serialize())?;
        self.cache.lock().put(block.block_id(), block.clone());
        Ok(())
    }

    /// Fetch a block, from cache or disk. Returns `None` when absent.
    ///
    /// The cache is consulted only for valid heights (`block_id > 0`).
    pub fn get(&self, block_id: BlockId) -> Result<Option<CommittedBlock>, StorageError> {
        if block_id.0 == 0 {
            return Ok(None);
        }
        if let Some(block) = self.cache.lock().get(&block_id) {
            return Ok(Some(block.clone()));
        }
        let Some(bytes) = self.store.get(Category::Blocks, &Self::key(block_id))? else {
            return Ok(None);
        };
        CommittedBlock::serialized_sanity_check(&bytes).map_err(|e| StorageError::Corrupt {
            key: block_id.to_string(),
            reason: e.to_string(),
        })?;
        let block = CommittedBlock::deserialize(&bytes).map_err(|e| StorageError::Corrupt {
            key: block_id.to_string(),
            reason: e.to_string(),
        })?;
        self.cache.lock().put(block_id, block.clone());
        Ok(Some(block))
    }

    /// Update the committed watermark. Monotonic; a lower value than the
    /// stored one is refused.
    pub fn set_last_committed(
        &self,
        block_id: BlockId,
        timestamp_s: u64,
    ) -> Result<(), StorageError> {
        let (current, _) = self.last_committed()?;
        if block_id < current {
            warn!(
                stored = %current,
                requested = %block_id,
                "Refusing to move committed watermark backwards"
            );
            return Ok(());
        }
        self.store.put(
            Category::Meta,
            LAST_COMMITTED_KEY,
            &block_id.0.to_be_bytes(),
        )?;
        self.store.put(
            Category::Meta,
            LAST_TIMESTAMP_KEY,
            &timestamp_s.to_be_bytes(),
        )
    }

    /// The committed watermark: `(last committed id, its timestamp)`.
    /// `(0, 0)` for a fresh store.
    pub fn last_committed(&self) -> Result<(BlockId, u64), StorageError> {
        let id = self
            .store
            .get(Category::Meta, LAST_COMMITTED_KEY)?
            .map(|v| {
                let bytes: [u8; 8] = v.as_slice().try_into().unwrap_or([0; 8]);
                u64::from_be_bytes(bytes)
            })
            .unwrap_or(0);
        let ts = self
            .store
            .get(Category::Meta, LAST_TIMESTAMP_KEY)?
            .map(|v| {
                let bytes: [u8; 8] = v.as_slice().try_into().unwrap_or([0; 8]);
                u64::from_be_bytes(bytes)
            })
            .unwrap_or(0);
        Ok((BlockId(id), ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemStore;
    use conclave_types::test_utils::{test_committee, test_proposal, test_threshold};
    use conclave_types::{block_sign_message, Hash};

    fn sample_block(block_id: BlockId) -> CommittedBlock {
        let (committee, keys) = test_committee(4);
        let proposal = test_proposal(&committee, &keys[0], block_id, Hash::ZERO);
        let threshold_sig =
            test_threshold(&committee, &keys, &block_sign_message(&proposal.hash()));
        CommittedBlock {
            proposal,
            threshold_sig,
        }
    }

    fn db() -> BlockDb {
        BlockDb::new(Arc::new(MemStore::new().unwrap()))
    }

    #[test]
    fn test_save_and_get() {
        let db = db();
        let block = sample_block(BlockId(1));
        assert!(db.get(BlockId(1)).unwrap().is_none());
        db.save(&block).unwrap();
        assert_eq!(db.get(BlockId(1)).unwrap(), Some(block));
    }

    #[test]
    fn test_height_zero_is_never_a_block() {
        let db = db();
        assert!(db.get(BlockId(0)).unwrap().is_none());
    }

    #[test]
    fn test_save_is_append_only() {
        let db = db();
        let block = sample_block(BlockId(3));
        db.save(&block).unwrap();
        // Second save of the same height leaves the stored block intact.
        db.save(&block).unwrap();
        assert_eq!(db.get(BlockId(3)).unwrap(), Some(block));
    }

    #[test]
    fn test_watermark_is_monotonic() {
        let db = db();
        assert_eq!(db.last_committed().unwrap(), (BlockId(0), 0));
        db.set_last_committed(BlockId(5), 100).unwrap();
        db.set_last_committed(BlockId(3), 90).unwrap();
        assert_eq!(db.last_committed().unwrap(), (BlockId(5), 100));
        db.set_last_committed(BlockId(6), 110).unwrap();
        assert_eq!(db.last_committed().unwrap(), (BlockId(6), 110));
    }

    #[test]
    fn test_corrupt_record_is_surfaced() {
        let store = Arc::new(MemStore::new().unwrap());
        store
            .put(Category::Blocks, &BlockId(2).0.to_be_bytes(), b"garbage")
            .unwrap();
        let db = BlockDb::new(store);
        assert!(matches!(
            db.get(BlockId(2)),
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_survives_reopen() {
        let store = Arc::new(MemStore::new().unwrap());
        let block = sample_block(BlockId(7));
        {
            let db = BlockDb::new(store.clone());
            db.save(&block).unwrap();
            db.set_last_committed(BlockId(7), 1_700_000_007).unwrap();
        }
        let db = BlockDb::new(store);
        assert_eq!(db.get(BlockId(7)).unwrap(), Some(block));
        assert_eq!(
            db.last_committed().unwrap(),
            (BlockId(7), 1_700_000_007)
        );
    }
}
