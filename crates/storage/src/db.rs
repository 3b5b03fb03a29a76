//! Ordered byte-map abstraction and its backends.
//!
//! The engine treats the embedded key-value store as an ordered byte-map
//! with prefix iteration; everything above this module works against the
//! [`OrderedByteMap`] trait. Production uses RocksDB with one column family
//! per category, the simulation harness uses an in-memory BTreeMap.

use parking_lot::RwLock;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// On-disk format version, written per store and validated on open.
pub const FORMAT_VERSION: &str = "1.0";

const FORMAT_VERSION_KEY: &[u8] = b"format_version";

/// Storage categories. Keys within a category encode
/// `(block_id, secondary)` big-endian so prefix scans enumerate a height in
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Blocks,
    Proposals,
    DaProofs,
    ConsensusState,
    Meta,
}

impl Category {
    /// All categories, in column-family creation order.
    pub const ALL: [Category; 5] = [
        Category::Blocks,
        Category::Proposals,
        Category::DaProofs,
        Category::ConsensusState,
        Category::Meta,
    ];

    /// Column-family / map name.
    pub fn name(&self) -> &'static str {
        match self {
            Category::Blocks => "blocks",
            Category::Proposals => "proposals",
            Category::DaProofs => "da_proofs",
            Category::ConsensusState => "consensus_state",
            Category::Meta => "meta",
        }
    }
}

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("store format version {found:?} does not match {expected:?}")]
    FormatVersion { found: String, expected: String },
    #[error("corrupt record under key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// An ordered byte-map with prefix iteration.
pub trait OrderedByteMap: Send + Sync {
    fn get(&self, category: Category, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, category: Category, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn delete(&self, category: Category, key: &[u8]) -> Result<(), StorageError>;

    /// All `(key, value)` pairs whose key starts with `prefix`, in key
    /// order.
    fn scan_prefix(
        &self,
        category: Category,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
}

/// Validate (or initialize) the format-version tag of a freshly opened
/// store.
fn check_format_version(store: &dyn OrderedByteMap) -> Result<(), StorageError> {
    match store.get(Category::Meta, FORMAT_VERSION_KEY)? {
        None => store.put(Category::Meta, FORMAT_VERSION_KEY, FORMAT_VERSION.as_bytes()),
        Some(found) if found == FORMAT_VERSION.as_bytes() => Ok(()),
        Some(found) => Err(StorageError::FormatVersion {
            found: String::from_utf8_lossy(&found).into_owned(),
            expected: FORMAT_VERSION.to_string(),
        }),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RocksDB backend
// ═══════════════════════════════════════════════════════════════════════════

/// RocksDB-based store for production use.
///
/// One column family per [`Category`]. All operations are synchronous
/// blocking I/O; the dispatch thread performs writes in event order, which
/// is what makes "durable before the next event" hold.
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    /// Open or create a store at `path`, validating the format version.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RocksStore, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = Category::ALL
            .iter()
            .map(|c| ColumnFamilyDescriptor::new(c.name(), Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let store = RocksStore { db: Arc::new(db) };
        check_format_version(&store)?;
        Ok(store)
    }

    fn cf(&self, category: Category) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db.cf_handle(category.name()).ok_or_else(|| {
            StorageError::Database(format!("column family {} not found", category.name()))
        })
    }
}

impl OrderedByteMap for RocksStore {
    fn get(&self, category: Category, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.db
            .get_cf(self.cf(category)?, key)
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn put(&self, category: Category, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(true);
        self.db
            .put_cf_opt(self.cf(category)?, key, value, &write_opts)
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn delete(&self, category: Category, key: &[u8]) -> Result<(), StorageError> {
        self.db
            .delete_cf(self.cf(category)?, key)
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn scan_prefix(
        &self,
        category: Category,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let cf = self.cf(category)?;
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(prefix, rocksdb::Direction::Forward),
        );
        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(|e| StorageError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// In-memory backend
// ═══════════════════════════════════════════════════════════════════════════

/// In-memory store for the simulation harness and unit tests.
///
/// Cloning shares the underlying maps, which is how crash/restart tests
/// hand a "disk" from the crashed node to its replacement.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    maps: Arc<RwLock<BTreeMap<&'static str, BTreeMap<Vec<u8>, Vec<u8>>>>>,
}

impl MemStore {
    pub fn new() -> Result<MemStore, StorageError> {
        let store = MemStore::default();
        check_format_version(&store)?;
        Ok(store)
    }
}

impl OrderedByteMap for MemStore {
    fn get(&self, category: Category, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .maps
            .read()
            .get(category.name())
            .and_then(|m| m.get(key).cloned()))
    }

    fn put(&self, category: Category, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.maps
            .write()
            .entry(category.name())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, category: Category, key: &[u8]) -> Result<(), StorageError> {
        if let Some(m) = self.maps.write().get_mut(category.name()) {
            m.remove(key);
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        category: Category,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        Ok(self
            .maps
            .read()
            .get(category.name())
            .map(|m| {
                m.range(prefix.to_vec()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
