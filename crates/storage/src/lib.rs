//! Persistent stores for the Conclave consensus engine.
//!
//! Everything is keyed big-endian so prefix scans enumerate a height in
//! order, and every store sits on the [`OrderedByteMap`] abstraction:
//! RocksDB in production, a BTreeMap in simulation. A format-version tag
//! (`"1.0"`) is written per store and validated on open.

mod block_db;
mod consensus_db;
mod db;
mod proposal_db;

pub use block_db::BlockDb;
pub use consensus_db::{BinStateDb, DaProofDb};
pub use db::{Category, MemStore, OrderedByteMap, RocksStore, StorageError, FORMAT_VERSION};
pub use proposal_db::ProposalDb;
