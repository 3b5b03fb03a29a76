//! Newtype identifiers used throughout the engine.
//!
//! Each identifier is an unsigned integer with a distinct semantic type so
//! that a block id can never be passed where a committee seat is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a schain (one fixed-committee replicated log instance).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SchainId(pub u64);

/// Globally unique node identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

/// A node's seat in the committee, `1..=n`.
///
/// Index `0` is never a valid seat; wire messages carrying a zero or
/// out-of-range index are rejected at the protocol boundary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SchainIndex(pub u64);

/// Block height. Monotonic, starting at 1; 0 means "nothing committed yet".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BlockId(pub u64);

/// Binary-agreement round number within one (height, proposer) instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BinRound(pub u64);

/// Per-sender monotonic message id, used for envelope diagnostics.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct MsgId(pub u64);

impl BlockId {
    /// The next height.
    pub fn next(self) -> BlockId {
        BlockId(self.0 + 1)
    }
}

impl BinRound {
    /// The next round.
    pub fn next(self) -> BinRound {
        BinRound(self.0 + 1)
    }
}

impl fmt::Display for SchainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SchainIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BinRound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
