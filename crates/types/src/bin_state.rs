//! Persisted binary-agreement snapshots.

use crate::identifiers::{BinRound, BlockId, SchainIndex};
use serde::{Deserialize, Serialize};

/// Durable snapshot of one ABBA instance, written on every round
/// transition so a restarted node re-enters the same round with the same
/// estimate instead of replaying network history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinStateRecord {
    pub block_id: BlockId,
    pub proposer_index: SchainIndex,
    pub round: BinRound,
    /// Current round estimate.
    pub est: bool,
    /// Values admitted into `bin_values` for the current round.
    pub bin_values: BitPair,
    /// Auxiliary values already broadcast for the current round.
    pub aux_sent: BitPair,
    /// Final decision, if reached.
    pub decided: Option<bool>,
}

/// A subset of `{0, 1}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitPair {
    pub zero: bool,
    pub one: bool,
}

impl BitPair {
    pub fn contains(&self, bit: bool) -> bool {
        if bit {
            self.one
        } else {
            self.zero
        }
    }

    pub fn insert(&mut self, bit: bool) {
        if bit {
            self.one = true;
        } else {
            self.zero = true;
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.zero && !self.one
    }

    /// Number of values present (0, 1, or 2).
    pub fn len(&self) -> usize {
        usize::from(self.zero) + usize::from(self.one)
    }

    /// The single contained value, if exactly one is present.
    pub fn sole_value(&self) -> Option<bool> {
        match (self.zero, self.one) {
            (true, false) => Some(false),
            (false, true) => Some(true),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_pair() {
        let mut p = BitPair::default();
        assert!(p.is_empty());
        assert_eq!(p.sole_value(), None);

        p.insert(true);
        assert!(p.contains(true));
        assert!(!p.contains(false));
        assert_eq!(p.sole_value(), Some(true));
        assert_eq!(p.len(), 1);

        p.insert(false);
        assert_eq!(p.sole_value(), None);
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_record_round_trip() {
        let record = BinStateRecord {
            block_id: BlockId(10),
            proposer_index: SchainIndex(2),
            round: BinRound(2),
            est: true,
            bin_values: BitPair {
                zero: false,
                one: true,
            },
            aux_sent: BitPair {
                zero: false,
                one: true,
            },
            decided: None,
        };
        let bytes = serde_json::to_vec(&record).unwrap();
        let decoded: BinStateRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record, decoded);
    }
}
