//! Proposer priority order.
//!
//! The committed block for a height is the decided-1 slot appearing
//! earliest in a permutation of `1..=n` seeded by the previous committed
//! block's threshold signature. The seed is identical on every honest node
//! (threshold signatures are unique per message), so all nodes pick the
//! same winner. Height 1 has no previous signature and uses seat order.

use conclave_types::{SchainIndex, ThresholdSignature};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// The proposer priority order for the height following `prev_sig`.
pub fn proposer_priority(n: u64, prev_sig: Option<&ThresholdSignature>) -> Vec<SchainIndex> {
    let mut order: Vec<SchainIndex> = (1..=n).map(SchainIndex).collect();
    if let Some(sig) = prev_sig {
        let mut rng = ChaCha8Rng::from_seed(*sig.hash().as_bytes());
        order.shuffle(&mut rng);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::test_utils::{test_committee, test_threshold};

    #[test]
    fn test_identity_order_without_seed() {
        let order = proposer_priority(4, None);
        assert_eq!(
            order,
            vec![
                SchainIndex(1),
                SchainIndex(2),
                SchainIndex(3),
                SchainIndex(4)
            ]
        );
    }

    #[test]
    fn test_seeded_order_is_deterministic_permutation() {
        let (committee, keys) = test_committee(16);
        let sig = test_threshold(&committee, &keys, b"block 41");

        let a = proposer_priority(16, Some(&sig));
        let b = proposer_priority(16, Some(&sig));
        assert_eq!(a, b, "same signature must give the same order everywhere");

        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(
            sorted,
            (1..=16).map(SchainIndex).collect::<Vec<_>>(),
            "every seat appears exactly once"
        );
    }

    #[test]
    fn test_different_signatures_shuffle_differently() {
        let (committee, keys) = test_committee(16);
        let sig_a = test_threshold(&committee, &keys, b"block 41");
        let sig_b = test_threshold(&committee, &keys, b"block 42");
        assert_ne!(
            proposer_priority(16, Some(&sig_a)),
            proposer_priority(16, Some(&sig_b))
        );
    }
}
