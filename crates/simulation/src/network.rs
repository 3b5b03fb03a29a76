//! Simulated network with deterministic latency and partitions.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Node index inside the harness (`seat - 1`).
pub type NodeIndex = usize;

/// Configuration for the simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Base one-way latency.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            latency: Duration::from_millis(10),
            jitter_fraction: 0.2,
        }
    }
}

/// Deterministic message-delivery model.
///
/// Partitions are directional; messages across a severed link are parked
/// by the harness and flushed when the link heals, which models the
/// engine's reliable delivery layer riding out an outage.
#[derive(Debug)]
pub struct SimNetwork {
    config: NetworkConfig,
    partitions: HashSet<(NodeIndex, NodeIndex)>,
}

impl SimNetwork {
    pub fn new(config: NetworkConfig) -> SimNetwork {
        SimNetwork {
            config,
            partitions: HashSet::new(),
        }
    }

    /// Whether a message from `from` to `to` is currently deliverable.
    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Sever both directions between two groups.
    pub fn partition_groups(&mut self, group_a: &[NodeIndex], group_b: &[NodeIndex]) {
        for &a in group_a {
            for &b in group_b {
                self.partitions.insert((a, b));
                self.partitions.insert((b, a));
            }
        }
    }

    /// Sever a node from everyone, both directions.
    pub fn isolate(&mut self, node: NodeIndex, all: &[NodeIndex]) {
        for &other in all {
            if other != node {
                self.partitions.insert((node, other));
                self.partitions.insert((other, node));
            }
        }
    }

    /// Restore full connectivity.
    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// One-way delivery latency with deterministic jitter.
    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency.as_secs_f64();
        let jitter_range = base * self.config.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rng.gen_range(0.0..jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64(base + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_partition_and_heal() {
        let mut network = SimNetwork::new(NetworkConfig::default());
        assert!(!network.is_partitioned(0, 2));

        network.partition_groups(&[0, 1], &[2, 3]);
        assert!(network.is_partitioned(0, 2));
        assert!(network.is_partitioned(3, 1));
        assert!(!network.is_partitioned(0, 1));
        assert!(!network.is_partitioned(2, 3));

        network.heal_all();
        assert_eq!(network.partition_count(), 0);
    }

    #[test]
    fn test_latency_is_deterministic_per_seed() {
        let network = SimNetwork::new(NetworkConfig::default());
        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..32 {
            assert_eq!(network.sample_latency(&mut a), network.sample_latency(&mut b));
        }
    }
}
