//! Deterministic simulation of a Conclave committee.
//!
//! The harness runs every node's state machine against in-memory storage
//! under one virtual clock, executing actions inline. Network latency is
//! sampled from a seeded RNG, partitions park traffic until the link
//! heals (modeling the engine's reliable delivery riding out an outage),
//! and crashed nodes can be rebuilt from their surviving store. Given the
//! same seed, a run produces identical results every time.

mod harness;
mod network;

pub use harness::{SimCluster, SimStats};
pub use network::{NetworkConfig, NodeIndex, SimNetwork};
