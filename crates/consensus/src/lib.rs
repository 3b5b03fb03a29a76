//! Block consensus for the Conclave engine.
//!
//! Two state machines:
//!
//! - [`BlockConsensus`] (the coordinator): collects proposals, DA shares
//!   and DA-proofs for the working height, runs one binary-agreement
//!   instance per proposer slot, chooses the winner by the seeded priority
//!   order, and aggregates the block signature.
//! - [`HeightController`]: sequences heights, publishes committed blocks
//!   in strict order, and applies catch-up runs.
//!
//! The composed node state machine in `conclave-node` routes events
//! between the two.

mod coordinator;
mod height;
mod priority;

pub use coordinator::BlockConsensus;
pub use height::{HeightController, BLOCK_PROPOSAL_RECEIVE_TIMEOUT, DEFAULT_COMMIT_HISTORY};
pub use priority::proposer_priority;
