//! Asynchronous binary Byzantine agreement (ABBA).
//!
//! One independent instance runs per (height, proposer slot) and decides a
//! single bit: `1` means "this proposer delivered a DA-proof in time", `0`
//! means "treat as no-proposal". The protocol is the round-based
//! Binary-Value / Auxiliary / Coin loop:
//!
//! 1. Broadcast `BV(r, est)`.
//! 2. Echo a `BV(r, b)` seen from `f+1` distinct senders; admit `b` into
//!    `bin_values` once seen from `2f+1`.
//! 3. Once `bin_values` is non-empty, broadcast `AUX(r, b)` for the first
//!    admitted value, carrying a share of this round's common coin.
//! 4. Gather `AUX` from `2f+1` distinct senders whose values are all in
//!    `bin_values`.
//! 5. Derive the coin from the threshold signature over
//!    `(schain, height, proposer, round)`.
//! 6. A unanimous aux value equal to the coin decides; otherwise the
//!    estimate for round `r+1` is the unanimous value or the coin.
//!
//! Instances are synchronous state machines: messages in, actions out. The
//! round snapshot is persisted before the broadcast that enters the next
//! round, so a restarted node resumes mid-instance instead of replaying
//! network history.

mod state;

pub use state::{BinConsensusInstance, SlotKey};
