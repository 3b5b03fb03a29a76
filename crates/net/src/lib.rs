//! Peer delivery layer for the Conclave consensus engine.
//!
//! Three pieces:
//!
//! - **Wire codec**: magic-prefixed connections, length-prefixed JSON
//!   frames tagged by `"type"` ([`wire`]).
//! - **Connection-status protocol**: every queued request is answered with
//!   a `(status, substatus)` pair ([`status`]).
//! - **Delivery workers**: a bounded FIFO per peer drained by a dedicated
//!   thread with unbounded retry on transient errors and drop-oldest on
//!   backpressure ([`PeerFanout`]).
//!
//! The socket layer itself lives behind the [`Transport`] trait; the
//! simulation crate ships an in-memory implementation and embedders supply
//! the real one.

mod fanout;
mod queue;
pub mod status;
mod transport;
pub mod wire;

pub use fanout::{DeliveryConfig, EnqueueError, FanoutHandle, PeerFanout};
pub use queue::{PeerQueue, MAX_PROPOSAL_QUEUE_SIZE};
pub use status::{ConnectionStatus, ConnectionSubStatus, StatusReply};
pub use transport::{NetError, Transport};
pub use wire::{
    check_magic, decode_frame, encode_frame, encode_magic, WireError, WireMessage, MAX_FRAME_LEN,
    WIRE_MAGIC,
};
