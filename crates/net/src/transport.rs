//! Transport seam.
//!
//! The socket layer (TCP/ZMQ servers, accept loops, connection pooling) is
//! an embedder concern; the delivery layer drives this trait. The
//! simulation crate provides an in-memory implementation.

use crate::status::StatusReply;
use crate::wire::WireMessage;
use conclave_core::OutboundItem;
use conclave_types::SchainIndex;
use thiserror::Error;

/// Errors surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum NetError {
    /// Peer is unreachable right now; retried indefinitely.
    #[error("connection refused by peer {0}")]
    Refused(SchainIndex),
    /// Connection dropped mid-exchange; retried indefinitely.
    #[error("connection reset by peer {0}")]
    Reset(SchainIndex),
    /// The peer spoke a different protocol; the connection is poisoned and
    /// the current item is abandoned.
    #[error("protocol failure talking to peer {peer}: {reason}")]
    Protocol { peer: SchainIndex, reason: String },
}

impl NetError {
    /// Whether the worker should sleep and resend the same item.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::Refused(_) | NetError::Reset(_))
    }
}

/// Point-to-point message delivery to committee peers.
///
/// `send`/`broadcast` are fire-and-forget from the caller's perspective,
/// but implementations are expected to buffer frames across connection
/// outages: the engine re-broadcasts nothing, and agreement rounds only
/// advance once a quorum of each other's traffic arrives.
pub trait Transport: Send + Sync {
    /// Reliable path used by the per-peer workers: deliver one queued item
    /// and synchronously return the peer's status reply.
    fn send_item(&self, dst: SchainIndex, item: &OutboundItem) -> Result<StatusReply, NetError>;

    /// Direct message to one seat.
    fn send(&self, dst: SchainIndex, msg: WireMessage);

    /// Broadcast to every other committee seat.
    fn broadcast(&self, msg: WireMessage);
}
