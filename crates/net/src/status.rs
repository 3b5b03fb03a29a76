//! Connection-status protocol.
//!
//! Every queued request is answered with a `(status, substatus)` pair. The
//! client worker's retry policy keys off the status; the substatus only
//! feeds logs.

use serde::{Deserialize, Serialize};

/// Top-level outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Request accepted.
    Success,
    /// The server is closing this connection; the item is not wanted.
    Disconnect,
    /// The server cannot take the item right now; reconnect after
    /// `PROPOSAL_RETRY_INTERVAL_MS` and resend.
    RetryLater,
    /// The request was malformed or rejected; the item is dropped.
    Error,
}

/// Detail accompanying a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionSubStatus {
    None,
    /// The server already holds this item.
    AlreadyKnown,
    /// The item's height is at or below the server's committed height.
    OldHeight,
    /// Signature or hash validation failed.
    BadSignature,
    /// The server's intake is saturated.
    Busy,
}

/// Reply to one queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub status: ConnectionStatus,
    pub substatus: ConnectionSubStatus,
}

impl StatusReply {
    pub fn success() -> StatusReply {
        StatusReply {
            status: ConnectionStatus::Success,
            substatus: ConnectionSubStatus::None,
        }
    }

    pub fn retry_later() -> StatusReply {
        StatusReply {
            status: ConnectionStatus::RetryLater,
            substatus: ConnectionSubStatus::Busy,
        }
    }

    pub fn error(substatus: ConnectionSubStatus) -> StatusReply {
        StatusReply {
            status: ConnectionStatus::Error,
            substatus,
        }
    }
}
