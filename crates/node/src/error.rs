//! Engine error taxonomy.

use thiserror::Error;

/// Errors surfaced by the engine, grouped by handling policy.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Retried with backoff; never surfaced to the embedder.
    #[error("transient: {0}")]
    Transient(String),

    /// Malformed or dishonest input; the message is dropped and the engine
    /// continues.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// API misuse by the embedder; surfaced to the caller without mutating
    /// state.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Disk failure, key unavailability, or inconsistent persisted state;
    /// triggers `exit_on_fatal_error`.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Cooperative shutdown unwinding a loop.
    #[error("exit requested")]
    ExitRequested,
}

impl From<conclave_storage::StorageError> for EngineError {
    fn from(e: conclave_storage::StorageError) -> EngineError {
        EngineError::Fatal(e.to_string())
    }
}
