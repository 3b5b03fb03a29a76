//! Embedder collaborator interfaces.

use conclave_types::{BlockId, Transaction};

/// Produces the transaction batch for each of our proposals.
///
/// Implemented by the embedder's pending-transaction pool. Called once per
/// height from the runner; an empty batch is a valid (empty) block.
pub trait BlockFactory: Send + Sync {
    fn pending_batch(&self, block_id: BlockId) -> Vec<Transaction>;
}

/// Receives committed blocks, in strict height order with no gaps.
pub trait CommitSink: Send + Sync {
    fn create_block(
        &self,
        block_id: BlockId,
        transactions: &[Transaction],
        timestamp_s: u64,
        timestamp_ms: u32,
    );
}
