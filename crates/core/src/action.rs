//! Action types for the consensus state machines.

use crate::event::Event;
use crate::message::{ConsensusMessage, OutboundItem};
use crate::TimerId;
use conclave_types::{
    BinStateRecord, BlockId, BlockProposal, CommittedBlock, DaProof, Hash, SchainIndex, SigShare,
};
use std::time::Duration;

/// Actions the state machines want performed.
///
/// Actions are **commands** - they describe something to do. The runner
/// executes actions and converts results back into events. Persistence
/// actions are executed synchronously, in order, before the next event is
/// delivered; this is what makes "durable before round r+1" hold.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Replicate an item into every peer's delivery queue.
    EnqueueItem { item: OutboundItem },

    /// Send a DA signature share back to the proposer of a received
    /// proposal.
    SendDaShare {
        dst: SchainIndex,
        block_id: BlockId,
        proposer_index: SchainIndex,
        block_hash: Hash,
        share: SigShare,
    },

    /// Broadcast a binary-consensus message to the whole committee.
    BroadcastConsensus { msg: ConsensusMessage },

    /// Broadcast our block-signature share for a decided height.
    BroadcastBlockSignShare {
        block_id: BlockId,
        block_hash: Hash,
        share: SigShare,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Arm a timer.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously armed timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal
    // ═══════════════════════════════════════════════════════════════════════
    /// Feed an event back into the dispatch queue ahead of external input.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Collaborator requests (return callback events)
    // ═══════════════════════════════════════════════════════════════════════
    /// Ask the mempool for the next height's transaction batch. The runner
    /// assembles and signs the proposal around it.
    ///
    /// Returns `Event::OwnProposalBuilt`.
    RequestProposalBatch { block_id: BlockId, prev_hash: Hash },

    /// Fetch a cached or persisted proposal.
    ///
    /// Returns `Event::ProposalFetched`.
    FetchProposal {
        block_id: BlockId,
        proposer_index: SchainIndex,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Storage
    // ═══════════════════════════════════════════════════════════════════════
    /// Store a proposal (cache always, disk only for our own).
    PersistProposal { proposal: BlockProposal },

    /// Store a completed DA-proof.
    PersistDaProof { proof: DaProof },

    /// Snapshot one ABBA instance. Must be durable before that instance
    /// sees its next event.
    PersistBinState { record: BinStateRecord },

    /// Append a committed block.
    PersistBlock { block: CommittedBlock },

    /// Drop cached and persisted working state below a height.
    PruneBelow { block_id: BlockId },

    // ═══════════════════════════════════════════════════════════════════════
    // External notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// Hand a committed block to the embedder, in strict height order.
    EmitCommittedBlock { block: CommittedBlock },
}

impl Action {
    /// Check if this is a storage write action.
    pub fn is_storage_write(&self) -> bool {
        matches!(
            self,
            Action::PersistProposal { .. }
                | Action::PersistDaProof { .. }
                | Action::PersistBinState { .. }
                | Action::PersistBlock { .. }
                | Action::PruneBelow { .. }
        )
    }

    /// Check if this action sends bytes to peers.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Action::EnqueueItem { .. }
                | Action::SendDaShare { .. }
                | Action::BroadcastConsensus { .. }
                | Action::BroadcastBlockSignShare { .. }
        )
    }

    /// Get the action type name for logs and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::EnqueueItem { .. } => "EnqueueItem",
            Action::SendDaShare { .. } => "SendDaShare",
            Action::BroadcastConsensus { .. } => "BroadcastConsensus",
            Action::BroadcastBlockSignShare { .. } => "BroadcastBlockSignShare",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::RequestProposalBatch { .. } => "RequestProposalBatch",
            Action::FetchProposal { .. } => "FetchProposal",
            Action::PersistProposal { .. } => "PersistProposal",
            Action::PersistDaProof { .. } => "PersistDaProof",
            Action::PersistBinState { .. } => "PersistBinState",
            Action::PersistBlock { .. } => "PersistBlock",
            Action::PruneBelow { .. } => "PruneBelow",
            Action::EmitCommittedBlock { .. } => "EmitCommittedBlock",
        }
    }
}
