//! Event types for the consensus state machines.

use crate::message::ConsensusMessage;
use conclave_types::{
    BlockId, BlockProposal, CommittedBlock, DaProof, Hash, SchainIndex, SigShare,
};

/// All possible inputs to a node's state machines.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// The proposal-receipt window for a height expired; binary consensus
    /// starts with estimate 0 for every slot still missing a DA-proof.
    ProposalTimeout { block_id: BlockId },

    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// A peer's block proposal arrived.
    ProposalReceived { proposal: BlockProposal },

    /// A DA signature share arrived in reply to our own proposal push.
    DaShareReceived {
        block_id: BlockId,
        proposer_index: SchainIndex,
        block_hash: Hash,
        share: SigShare,
    },

    /// A completed DA-proof arrived from a proposer.
    DaProofReceived { proof: DaProof },

    /// A binary-consensus message arrived. The envelope signature has
    /// already been verified by the runner's verification pool.
    ConsensusReceived { msg: ConsensusMessage },

    /// A block-signature share arrived for a decided height.
    BlockSignShareReceived {
        block_id: BlockId,
        block_hash: Hash,
        share: SigShare,
    },

    /// A contiguous run of already-committed blocks arrived via catch-up.
    CatchupBlocksReceived { blocks: Vec<CommittedBlock> },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (consequences of prior processing, or runner callbacks)
    // ═══════════════════════════════════════════════════════════════════════
    /// The mempool produced the transaction batch for our own proposal.
    ///
    /// Callback from `Action::RequestProposalBatch`.
    OwnProposalBuilt { proposal: BlockProposal },

    /// A proposal was fetched from the proposal store.
    ///
    /// Callback from `Action::FetchProposal`.
    ProposalFetched {
        block_id: BlockId,
        proposer_index: SchainIndex,
        proposal: Option<BlockProposal>,
    },

    /// One binary-agreement slot reached a decision.
    SlotDecided {
        block_id: BlockId,
        proposer_index: SchainIndex,
        decision: bool,
    },

    /// A height finished: winning proposal chosen and block signature
    /// aggregated.
    BlockFinalized { block: CommittedBlock },
}

impl Event {
    /// Whether this event is a consequence of prior local processing
    /// rather than an external input.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Event::OwnProposalBuilt { .. }
                | Event::ProposalFetched { .. }
                | Event::SlotDecided { .. }
                | Event::BlockFinalized { .. }
        )
    }

    /// Get the event type name for logs and telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ProposalTimeout { .. } => "ProposalTimeout",
            Event::ProposalReceived { .. } => "ProposalReceived",
            Event::DaShareReceived { .. } => "DaShareReceived",
            Event::DaProofReceived { .. } => "DaProofReceived",
            Event::ConsensusReceived { .. } => "ConsensusReceived",
            Event::BlockSignShareReceived { .. } => "BlockSignShareReceived",
            Event::CatchupBlocksReceived { .. } => "CatchupBlocksReceived",
            Event::OwnProposalBuilt { .. } => "OwnProposalBuilt",
            Event::ProposalFetched { .. } => "ProposalFetched",
            Event::SlotDecided { .. } => "SlotDecided",
            Event::BlockFinalized { .. } => "BlockFinalized",
        }
    }
}
