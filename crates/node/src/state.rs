//! Composed node state machine.
//!
//! Routes events between the block-consensus coordinator and the height
//! controller and keeps the two in step: whenever the controller commits
//! (normal path or catch-up), the coordinator advances to the new working
//! height.

use conclave_consensus::{BlockConsensus, HeightController};
use conclave_core::{Action, Event, StateMachine};
use conclave_types::{BinStateRecord, BlockId, Committee, DaProof, Hash, KeyPair, ThresholdSignature};
use std::sync::Arc;
use std::time::Duration;

/// One node's complete consensus state, as a synchronous state machine.
pub struct NodeStateMachine {
    coordinator: BlockConsensus,
    controller: HeightController,
    #[allow(dead_code)]
    now: Duration,
}

impl NodeStateMachine {
    pub fn new(
        committee: Arc<Committee>,
        key: Arc<KeyPair>,
        proposal_timeout: Duration,
    ) -> NodeStateMachine {
        NodeStateMachine {
            coordinator: BlockConsensus::new(committee.clone(), key, proposal_timeout),
            controller: HeightController::new(committee).with_proposal_timeout(proposal_timeout),
            now: Duration::ZERO,
        }
    }

    /// Resume from persisted chain state: set the committed watermark,
    /// re-seed held DA-proofs, restore in-flight agreement instances, and
    /// begin the next height.
    pub fn bootstrap(
        &mut self,
        last_committed: BlockId,
        prev_timestamp_s: u64,
        prev_hash: Hash,
        prev_sig: Option<ThresholdSignature>,
        bin_records: &[BinStateRecord],
        da_proofs: Vec<DaProof>,
    ) -> Vec<Action> {
        let mut actions =
            self.controller
                .bootstrap(last_committed, prev_timestamp_s, prev_hash, prev_sig.clone());
        actions.extend(self.coordinator.advance_to(last_committed, prev_sig));
        self.coordinator.restore_da_proofs(da_proofs);
        actions.extend(self.coordinator.restore_instances(bin_records));
        actions
    }

    pub fn last_committed(&self) -> BlockId {
        self.controller.last_committed()
    }

    pub fn working_height(&self) -> BlockId {
        self.controller.working_height()
    }

    /// Bring the coordinator to the controller's committed height after a
    /// commit-bearing event.
    fn sync_coordinator(&mut self) -> Vec<Action> {
        let committed = self.controller.last_committed();
        if committed >= self.coordinator.working_height() {
            self.coordinator
                .advance_to(committed, self.controller.prev_sig().cloned())
        } else {
            vec![]
        }
    }
}

impl StateMachine for NodeStateMachine {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            // Coordinator-owned events.
            Event::ProposalTimeout { block_id } => self.coordinator.on_proposal_timeout(block_id),
            Event::ProposalReceived { proposal } => self.coordinator.on_proposal_received(proposal),
            Event::DaShareReceived {
                block_id,
                proposer_index,
                block_hash,
                share,
            } => self
                .coordinator
                .on_da_share(block_id, proposer_index, block_hash, share),
            Event::DaProofReceived { proof } => self.coordinator.on_da_proof(proof),
            Event::ConsensusReceived { msg } => self.coordinator.on_consensus_message(msg),
            Event::BlockSignShareReceived {
                block_id,
                block_hash,
                share,
            } => self
                .coordinator
                .on_block_sign_share(block_id, block_hash, share),
            Event::ProposalFetched {
                block_id,
                proposer_index,
                proposal,
            } => self
                .coordinator
                .on_proposal_fetched(block_id, proposer_index, proposal),
            Event::SlotDecided {
                block_id,
                proposer_index,
                decision,
            } => self
                .coordinator
                .on_slot_decided(block_id, proposer_index, decision),

            // Controller-owned events; both machines see our own proposal,
            // and commits advance the coordinator.
            Event::OwnProposalBuilt { proposal } => {
                let mut actions = self.controller.on_own_proposal_built(proposal.clone());
                if !actions.is_empty() {
                    actions.extend(self.coordinator.on_own_proposal(&proposal));
                }
                actions
            }
            Event::BlockFinalized { block } => {
                let mut actions = self.controller.on_block_finalized(block);
                actions.extend(self.sync_coordinator());
                actions
            }
            Event::CatchupBlocksReceived { blocks } => {
                let mut actions = self.controller.on_catchup_blocks(blocks);
                actions.extend(self.sync_coordinator());
                actions
            }
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }
}
