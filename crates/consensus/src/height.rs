//! Height controller.
//!
//! Sequences heights: build our proposal, hand it to the delivery layer,
//! wait for the coordinator to finalize the height, commit, advance.
//! Catch-up blocks short-circuit the pipeline for heights the rest of the
//! committee already finished.

use conclave_core::{Action, OutboundItem, TimerId};
use conclave_types::{
    BlockId, BlockProposal, Committee, CommittedBlock, Hash, ThresholdSignature,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default proposal-receipt window.
pub const BLOCK_PROPOSAL_RECEIVE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Heights of cached working state kept behind the committed head.
pub const DEFAULT_COMMIT_HISTORY: u64 = 8;

/// Sequences heights and exposes commits to the embedder.
pub struct HeightController {
    committee: Arc<Committee>,
    last_committed: BlockId,
    /// Hash of the last committed block (`Hash::ZERO` before height 1).
    prev_hash: Hash,
    /// Timestamp of the last committed block.
    prev_timestamp_s: u64,
    /// Threshold signature of the last committed block.
    prev_sig: Option<ThresholdSignature>,
    proposal_timeout: Duration,
    commit_history: u64,
}

impl HeightController {
    pub fn new(committee: Arc<Committee>) -> HeightController {
        HeightController {
            committee,
            last_committed: BlockId(0),
            prev_hash: Hash::ZERO,
            prev_timestamp_s: 0,
            prev_sig: None,
            proposal_timeout: BLOCK_PROPOSAL_RECEIVE_TIMEOUT,
            commit_history: DEFAULT_COMMIT_HISTORY,
        }
    }

    /// Override the proposal-receipt window.
    pub fn with_proposal_timeout(mut self, timeout: Duration) -> HeightController {
        self.proposal_timeout = timeout;
        self
    }

    pub fn last_committed(&self) -> BlockId {
        self.last_committed
    }

    /// The height currently being built.
    pub fn working_height(&self) -> BlockId {
        self.last_committed.next()
    }

    pub fn prev_sig(&self) -> Option<&ThresholdSignature> {
        self.prev_sig.as_ref()
    }

    pub fn prev_hash(&self) -> Hash {
        self.prev_hash
    }

    /// Timestamp of the last committed block.
    pub fn prev_timestamp_s(&self) -> u64 {
        self.prev_timestamp_s
    }

    /// Resume from persisted chain state and begin the next height.
    pub fn bootstrap(
        &mut self,
        last_committed: BlockId,
        prev_timestamp_s: u64,
        prev_hash: Hash,
        prev_sig: Option<ThresholdSignature>,
    ) -> Vec<Action> {
        self.last_committed = last_committed;
        self.prev_timestamp_s = prev_timestamp_s;
        self.prev_hash = prev_hash;
        self.prev_sig = prev_sig;
        info!(
            last_committed = %last_committed,
            "Bootstrapped, proposing next height"
        );
        self.begin_height()
    }

    /// Kick off the working height: ask the mempool for a batch and arm
    /// the proposal-receipt window.
    fn begin_height(&self) -> Vec<Action> {
        let block_id = self.working_height();
        debug!(block_id = %block_id, "Beginning height");
        vec![
            Action::RequestProposalBatch {
                block_id,
                prev_hash: self.prev_hash,
            },
            Action::SetTimer {
                id: TimerId::ProposalReceipt(block_id),
                duration: self.proposal_timeout,
            },
        ]
    }

    /// Our own proposal is ready: store it and fan it out to every peer.
    pub fn on_own_proposal_built(&mut self, proposal: BlockProposal) -> Vec<Action> {
        if proposal.block_id != self.working_height() {
            warn!(
                block_id = %proposal.block_id,
                working = %self.working_height(),
                "Own proposal for the wrong height, ignoring"
            );
            return vec![];
        }
        if proposal.prev_hash != self.prev_hash {
            warn!(block_id = %proposal.block_id, "Own proposal chains the wrong parent, ignoring");
            return vec![];
        }
        vec![
            Action::PersistProposal {
                proposal: proposal.clone(),
            },
            Action::EnqueueItem {
                item: OutboundItem::Proposal(proposal),
            },
        ]
    }

    /// The coordinator finalized the working height.
    pub fn on_block_finalized(&mut self, block: CommittedBlock) -> Vec<Action> {
        if block.block_id() != self.working_height() {
            warn!(
                block_id = %block.block_id(),
                working = %self.working_height(),
                "Finalized block is not the working height, ignoring"
            );
            return vec![];
        }
        if let Err(e) = block.verify(&self.committee) {
            warn!(block_id = %block.block_id(), error = %e, "Finalized block failed verification");
            return vec![];
        }
        let mut actions = self.commit(block);
        actions.extend(self.begin_height());
        actions
    }

    /// Apply one verified block: persist, publish, prune, advance.
    fn commit(&mut self, block: CommittedBlock) -> Vec<Action> {
        let block_id = block.block_id();
        info!(
            block_id = %block_id,
            hash = %block.hash(),
            transactions = block.proposal.transactions.len(),
            "Committing block"
        );
        self.last_committed = block_id;
        self.prev_hash = block.hash();
        self.prev_timestamp_s = block.proposal.timestamp_s;
        self.prev_sig = Some(block.threshold_sig.clone());

        vec![
            Action::PersistBlock {
                block: block.clone(),
            },
            Action::EmitCommittedBlock { block },
            Action::CancelTimer {
                id: TimerId::ProposalReceipt(block_id),
            },
            Action::PruneBelow {
                block_id: BlockId(block_id.0.saturating_sub(self.commit_history)),
            },
        ]
    }

    /// A contiguous run of already-committed blocks arrived via catch-up.
    ///
    /// Accepted only when the run starts at or below the next height;
    /// every block above the committed head is applied in order, and the
    /// first gap or verification failure rejects the remainder.
    pub fn on_catchup_blocks(&mut self, blocks: Vec<CommittedBlock>) -> Vec<Action> {
        let Some(first) = blocks.first() else {
            return vec![];
        };
        if first.block_id() > self.working_height() {
            warn!(
                first = %first.block_id(),
                working = %self.working_height(),
                "Catch-up run starts beyond the next height, rejecting"
            );
            return vec![];
        }

        let mut actions = Vec::new();
        let mut applied = 0usize;
        for block in blocks {
            let block_id = block.block_id();
            if block_id <= self.last_committed {
                continue;
            }
            if block_id != self.working_height() {
                warn!(
                    block_id = %block_id,
                    expected = %self.working_height(),
                    "Catch-up blocks out of order, rejecting remainder"
                );
                break;
            }
            if let Err(e) = block.verify(&self.committee) {
                warn!(
                    block_id = %block_id,
                    error = %e,
                    "Catch-up block failed verification, rejecting remainder"
                );
                break;
            }
            if block.proposal.prev_hash != self.prev_hash {
                warn!(
                    block_id = %block_id,
                    "Catch-up block chains the wrong parent, rejecting remainder"
                );
                break;
            }
            actions.extend(self.commit(block));
            applied += 1;
        }

        if applied > 0 {
            info!(
                applied,
                last_committed = %self.last_committed,
                "Catch-up applied, resuming proposals"
            );
            actions.extend(self.begin_height());
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::test_utils::{test_committee, test_proposal, test_threshold};
    use conclave_types::block_sign_message;

    fn committed(
        committee: &Committee,
        keys: &[conclave_types::KeyPair],
        block_id: BlockId,
        prev_hash: Hash,
    ) -> CommittedBlock {
        let proposal = test_proposal(committee, &keys[0], block_id, prev_hash);
        let threshold_sig =
            test_threshold(committee, keys, &block_sign_message(&proposal.hash()));
        CommittedBlock {
            proposal,
            threshold_sig,
        }
    }

    fn controller() -> (HeightController, Committee, Vec<conclave_types::KeyPair>) {
        let (committee, keys) = test_committee(4);
        (
            HeightController::new(Arc::new(committee.clone())),
            committee,
            keys,
        )
    }

    fn emitted_ids(actions: &[Action]) -> Vec<u64> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::EmitCommittedBlock { block } => Some(block.block_id().0),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_bootstrap_begins_next_height() {
        let (mut hc, _, _) = controller();
        let actions = hc.bootstrap(BlockId(10), 1_700_000_000, Hash::digest(b"b10"), None);
        assert!(matches!(
            actions[0],
            Action::RequestProposalBatch {
                block_id: BlockId(11),
                ..
            }
        ));
        assert!(matches!(
            actions[1],
            Action::SetTimer {
                id: TimerId::ProposalReceipt(BlockId(11)),
                ..
            }
        ));
        assert_eq!(hc.working_height(), BlockId(11));
    }

    #[test]
    fn test_finalized_block_commits_and_advances() {
        let (mut hc, committee, keys) = controller();
        hc.bootstrap(BlockId(0), 0, Hash::ZERO, None);
        let block = committed(&committee, &keys, BlockId(1), Hash::ZERO);
        let actions = hc.on_block_finalized(block.clone());

        assert_eq!(emitted_ids(&actions), vec![1]);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::PersistBlock { .. })));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::RequestProposalBatch {
                block_id: BlockId(2),
                ..
            }
        )));
        assert_eq!(hc.last_committed(), BlockId(1));
        assert_eq!(hc.prev_hash(), block.hash());
    }

    #[test]
    fn test_wrong_height_finalization_ignored() {
        let (mut hc, committee, keys) = controller();
        hc.bootstrap(BlockId(0), 0, Hash::ZERO, None);
        let block = committed(&committee, &keys, BlockId(3), Hash::ZERO);
        assert!(hc.on_block_finalized(block).is_empty());
        assert_eq!(hc.last_committed(), BlockId(0));
    }

    #[test]
    fn test_catchup_applies_in_order() {
        let (mut hc, committee, keys) = controller();
        hc.bootstrap(BlockId(0), 0, Hash::ZERO, None);

        let b1 = committed(&committee, &keys, BlockId(1), Hash::ZERO);
        let b2 = committed(&committee, &keys, BlockId(2), b1.hash());
        let b3 = committed(&committee, &keys, BlockId(3), b2.hash());
        let actions = hc.on_catchup_blocks(vec![b1, b2, b3]);

        assert_eq!(emitted_ids(&actions), vec![1, 2, 3]);
        assert_eq!(hc.last_committed(), BlockId(3));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::RequestProposalBatch {
                block_id: BlockId(4),
                ..
            }
        )));
    }

    #[test]
    fn test_catchup_skips_already_committed_prefix() {
        let (mut hc, committee, keys) = controller();
        let b1 = committed(&committee, &keys, BlockId(1), Hash::ZERO);
        let b2 = committed(&committee, &keys, BlockId(2), b1.hash());
        hc.bootstrap(BlockId(0), 0, Hash::ZERO, None);
        hc.on_catchup_blocks(vec![b1.clone()]);

        let actions = hc.on_catchup_blocks(vec![b1, b2]);
        assert_eq!(emitted_ids(&actions), vec![2]);
        assert_eq!(hc.last_committed(), BlockId(2));
    }

    #[test]
    fn test_catchup_with_gap_rejected() {
        let (mut hc, committee, keys) = controller();
        hc.bootstrap(BlockId(0), 0, Hash::ZERO, None);

        let b1 = committed(&committee, &keys, BlockId(1), Hash::ZERO);
        let b3 = committed(&committee, &keys, BlockId(3), Hash::digest(b"b2"));

        // Run starting past the next height is rejected outright.
        assert!(hc.on_catchup_blocks(vec![b3.clone()]).is_empty());

        // A gap inside the run rejects the remainder but keeps the prefix.
        let actions = hc.on_catchup_blocks(vec![b1, b3]);
        assert_eq!(emitted_ids(&actions), vec![1]);
        assert_eq!(hc.last_committed(), BlockId(1));
    }

    #[test]
    fn test_catchup_rejects_bad_signature() {
        let (mut hc, committee, keys) = controller();
        hc.bootstrap(BlockId(0), 0, Hash::ZERO, None);

        let mut b1 = committed(&committee, &keys, BlockId(1), Hash::ZERO);
        b1.threshold_sig.signers.pop();
        assert!(emitted_ids(&hc.on_catchup_blocks(vec![b1])).is_empty());
        assert_eq!(hc.last_committed(), BlockId(0));
    }

    #[test]
    fn test_own_proposal_fans_out() {
        let (mut hc, committee, keys) = controller();
        hc.bootstrap(BlockId(0), 0, Hash::ZERO, None);
        let proposal = test_proposal(&committee, &keys[0], BlockId(1), Hash::ZERO);
        let actions = hc.on_own_proposal_built(proposal.clone());
        assert!(matches!(&actions[0], Action::PersistProposal { .. }));
        assert!(matches!(
            &actions[1],
            Action::EnqueueItem {
                item: OutboundItem::Proposal(p)
            } if *p == proposal
        ));

        // Wrong parent is refused.
        let stale = test_proposal(&committee, &keys[0], BlockId(1), Hash::digest(b"other"));
        assert!(hc.on_own_proposal_built(stale).is_empty());
    }
}
