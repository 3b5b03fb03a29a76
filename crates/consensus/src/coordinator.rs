//! Block-consensus coordinator.
//!
//! For each height the coordinator collects proposals and DA state, runs
//! one binary-agreement instance per proposer slot, picks the winner among
//! the decided-1 slots by the seeded priority order, and drives the block
//! signature phase that finalizes the height.

use crate::priority::proposer_priority;
use conclave_abba::{BinConsensusInstance, SlotKey};
use conclave_core::{Action, ConsensusMessage, Event, TimerId};
use conclave_types::{
    block_sign_message, da_proof_message, BinStateRecord, BlockId, BlockProposal, Committee,
    CommittedBlock, DaProof, Hash, KeyPair, MsgId, SchainIndex, ShareOutcome, SigShare,
    SigShareSet, ThresholdSignature,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// How far above the working height proposals, proofs and consensus
/// messages are accepted (buffered) rather than dropped.
const MAX_HEIGHT_AHEAD: u64 = 8;

/// Bound on buffered future-height consensus messages per height.
const MAX_BUFFERED_MESSAGES: usize = 1024;

/// Everything the coordinator tracks for one in-flight height.
#[derive(Default)]
struct HeightState {
    /// First-seen proposal hash per slot; a second, different hash from
    /// the same proposer is equivocation and is dropped.
    proposal_hashes: BTreeMap<SchainIndex, Hash>,
    /// DA shares collected for our own proposal.
    own_da_shares: Option<SigShareSet>,
    /// Our own proposal's hash, once built.
    own_hash: Option<Hash>,
    /// DA-proofs held per slot.
    da_proofs: BTreeMap<SchainIndex, DaProof>,
    /// Agreement instances per slot.
    instances: BTreeMap<SchainIndex, BinConsensusInstance>,
    /// Decisions per slot.
    decided: BTreeMap<SchainIndex, bool>,
    /// Agreement seeded for this height.
    started: bool,
    /// Winning slot and its block hash, once chosen.
    chosen: Option<(SchainIndex, Hash)>,
    /// Block-signature shares over the chosen hash.
    block_shares: Option<SigShareSet>,
    /// The aggregated block signature, once quorum is reached.
    block_sig: Option<ThresholdSignature>,
    /// Block-signature shares that arrived before the winner was chosen.
    early_block_shares: BTreeMap<SchainIndex, (Hash, SigShare)>,
    /// The winning proposal's bytes, once fetched or received.
    winning_proposal: Option<BlockProposal>,
    /// Consensus messages for this height received before it became
    /// current.
    buffered: Vec<ConsensusMessage>,
}

/// Routes per-height consensus traffic and decides each height's block.
pub struct BlockConsensus {
    committee: Arc<Committee>,
    key: Arc<KeyPair>,
    /// Highest committed height; the working height is the next one.
    last_committed: BlockId,
    /// Threshold signature of the last committed block, seeding the
    /// priority order of the working height.
    priority_seed: Option<ThresholdSignature>,
    heights: HashMap<BlockId, HeightState>,
    /// Per-sender monotonic id for our outgoing consensus messages.
    next_msg_id: u64,
    /// Re-arm interval for the proposal-receipt window.
    proposal_timeout: Duration,
}

impl BlockConsensus {
    pub fn new(
        committee: Arc<Committee>,
        key: Arc<KeyPair>,
        proposal_timeout: Duration,
    ) -> BlockConsensus {
        BlockConsensus {
            committee,
            key,
            last_committed: BlockId(0),
            priority_seed: None,
            heights: HashMap::new(),
            next_msg_id: 0,
            proposal_timeout,
        }
    }

    /// The height currently being agreed on.
    pub fn working_height(&self) -> BlockId {
        self.last_committed.next()
    }

    /// Whether agreement has been seeded for the working height.
    pub fn is_started(&self, block_id: BlockId) -> bool {
        self.heights
            .get(&block_id)
            .map(|h| h.started)
            .unwrap_or(false)
    }

    /// Move to a new working height after a commit (or catch-up), dropping
    /// state at or below the committed height and draining messages that
    /// were buffered for the new height.
    pub fn advance_to(
        &mut self,
        committed: BlockId,
        committed_sig: Option<ThresholdSignature>,
    ) -> Vec<Action> {
        self.last_committed = committed;
        self.priority_seed = committed_sig;
        self.heights.retain(|h, _| *h > committed);

        let working = self.working_height();
        let buffered = self
            .heights
            .get_mut(&working)
            .map(|state| std::mem::take(&mut state.buffered))
            .unwrap_or_default();
        let mut actions = Vec::new();
        for msg in buffered {
            actions.extend(self.on_consensus_message(msg));
        }
        actions
    }

    /// Restore in-flight agreement instances for the working height from
    /// persisted snapshots.
    pub fn restore_instances(&mut self, records: &[BinStateRecord]) -> Vec<Action> {
        let mut actions = Vec::new();
        let working = self.working_height();
        let mut any_decided = false;
        for record in records {
            if record.block_id != working {
                continue;
            }
            let (instance, restore_actions) =
                BinConsensusInstance::restore(record, self.committee.clone(), self.key.clone());
            let state = self.heights.entry(working).or_default();
            state.started = true;
            if let Some(bit) = instance.decided() {
                state.decided.insert(record.proposer_index, bit);
                any_decided = true;
            }
            state.instances.insert(record.proposer_index, instance);
            actions.extend(self.seal(restore_actions));
        }
        // Snapshots may already carry every decision the winner choice
        // needs.
        if any_decided {
            actions.extend(self.try_choose_winner(working));
        }
        actions
    }

    /// Re-seed DA-proofs loaded from disk for the working height.
    pub fn restore_da_proofs(&mut self, proofs: Vec<DaProof>) {
        let working = self.working_height();
        let state = self.heights.entry(working).or_default();
        for proof in proofs {
            if proof.block_id == working {
                state.da_proofs.insert(proof.proposer_index, proof);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Proposal intake (C2/C3)
    // ═══════════════════════════════════════════════════════════════════════

    /// Our own proposal was built: open its DA share set with our own
    /// share already counted.
    pub fn on_own_proposal(&mut self, proposal: &BlockProposal) -> Vec<Action> {
        let block_id = proposal.block_id;
        let hash = proposal.hash();
        let message = da_proof_message(&hash);
        let mut shares = SigShareSet::new(message.clone(), self.committee.quorum());
        if let Err(e) = shares.add_share(self.key.sign_share(&message), &self.committee) {
            warn!(block_id = %block_id, error = %e, "Could not sign own DA share");
        }
        let state = self.heights.entry(block_id).or_default();
        state.own_hash = Some(hash);
        state.own_da_shares = Some(shares);
        state.proposal_hashes.insert(self.key.index(), hash);
        vec![]
    }

    /// A peer's proposal arrived over the delivery layer.
    pub fn on_proposal_received(&mut self, proposal: BlockProposal) -> Vec<Action> {
        let block_id = proposal.block_id;
        let proposer = proposal.proposer_index;

        if block_id <= self.last_committed {
            trace!(block_id = %block_id, proposer = %proposer, "Proposal for old height, dropping");
            return vec![];
        }
        if block_id.0 > self.working_height().0 + MAX_HEIGHT_AHEAD {
            warn!(block_id = %block_id, proposer = %proposer, "Proposal too far ahead, dropping");
            return vec![];
        }
        if proposal.schain_id != self.committee.schain_id() {
            warn!(block_id = %block_id, "Proposal for foreign schain, dropping");
            return vec![];
        }
        if !self.committee.contains(proposer) || proposer == self.key.index() {
            warn!(block_id = %block_id, proposer = %proposer, "Proposal from invalid seat, dropping");
            return vec![];
        }
        if let Err(e) = proposal.verify_signature(&self.committee) {
            warn!(
                block_id = %block_id,
                proposer = %proposer,
                error = %e,
                "Proposal signature invalid, dropping"
            );
            return vec![];
        }

        let hash = proposal.hash();
        let state = self.heights.entry(block_id).or_default();
        match state.proposal_hashes.get(&proposer).copied() {
            Some(known) if known != hash => {
                // Conflicting proposals for the same slot: equivocation.
                // Keep the first, sign nothing for the second.
                warn!(
                    block_id = %block_id,
                    proposer = %proposer,
                    first = %known,
                    second = %hash,
                    "Equivocating proposer detected, dropping conflicting proposal"
                );
                return vec![];
            }
            Some(_) => {
                // Same bytes pushed again (typically a restarted
                // proposer rebuilding its DA set); the share is
                // deterministic, so answering again is idempotent.
                trace!(block_id = %block_id, proposer = %proposer, "Duplicate proposal, re-sending share");
                return vec![Action::SendDaShare {
                    dst: proposer,
                    block_id,
                    proposer_index: proposer,
                    block_hash: hash,
                    share: self.key.sign_share(&da_proof_message(&hash)),
                }];
            }
            None => {
                state.proposal_hashes.insert(proposer, hash);
            }
        }

        debug!(
            block_id = %block_id,
            proposer = %proposer,
            hash = %hash,
            "Proposal accepted, answering with DA share"
        );
        let mut actions = vec![Action::PersistProposal {
            proposal: proposal.clone(),
        }];

        // The winner's bytes may arrive after the winner was chosen.
        if state.chosen == Some((proposer, hash)) && state.winning_proposal.is_none() {
            state.winning_proposal = Some(proposal);
            actions.extend(self.try_finalize(block_id));
        }

        actions.push(Action::SendDaShare {
            dst: proposer,
            block_id,
            proposer_index: proposer,
            block_hash: hash,
            share: self.key.sign_share(&da_proof_message(&hash)),
        });
        actions
    }

    /// A DA share came back for our own proposal push.
    pub fn on_da_share(
        &mut self,
        block_id: BlockId,
        proposer_index: SchainIndex,
        block_hash: Hash,
        share: SigShare,
    ) -> Vec<Action> {
        if proposer_index != self.key.index() {
            warn!(
                block_id = %block_id,
                proposer = %proposer_index,
                "DA share for a slot we do not propose, dropping"
            );
            return vec![];
        }
        let Some(state) = self.heights.get_mut(&block_id) else {
            trace!(block_id = %block_id, "DA share for unknown height, dropping");
            return vec![];
        };
        if state.own_hash != Some(block_hash) {
            warn!(block_id = %block_id, "DA share over wrong hash, dropping");
            return vec![];
        }
        let Some(shares) = state.own_da_shares.as_mut() else {
            return vec![];
        };
        match shares.add_share(share, &self.committee) {
            Ok(ShareOutcome::ReachedQuorum) => {}
            Ok(_) => return vec![],
            Err(e) => {
                warn!(block_id = %block_id, error = %e, "Invalid DA share, dropping");
                return vec![];
            }
        }

        let threshold_sig = shares
            .aggregate()
            .expect("quorum was just reached");
        let proof = DaProof {
            block_id,
            proposer_index,
            block_hash,
            threshold_sig,
        };
        info!(block_id = %block_id, "DA-proof complete for own proposal, advertising");
        // on_da_proof persists the proof and may start the height.
        let mut actions = self.on_da_proof(proof.clone());
        actions.push(Action::EnqueueItem {
            item: conclave_core::OutboundItem::DaProof(proof),
        });
        actions
    }

    /// A DA-proof arrived (from a proposer, or our own completed one).
    pub fn on_da_proof(&mut self, proof: DaProof) -> Vec<Action> {
        let block_id = proof.block_id;
        let proposer = proof.proposer_index;

        if block_id <= self.last_committed {
            trace!(block_id = %block_id, "DA-proof for old height, dropping");
            return vec![];
        }
        if block_id.0 > self.working_height().0 + MAX_HEIGHT_AHEAD {
            warn!(block_id = %block_id, "DA-proof too far ahead, dropping");
            return vec![];
        }
        if !self.committee.contains(proposer) {
            warn!(block_id = %block_id, proposer = %proposer, "DA-proof for invalid seat, dropping");
            return vec![];
        }
        if let Err(e) = proof.verify(&self.committee) {
            warn!(
                block_id = %block_id,
                proposer = %proposer,
                error = %e,
                "DA-proof failed verification, dropping"
            );
            return vec![];
        }

        let quorum = self.committee.quorum();
        let working = self.working_height();
        let state = self.heights.entry(block_id).or_default();
        if state.da_proofs.contains_key(&proposer) {
            return vec![];
        }
        if let Some(known) = state.proposal_hashes.get(&proposer) {
            if *known != proof.block_hash {
                // A quorum vouched for different bytes than the ones we
                // received; the proof wins.
                warn!(
                    block_id = %block_id,
                    proposer = %proposer,
                    "DA-proof hash differs from the proposal we hold"
                );
            }
        }
        debug!(block_id = %block_id, proposer = %proposer, "DA-proof recorded");
        state.da_proofs.insert(proposer, proof.clone());
        let start_now =
            block_id == working && !state.started && state.da_proofs.len() as u64 >= quorum;

        let mut actions = vec![Action::PersistDaProof { proof }];
        if start_now {
            actions.extend(self.start_consensus(block_id));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Agreement (C6 orchestration)
    // ═══════════════════════════════════════════════════════════════════════

    /// The proposal-receipt window for a height expired.
    ///
    /// Slots still missing a DA-proof start with estimate 0. With no proof
    /// at all the window re-arms instead: an agreement seeded entirely
    /// with zeros can only decide "no block", so waiting is the only move
    /// that can make the height commit.
    pub fn on_proposal_timeout(&mut self, block_id: BlockId) -> Vec<Action> {
        if block_id != self.working_height() || self.is_started(block_id) {
            return vec![];
        }
        let proofs = self
            .heights
            .get(&block_id)
            .map(|s| s.da_proofs.len())
            .unwrap_or(0);
        if proofs == 0 {
            debug!(block_id = %block_id, "Proposal window expired with no DA-proof, re-arming");
            return vec![Action::SetTimer {
                id: TimerId::ProposalReceipt(block_id),
                duration: self.proposal_timeout,
            }];
        }
        info!(
            block_id = %block_id,
            proofs,
            "Proposal window expired, starting agreement with missing slots at 0"
        );
        self.start_consensus(block_id)
    }

    /// Seed every slot's agreement instance. Idempotent; a no-op for any
    /// height but the working one.
    fn start_consensus(&mut self, block_id: BlockId) -> Vec<Action> {
        if block_id != self.working_height() {
            return vec![];
        }
        let committee = self.committee.clone();
        let key = self.key.clone();
        let state = self.heights.entry(block_id).or_default();
        if state.started {
            return vec![];
        }
        state.started = true;

        info!(
            block_id = %block_id,
            proofs = state.da_proofs.len(),
            "Starting block consensus"
        );
        let mut raw = Vec::new();
        for proposer in committee.seats() {
            let est = state.da_proofs.contains_key(&proposer);
            let instance = state
                .instances
                .entry(proposer)
                .or_insert_with(|| {
                    BinConsensusInstance::new(
                        SlotKey::new(block_id, proposer),
                        committee.clone(),
                        key.clone(),
                    )
                });
            raw.extend(instance.start(est));
        }
        let mut actions = vec![Action::CancelTimer {
            id: TimerId::ProposalReceipt(block_id),
        }];
        actions.extend(self.seal(raw));
        actions
    }

    /// Route a verified consensus message to its slot's instance.
    pub fn on_consensus_message(&mut self, msg: ConsensusMessage) -> Vec<Action> {
        if msg.block_id <= self.last_committed {
            trace!(block_id = %msg.block_id, "Consensus message below committed height, dropping");
            return vec![];
        }
        if !self.committee.contains(msg.src_index) {
            warn!(src = %msg.src_index, "Consensus message from out-of-range seat, dropping");
            return vec![];
        }
        if !self.committee.contains(msg.proposer_index) {
            warn!(
                proposer = %msg.proposer_index,
                "Consensus message for out-of-range slot, dropping"
            );
            return vec![];
        }

        let working = self.working_height();
        if msg.block_id > working {
            if msg.block_id.0 > working.0 + MAX_HEIGHT_AHEAD {
                warn!(block_id = %msg.block_id, "Consensus message too far ahead, dropping");
                return vec![];
            }
            let state = self.heights.entry(msg.block_id).or_default();
            if state.buffered.len() >= MAX_BUFFERED_MESSAGES {
                warn!(block_id = %msg.block_id, "Future-height buffer full, dropping message");
                return vec![];
            }
            state.buffered.push(msg);
            return vec![];
        }

        let committee = self.committee.clone();
        let key = self.key.clone();
        let proposer = msg.proposer_index;
        let state = self.heights.entry(msg.block_id).or_default();
        let instance = state.instances.entry(proposer).or_insert_with(|| {
            BinConsensusInstance::new(SlotKey::new(msg.block_id, proposer), committee, key)
        });
        let raw = instance.handle_message(&msg);
        self.seal(raw)
    }

    /// One slot decided; check whether the height's winner is now known.
    pub fn on_slot_decided(
        &mut self,
        block_id: BlockId,
        proposer_index: SchainIndex,
        decision: bool,
    ) -> Vec<Action> {
        if block_id != self.working_height() {
            return vec![];
        }
        let state = self.heights.entry(block_id).or_default();
        state.decided.insert(proposer_index, decision);
        debug!(
            block_id = %block_id,
            proposer = %proposer_index,
            decision,
            decided = state.decided.len(),
            "Slot decided"
        );
        self.try_choose_winner(block_id)
    }

    /// Walk the priority order: the first decided-1 slot wins; an
    /// undecided slot ahead of every 1 means we must keep waiting.
    fn try_choose_winner(&mut self, block_id: BlockId) -> Vec<Action> {
        let order = proposer_priority(self.committee.n(), self.priority_seed.as_ref());
        let Some(state) = self.heights.get_mut(&block_id) else {
            return vec![];
        };
        if state.chosen.is_some() {
            return vec![];
        }
        let mut winner = None;
        for candidate in &order {
            match state.decided.get(candidate) {
                None => return vec![],
                Some(true) => {
                    winner = Some(*candidate);
                    break;
                }
                Some(false) => continue,
            }
        }
        let Some(winner) = winner else {
            if state.decided.len() as u64 == self.committee.n() {
                // Every slot decided 0: no proposer got a DA quorum. The
                // height cannot produce a block until catch-up supplies
                // one.
                warn!(block_id = %block_id, "All slots decided 0, height stalled");
            }
            return vec![];
        };

        let Some(proof) = state.da_proofs.get(&winner) else {
            // Decided 1 without a local proof (adopted via commits); the
            // hash arrives with the proof or via catch-up.
            warn!(
                block_id = %block_id,
                winner = %winner,
                "Winner chosen but no local DA-proof, awaiting catch-up"
            );
            return vec![];
        };
        let block_hash = proof.block_hash;
        state.chosen = Some((winner, block_hash));
        info!(
            block_id = %block_id,
            winner = %winner,
            hash = %block_hash,
            "Winning proposer chosen, starting block signature phase"
        );

        // Open the block-signature set with our own share, then replay any
        // shares that arrived early.
        let message = block_sign_message(&block_hash);
        let mut shares = SigShareSet::new(message.clone(), self.committee.quorum());
        let own_share = self.key.sign_share(&message);
        if let Err(e) = shares.add_share(own_share.clone(), &self.committee) {
            warn!(block_id = %block_id, error = %e, "Could not sign own block share");
        }
        let early = std::mem::take(&mut state.early_block_shares);
        state.block_shares = Some(shares);

        let mut actions = vec![
            Action::BroadcastBlockSignShare {
                block_id,
                block_hash,
                share: own_share,
            },
            Action::FetchProposal {
                block_id,
                proposer_index: winner,
            },
        ];
        for (_, (hash, share)) in early {
            actions.extend(self.on_block_sign_share(block_id, hash, share));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Block signature phase (C4)
    // ═══════════════════════════════════════════════════════════════════════

    /// A block-signature share arrived.
    pub fn on_block_sign_share(
        &mut self,
        block_id: BlockId,
        block_hash: Hash,
        share: SigShare,
    ) -> Vec<Action> {
        if block_id <= self.last_committed {
            return vec![];
        }
        if block_id.0 > self.working_height().0 + MAX_HEIGHT_AHEAD {
            warn!(block_id = %block_id, "Block share too far ahead, dropping");
            return vec![];
        }
        let state = self.heights.entry(block_id).or_default();

        let Some((_, chosen_hash)) = state.chosen else {
            // We have not chosen yet; park the share until we do.
            state
                .early_block_shares
                .entry(share.signer)
                .or_insert((block_hash, share));
            return vec![];
        };
        if block_hash != chosen_hash {
            warn!(
                block_id = %block_id,
                signer = %share.signer,
                "Block share over a different hash than the chosen block, dropping"
            );
            return vec![];
        }
        let Some(shares) = state.block_shares.as_mut() else {
            return vec![];
        };
        match shares.add_share(share, &self.committee) {
            Ok(ShareOutcome::ReachedQuorum) => {}
            Ok(_) => return vec![],
            Err(e) => {
                warn!(block_id = %block_id, error = %e, "Invalid block share, dropping");
                return vec![];
            }
        }
        state.block_sig = shares.aggregate();
        info!(block_id = %block_id, "Block signature aggregated");
        self.try_finalize(block_id)
    }

    /// The proposal store answered our fetch for the winning proposal.
    pub fn on_proposal_fetched(
        &mut self,
        block_id: BlockId,
        proposer_index: SchainIndex,
        proposal: Option<BlockProposal>,
    ) -> Vec<Action> {
        let Some(state) = self.heights.get_mut(&block_id) else {
            return vec![];
        };
        match (state.chosen, proposal) {
            (Some((winner, hash)), Some(proposal))
                if winner == proposer_index && proposal.hash() == hash =>
            {
                state.winning_proposal = Some(proposal);
                self.try_finalize(block_id)
            }
            (Some((winner, _)), None) if winner == proposer_index => {
                // Not held locally; the bytes will arrive via a late
                // proposal push or catch-up.
                debug!(
                    block_id = %block_id,
                    winner = %winner,
                    "Winning proposal not held locally yet"
                );
                vec![]
            }
            _ => vec![],
        }
    }

    /// Finalize once the chosen proposal's bytes and the aggregated block
    /// signature are both present.
    fn try_finalize(&mut self, block_id: BlockId) -> Vec<Action> {
        let Some(state) = self.heights.get_mut(&block_id) else {
            return vec![];
        };
        let (Some(proposal), Some(threshold_sig)) =
            (state.winning_proposal.clone(), state.block_sig.clone())
        else {
            return vec![];
        };
        info!(block_id = %block_id, "Height finalized");
        vec![Action::EnqueueInternal {
            event: Event::BlockFinalized {
                block: CommittedBlock {
                    proposal,
                    threshold_sig,
                },
            },
        }]
    }

    /// Assign message ids and envelope signatures to instance broadcasts,
    /// and loop each one back to ourselves through the dispatch queue.
    fn seal(&mut self, raw: Vec<Action>) -> Vec<Action> {
        let mut actions = Vec::with_capacity(raw.len());
        for action in raw {
            match action {
                Action::BroadcastConsensus { mut msg } => {
                    self.next_msg_id += 1;
                    msg.msg_id = MsgId(self.next_msg_id);
                    msg.sign(&self.key);
                    actions.push(Action::BroadcastConsensus { msg: msg.clone() });
                    actions.push(Action::EnqueueInternal {
                        event: Event::ConsensusReceived { msg },
                    });
                }
                other => actions.push(other),
            }
        }
        actions
    }
}
