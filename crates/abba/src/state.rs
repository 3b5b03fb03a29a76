//! Binary-agreement instance state machine.

use conclave_core::{Action, ConsensusKind, ConsensusMessage, Event};
use conclave_types::{
    coin_message, coin_value, BinRound, BinStateRecord, BitPair, BlockId, Committee, KeyPair,
    MsgId, SchainIndex, SigShareSet, Signature,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Key of one agreement slot: (height, proposer seat).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey {
    pub block_id: BlockId,
    pub proposer_index: SchainIndex,
}

impl SlotKey {
    pub fn new(block_id: BlockId, proposer_index: SchainIndex) -> SlotKey {
        SlotKey {
            block_id,
            proposer_index,
        }
    }
}

/// One binary Byzantine agreement instance.
///
/// Created on the first message for its slot or when the coordinator seeds
/// the height; broadcasts nothing until [`start`](Self::start) supplies the
/// initial estimate. After deciding, the instance is frozen: it only echoes
/// its commit for lagging peers until the height commits and the instance
/// is discarded.
pub struct BinConsensusInstance {
    slot: SlotKey,
    committee: Arc<Committee>,
    key: Arc<KeyPair>,

    started: bool,
    round: BinRound,
    est: bool,
    decided: Option<bool>,

    /// Senders of `BV(r, b)`, kept for future rounds too since messages
    /// arrive ahead of our local round.
    bv_echoes: BTreeMap<(BinRound, bool), BTreeSet<SchainIndex>>,
    /// `BV(r, b)` we already broadcast (initial estimate or amplification).
    bv_sent: BTreeSet<(BinRound, bool)>,
    /// Values admitted into `bin_values` per round.
    bin_values: BTreeMap<BinRound, BitPair>,
    /// Rounds for which our `AUX` went out.
    aux_sent: BTreeSet<BinRound>,
    /// First auxiliary value per sender per round.
    aux_votes: BTreeMap<BinRound, BTreeMap<SchainIndex, bool>>,
    /// Coin shares per round.
    coin_shares: BTreeMap<BinRound, SigShareSet>,
    /// First commit bit per sender.
    commit_votes: BTreeMap<SchainIndex, bool>,
}

impl BinConsensusInstance {
    pub fn new(slot: SlotKey, committee: Arc<Committee>, key: Arc<KeyPair>) -> Self {
        BinConsensusInstance {
            slot,
            committee,
            key,
            started: false,
            round: BinRound(0),
            est: false,
            decided: None,
            bv_echoes: BTreeMap::new(),
            bv_sent: BTreeSet::new(),
            bin_values: BTreeMap::new(),
            aux_sent: BTreeSet::new(),
            aux_votes: BTreeMap::new(),
            coin_shares: BTreeMap::new(),
            commit_votes: BTreeMap::new(),
        }
    }

    /// Rebuild a frozen-or-running instance from its persisted snapshot.
    ///
    /// The echo and vote sets start empty; re-broadcasting our own `BV` and
    /// `AUX` for the snapshot round prompts peers that already progressed
    /// to answer with commits, and peers in the same round to re-count us.
    pub fn restore(
        record: &BinStateRecord,
        committee: Arc<Committee>,
        key: Arc<KeyPair>,
    ) -> (Self, Vec<Action>) {
        let slot = SlotKey::new(record.block_id, record.proposer_index);
        let mut instance = BinConsensusInstance::new(slot, committee, key);
        instance.started = true;
        instance.round = record.round;
        instance.est = record.est;
        instance.decided = record.decided;
        instance.bin_values.insert(record.round, record.bin_values);

        let mut actions = Vec::new();
        if let Some(bit) = record.decided {
            actions.push(instance.make_broadcast(ConsensusKind::Commit, record.round, bit, false));
        } else {
            instance.bv_sent.insert((record.round, record.est));
            actions.push(instance.make_broadcast(ConsensusKind::Bv, record.round, record.est, false));
            if record.aux_sent.zero || record.aux_sent.one {
                instance.aux_sent.insert(record.round);
                let bit = record.aux_sent.sole_value().unwrap_or(record.est);
                actions.push(instance.make_broadcast(ConsensusKind::Aux, record.round, bit, true));
            }
        }
        info!(
            block_id = %record.block_id,
            proposer = %record.proposer_index,
            round = %record.round,
            est = record.est,
            decided = ?record.decided,
            "Restored agreement instance from snapshot"
        );
        (instance, actions)
    }

    pub fn slot(&self) -> SlotKey {
        self.slot
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn round(&self) -> BinRound {
        self.round
    }

    pub fn decided(&self) -> Option<bool> {
        self.decided
    }

    /// Begin the protocol with the initial estimate.
    ///
    /// Idempotent; messages recorded before the start are folded in by the
    /// first progress pass. An instance that already adopted a decision
    /// from a commit quorum has nothing left to run.
    pub fn start(&mut self, est: bool) -> Vec<Action> {
        if self.started || self.decided.is_some() {
            self.started = true;
            return vec![];
        }
        self.started = true;
        self.est = est;
        debug!(
            block_id = %self.slot.block_id,
            proposer = %self.slot.proposer_index,
            est,
            "Starting binary agreement"
        );

        let mut actions = vec![self.snapshot_action()];
        self.bv_sent.insert((self.round, est));
        actions.push(self.make_broadcast(ConsensusKind::Bv, self.round, est, false));
        actions.extend(self.progress());
        actions
    }

    /// Process one protocol message for this slot. The envelope signature
    /// and signer range were checked by the coordinator.
    pub fn handle_message(&mut self, msg: &ConsensusMessage) -> Vec<Action> {
        if let Some(bit) = self.decided {
            // Frozen: answer lagging peers with our commit, count theirs.
            if msg.kind == ConsensusKind::Commit {
                return self.on_commit(msg.src_index, msg.bit);
            }
            if msg.src_index != self.key.index() && msg.round >= self.round {
                trace!(
                    block_id = %self.slot.block_id,
                    proposer = %self.slot.proposer_index,
                    from = %msg.src_index,
                    "Echoing commit to lagging peer"
                );
                return vec![self.make_broadcast(ConsensusKind::Commit, self.round, bit, false)];
            }
            return vec![];
        }

        match msg.kind {
            ConsensusKind::Bv => self.on_bv(msg.round, msg.bit, msg.src_index),
            ConsensusKind::Aux => self.on_aux(msg),
            ConsensusKind::Commit => self.on_commit(msg.src_index, msg.bit),
        }
    }

    fn on_bv(&mut self, round: BinRound, bit: bool, from: SchainIndex) -> Vec<Action> {
        self.bv_echoes.entry((round, bit)).or_default().insert(from);
        self.progress()
    }

    fn on_aux(&mut self, msg: &ConsensusMessage) -> Vec<Action> {
        let votes = self.aux_votes.entry(msg.round).or_default();
        if let Some(existing) = votes.get(&msg.src_index) {
            if *existing != msg.bit {
                warn!(
                    block_id = %self.slot.block_id,
                    proposer = %self.slot.proposer_index,
                    round = %msg.round,
                    from = %msg.src_index,
                    "Conflicting AUX from same sender, dropping"
                );
            }
            return vec![];
        }
        let Some(share) = msg.coin_share.clone() else {
            warn!(
                block_id = %self.slot.block_id,
                proposer = %self.slot.proposer_index,
                round = %msg.round,
                from = %msg.src_index,
                "AUX without coin share, dropping"
            );
            return vec![];
        };
        if share.signer != msg.src_index {
            warn!(
                block_id = %self.slot.block_id,
                from = %msg.src_index,
                claimed = %share.signer,
                "AUX coin share signer mismatch, dropping"
            );
            return vec![];
        }

        let shares = self.coin_shares.entry(msg.round).or_insert_with(|| {
            SigShareSet::new(
                coin_message(
                    self.committee.schain_id(),
                    self.slot.block_id,
                    self.slot.proposer_index,
                    msg.round,
                ),
                self.committee.quorum(),
            )
        });
        if let Err(e) = shares.add_share(share, &self.committee) {
            warn!(
                block_id = %self.slot.block_id,
                proposer = %self.slot.proposer_index,
                round = %msg.round,
                from = %msg.src_index,
                error = %e,
                "Invalid coin share on AUX, dropping message"
            );
            return vec![];
        }
        votes.insert(msg.src_index, msg.bit);
        self.progress()
    }

    fn on_commit(&mut self, from: SchainIndex, bit: bool) -> Vec<Action> {
        if self.commit_votes.contains_key(&from) {
            return vec![];
        }
        self.commit_votes.insert(from, bit);

        if self.decided.is_some() {
            return vec![];
        }
        // Adoption: f+1 matching commits contain at least one honest node,
        // so the value is the decision.
        let matching = self.commit_votes.values().filter(|b| **b == bit).count() as u64;
        if matching >= self.committee.f() + 1 {
            info!(
                block_id = %self.slot.block_id,
                proposer = %self.slot.proposer_index,
                bit,
                "Adopting decision from commit quorum"
            );
            return self.decide(bit);
        }
        vec![]
    }

    /// Drive the current round as far as the recorded messages allow.
    ///
    /// Runs to a fixpoint: advancing a round may immediately satisfy the
    /// next one from early-arrived messages.
    fn progress(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.started || self.decided.is_some() {
            return actions;
        }
        loop {
            let round = self.round;
            let mut moved = false;

            // Step 2: amplify and admit.
            for bit in [false, true] {
                let echoes = self
                    .bv_echoes
                    .get(&(round, bit))
                    .map(|s| s.len() as u64)
                    .unwrap_or(0);
                if echoes >= self.committee.f() + 1 && !self.bv_sent.contains(&(round, bit)) {
                    self.bv_sent.insert((round, bit));
                    actions.push(self.make_broadcast(ConsensusKind::Bv, round, bit, false));
                    moved = true;
                }
                let admitted = self.bin_values.entry(round).or_default();
                if echoes >= self.committee.quorum() && !admitted.contains(bit) {
                    admitted.insert(bit);
                    trace!(
                        block_id = %self.slot.block_id,
                        proposer = %self.slot.proposer_index,
                        round = %round,
                        bit,
                        "Admitted into bin_values"
                    );
                    moved = true;
                }
            }

            // Step 3: first admitted value goes out as AUX with our coin
            // share.
            let admitted = *self.bin_values.entry(round).or_default();
            if !admitted.is_empty() && !self.aux_sent.contains(&round) {
                let bit = admitted.sole_value().unwrap_or(self.est);
                self.aux_sent.insert(round);
                actions.push(self.make_broadcast(ConsensusKind::Aux, round, bit, true));
                moved = true;
            }

            // Steps 4-6: aux quorum plus coin quorum end the round.
            if let Some(step) = self.try_finish_round(round) {
                match step {
                    RoundOutcome::Decide(bit) => {
                        actions.extend(self.decide(bit));
                        return actions;
                    }
                    RoundOutcome::Advance(next_est) => {
                        self.est = next_est;
                        self.round = round.next();
                        debug!(
                            block_id = %self.slot.block_id,
                            proposer = %self.slot.proposer_index,
                            round = %self.round,
                            est = next_est,
                            "Advancing to next round"
                        );
                        // Durable before anything of round r+1 goes out.
                        actions.push(self.snapshot_action());
                        if !self.bv_sent.contains(&(self.round, next_est)) {
                            self.bv_sent.insert((self.round, next_est));
                            actions.push(self.make_broadcast(
                                ConsensusKind::Bv,
                                self.round,
                                next_est,
                                false,
                            ));
                        }
                        moved = true;
                    }
                }
            }

            if !moved {
                return actions;
            }
        }
    }

    /// Evaluate steps 4-6 for `round`. `None` means the round is not ready.
    fn try_finish_round(&self, round: BinRound) -> Option<RoundOutcome> {
        let admitted = *self.bin_values.get(&round)?;
        if admitted.is_empty() {
            return None;
        }
        let quorum = self.committee.quorum();

        let votes = self.aux_votes.get(&round)?;
        let mut zero = 0u64;
        let mut one = 0u64;
        for (_, bit) in votes.iter() {
            // Only values backed by bin_values count toward S_r.
            if admitted.contains(*bit) {
                if *bit {
                    one += 1;
                } else {
                    zero += 1;
                }
            }
        }
        if zero + one < quorum {
            return None;
        }

        let coin_sig = self.coin_shares.get(&round)?.aggregate()?;
        let coin = coin_value(&coin_sig);
        debug!(
            block_id = %self.slot.block_id,
            proposer = %self.slot.proposer_index,
            round = %round,
            coin,
            aux_zero = zero,
            aux_one = one,
            "Round complete"
        );

        // Prefer the quorum set that decides; any valid 2f+1 subset is a
        // legitimate S_r.
        let coin_count = if coin { one } else { zero };
        let other_count = if coin { zero } else { one };
        if coin_count >= quorum {
            Some(RoundOutcome::Decide(coin))
        } else if other_count >= quorum {
            Some(RoundOutcome::Advance(!coin))
        } else {
            Some(RoundOutcome::Advance(coin))
        }
    }

    fn decide(&mut self, bit: bool) -> Vec<Action> {
        self.decided = Some(bit);
        info!(
            block_id = %self.slot.block_id,
            proposer = %self.slot.proposer_index,
            round = %self.round,
            bit,
            "Decided"
        );
        vec![
            self.snapshot_action(),
            self.make_broadcast(ConsensusKind::Commit, self.round, bit, false),
            Action::EnqueueInternal {
                event: Event::SlotDecided {
                    block_id: self.slot.block_id,
                    proposer_index: self.slot.proposer_index,
                    decision: bit,
                },
            },
        ]
    }

    fn snapshot_action(&self) -> Action {
        let bin_values = self
            .bin_values
            .get(&self.round)
            .copied()
            .unwrap_or_default();
        let mut aux_sent = BitPair::default();
        if self.aux_sent.contains(&self.round) {
            // The value we sent is recoverable from bin_values on restore.
            aux_sent.insert(bin_values.sole_value().unwrap_or(self.est));
        }
        Action::PersistBinState {
            record: BinStateRecord {
                block_id: self.slot.block_id,
                proposer_index: self.slot.proposer_index,
                round: self.round,
                est: self.est,
                bin_values,
                aux_sent,
                decided: self.decided,
            },
        }
    }

    /// Build an unsealed broadcast for this slot; the coordinator assigns
    /// the message id and envelope signature.
    fn make_broadcast(
        &self,
        kind: ConsensusKind,
        round: BinRound,
        bit: bool,
        with_coin_share: bool,
    ) -> Action {
        let coin_share = with_coin_share.then(|| {
            self.key.sign_share(&coin_message(
                self.committee.schain_id(),
                self.slot.block_id,
                self.slot.proposer_index,
                round,
            ))
        });
        Action::BroadcastConsensus {
            msg: ConsensusMessage {
                src_index: self.key.index(),
                msg_id: MsgId(0),
                block_id: self.slot.block_id,
                proposer_index: self.slot.proposer_index,
                round,
                kind,
                bit,
                coin_share,
                signature: Signature::zero(),
            },
        }
    }
}

enum RoundOutcome {
    Decide(bool),
    Advance(bool),
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::test_utils::test_committee;

    /// Drives one instance per committee seat, delivering every broadcast
    /// to every instance (including the sender) until quiescent.
    struct TestNet {
        instances: Vec<BinConsensusInstance>,
        persisted: Vec<Vec<BinStateRecord>>,
    }

    impl TestNet {
        fn new(n: u64, block_id: BlockId, proposer: SchainIndex) -> TestNet {
            let (committee, keys) = test_committee(n);
            let committee = Arc::new(committee);
            let instances = keys
                .into_iter()
                .map(|k| {
                    BinConsensusInstance::new(
                        SlotKey::new(block_id, proposer),
                        committee.clone(),
                        Arc::new(k),
                    )
                })
                .collect::<Vec<_>>();
            let persisted = (0..n).map(|_| Vec::new()).collect();
            TestNet {
                instances,
                persisted,
            }
        }

        fn run(&mut self, estimates: &[bool]) {
            let mut inbox: Vec<ConsensusMessage> = Vec::new();
            for (i, inst) in self.instances.iter_mut().enumerate() {
                let actions = inst.start(estimates[i]);
                Self::collect(i, actions, &mut inbox, &mut self.persisted);
            }
            // Deliver until no instance produces new traffic.
            let mut guard = 0;
            while !inbox.is_empty() {
                guard += 1;
                assert!(guard < 10_000, "agreement failed to terminate");
                let batch = std::mem::take(&mut inbox);
                for msg in &batch {
                    for (i, inst) in self.instances.iter_mut().enumerate() {
                        let actions = inst.handle_message(msg);
                        Self::collect(i, actions, &mut inbox, &mut self.persisted);
                    }
                }
            }
        }

        fn collect(
            node: usize,
            actions: Vec<Action>,
            inbox: &mut Vec<ConsensusMessage>,
            persisted: &mut [Vec<BinStateRecord>],
        ) {
            for action in actions {
                match action {
                    Action::BroadcastConsensus { msg } => inbox.push(msg),
                    Action::PersistBinState { record } => persisted[node].push(record),
                    Action::EnqueueInternal { .. } => {}
                    other => panic!("unexpected action from instance: {}", other.type_name()),
                }
            }
        }

        fn decisions(&self) -> Vec<Option<bool>> {
            self.instances.iter().map(|i| i.decided()).collect()
        }
    }

    #[test]
    fn test_unanimous_one_decides_one() {
        let mut net = TestNet::new(4, BlockId(1), SchainIndex(1));
        net.run(&[true, true, true, true]);
        for d in net.decisions() {
            assert_eq!(d, Some(true));
        }
    }

    #[test]
    fn test_unanimous_zero_decides_zero() {
        let mut net = TestNet::new(4, BlockId(1), SchainIndex(3));
        net.run(&[false, false, false, false]);
        for d in net.decisions() {
            assert_eq!(d, Some(false));
        }
    }

    #[test]
    fn test_split_estimates_agree() {
        let mut net = TestNet::new(4, BlockId(2), SchainIndex(2));
        net.run(&[true, true, false, false]);
        let decisions = net.decisions();
        let first = decisions[0].expect("decided");
        for d in &decisions {
            assert_eq!(*d, Some(first));
        }
    }

    #[test]
    fn test_larger_committee_agrees() {
        let mut net = TestNet::new(7, BlockId(3), SchainIndex(5));
        net.run(&[true, false, true, false, true, false, true]);
        let decisions = net.decisions();
        let first = decisions[0].expect("decided");
        for d in &decisions {
            assert_eq!(*d, Some(first));
        }
    }

    #[test]
    fn test_commit_quorum_adoption() {
        let (committee, keys) = test_committee(4);
        let committee = Arc::new(committee);
        let slot = SlotKey::new(BlockId(5), SchainIndex(1));
        let mut lagger =
            BinConsensusInstance::new(slot, committee.clone(), Arc::new(keys[3].clone()));
        lagger.start(false);

        // f+1 = 2 matching commits decide for the lagging node.
        for (i, key) in keys[0..2].iter().enumerate() {
            let mut msg = ConsensusMessage {
                src_index: key.index(),
                msg_id: MsgId(i as u64),
                block_id: slot.block_id,
                proposer_index: slot.proposer_index,
                round: BinRound(0),
                kind: ConsensusKind::Commit,
                bit: true,
                coin_share: None,
                signature: Signature::zero(),
            };
            msg.sign(key);
            lagger.handle_message(&msg);
        }
        assert_eq!(lagger.decided(), Some(true));
    }

    #[test]
    fn test_single_commit_does_not_decide() {
        let (committee, keys) = test_committee(4);
        let committee = Arc::new(committee);
        let slot = SlotKey::new(BlockId(5), SchainIndex(1));
        let mut instance =
            BinConsensusInstance::new(slot, committee, Arc::new(keys[3].clone()));
        instance.start(false);

        let mut msg = ConsensusMessage {
            src_index: keys[0].index(),
            msg_id: MsgId(0),
            block_id: slot.block_id,
            proposer_index: slot.proposer_index,
            round: BinRound(0),
            kind: ConsensusKind::Commit,
            bit: true,
            coin_share: None,
            signature: Signature::zero(),
        };
        msg.sign(&keys[0]);
        instance.handle_message(&msg);
        assert_eq!(instance.decided(), None);
    }

    #[test]
    fn test_messages_before_start_are_folded_in() {
        let (committee, keys) = test_committee(4);
        let committee = Arc::new(committee);
        let slot = SlotKey::new(BlockId(6), SchainIndex(2));
        let mut instance =
            BinConsensusInstance::new(slot, committee, Arc::new(keys[0].clone()));

        // Three BV(0, 1) arrive before the coordinator starts the slot.
        for key in &keys[1..4] {
            let mut msg = ConsensusMessage {
                src_index: key.index(),
                msg_id: MsgId(0),
                block_id: slot.block_id,
                proposer_index: slot.proposer_index,
                round: BinRound(0),
                kind: ConsensusKind::Bv,
                bit: true,
                coin_share: None,
                signature: Signature::zero(),
            };
            msg.sign(key);
            assert!(instance.handle_message(&msg).is_empty());
        }

        // Starting with est 0 must still admit 1 (quorum of echoes) and
        // produce an AUX.
        let actions = instance.start(false);
        let sent_aux = actions.iter().any(|a| {
            matches!(
                a,
                Action::BroadcastConsensus {
                    msg: ConsensusMessage {
                        kind: ConsensusKind::Aux,
                        ..
                    }
                }
            )
        });
        assert!(sent_aux, "pre-start echoes should drive AUX after start");
    }

    #[test]
    fn test_conflicting_aux_dropped() {
        let (committee, keys) = test_committee(4);
        let committee = Arc::new(committee);
        let slot = SlotKey::new(BlockId(7), SchainIndex(1));
        let mut instance =
            BinConsensusInstance::new(slot, committee.clone(), Arc::new(keys[0].clone()));
        instance.start(true);

        let coin_msg = coin_message(
            committee.schain_id(),
            slot.block_id,
            slot.proposer_index,
            BinRound(0),
        );
        for bit in [true, false] {
            let mut msg = ConsensusMessage {
                src_index: keys[1].index(),
                msg_id: MsgId(0),
                block_id: slot.block_id,
                proposer_index: slot.proposer_index,
                round: BinRound(0),
                kind: ConsensusKind::Aux,
                bit,
                coin_share: Some(keys[1].sign_share(&coin_msg)),
                signature: Signature::zero(),
            };
            msg.sign(&keys[1]);
            instance.handle_message(&msg);
        }
        assert_eq!(
            instance.aux_votes.get(&BinRound(0)).unwrap().get(&keys[1].index()),
            Some(&true),
            "first AUX wins, conflicting one is dropped"
        );
    }

    #[test]
    fn test_restore_rebroadcasts_round_state() {
        let (committee, keys) = test_committee(4);
        let record = BinStateRecord {
            block_id: BlockId(10),
            proposer_index: SchainIndex(2),
            round: BinRound(2),
            est: true,
            bin_values: BitPair {
                zero: false,
                one: true,
            },
            aux_sent: BitPair {
                zero: false,
                one: true,
            },
            decided: None,
        };
        let (instance, actions) = BinConsensusInstance::restore(
            &record,
            Arc::new(committee),
            Arc::new(keys[0].clone()),
        );
        assert_eq!(instance.round(), BinRound(2));
        assert_eq!(instance.decided(), None);

        let kinds: Vec<ConsensusKind> = actions
            .iter()
            .filter_map(|a| match a {
                Action::BroadcastConsensus { msg } => Some(msg.kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![ConsensusKind::Bv, ConsensusKind::Aux]);
    }
}
