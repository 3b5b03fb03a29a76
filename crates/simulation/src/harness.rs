//! Deterministic multi-node harness.
//!
//! Every node's state machine runs against in-memory storage; the harness
//! owns a single virtual-time event queue and executes actions inline.
//! Given the same seed, a run produces identical results every time.

use crate::network::{NetworkConfig, NodeIndex, SimNetwork};
use conclave_core::{Action, Event, OutboundItem, StateMachine, TimerId};
use conclave_node::NodeStateMachine;
use conclave_storage::{BinStateDb, BlockDb, DaProofDb, MemStore, ProposalDb};
use conclave_types::test_utils::test_committee;
use conclave_types::{
    BlockId, BlockProposal, Committee, CommittedBlock, Hash, KeyPair, SchainIndex, Transaction,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Deterministic ordering key: virtual time then insertion sequence.
type EventKey = (Duration, u64);

struct SimNode {
    machine: Option<NodeStateMachine>,
    store: MemStore,
    proposal_db: ProposalDb,
    block_db: BlockDb,
    bin_db: BinStateDb,
    da_db: DaProofDb,
    committed: Vec<CommittedBlock>,
}

impl SimNode {
    fn fresh_dbs(store: &MemStore, seat: SchainIndex, n: u64) -> (ProposalDb, BlockDb, BinStateDb, DaProofDb) {
        let shared: Arc<dyn conclave_storage::OrderedByteMap> = Arc::new(store.clone());
        (
            ProposalDb::new(shared.clone(), seat, n),
            BlockDb::new(shared.clone()),
            BinStateDb::new(shared.clone()),
            DaProofDb::new(shared),
        )
    }
}

/// Statistics collected during a run.
#[derive(Debug, Default, Clone)]
pub struct SimStats {
    pub events_processed: u64,
    pub messages_sent: u64,
    /// Messages parked on a severed link or for a crashed node.
    pub messages_deferred: u64,
}

/// A committee of simulated nodes sharing one virtual clock.
pub struct SimCluster {
    committee: Arc<Committee>,
    keys: Vec<Arc<KeyPair>>,
    nodes: Vec<SimNode>,
    queue: BTreeMap<EventKey, (NodeIndex, Event)>,
    sequence: u64,
    now: Duration,
    network: SimNetwork,
    rng: ChaCha8Rng,
    timers: BTreeMap<(NodeIndex, TimerId), EventKey>,
    /// Traffic parked per severed (src, dst) link, flushed on heal.
    pending_links: BTreeMap<(NodeIndex, NodeIndex), Vec<Event>>,
    crashed: HashSet<NodeIndex>,
    muted: HashSet<NodeIndex>,
    no_propose: HashSet<NodeIndex>,
    proposal_timeout: Duration,
    stats: SimStats,
}

impl SimCluster {
    pub fn new(n: u64, seed: u64) -> SimCluster {
        Self::with_timeout(n, seed, Duration::from_millis(500))
    }

    pub fn with_timeout(n: u64, seed: u64, proposal_timeout: Duration) -> SimCluster {
        let (committee, keys) = test_committee(n);
        let committee = Arc::new(committee);
        let keys: Vec<Arc<KeyPair>> = keys.into_iter().map(Arc::new).collect();

        let nodes = keys
            .iter()
            .map(|key| {
                let store = MemStore::new().expect("fresh store");
                let (proposal_db, block_db, bin_db, da_db) =
                    SimNode::fresh_dbs(&store, key.index(), n);
                SimNode {
                    machine: Some(NodeStateMachine::new(
                        committee.clone(),
                        key.clone(),
                        proposal_timeout,
                    )),
                    store,
                    proposal_db,
                    block_db,
                    bin_db,
                    da_db,
                    committed: Vec::new(),
                }
            })
            .collect();

        let cluster = SimCluster {
            committee,
            keys,
            nodes,
            queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network: SimNetwork::new(NetworkConfig::default()),
            rng: ChaCha8Rng::seed_from_u64(seed),
            timers: BTreeMap::new(),
            pending_links: BTreeMap::new(),
            crashed: HashSet::new(),
            muted: HashSet::new(),
            no_propose: HashSet::new(),
            proposal_timeout,
            stats: SimStats::default(),
        };
        info!(n, seed, "Simulated cluster created");
        cluster
    }

    /// Bootstrap every node at height 0. Fault configuration (mute,
    /// partitions, suppressed proposals) applied before this call shapes
    /// the run from the first message.
    pub fn boot(&mut self) {
        for node in 0..self.nodes.len() {
            let actions = self.with_machine(node, |machine| {
                machine.bootstrap(BlockId(0), 0, Hash::ZERO, None, &[], vec![])
            });
            self.process_actions(node, actions);
        }
    }

    // ─── Observation ───

    pub fn committee(&self) -> &Committee {
        &self.committee
    }

    pub fn key(&self, node: NodeIndex) -> &KeyPair {
        &self.keys[node]
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// The height a node is currently working on.
    pub fn working_height(&self, node: NodeIndex) -> BlockId {
        self.nodes[node]
            .machine
            .as_ref()
            .map(|m| m.working_height())
            .unwrap_or(BlockId(0))
    }

    /// Persisted agreement snapshots for a node's working height.
    pub fn agreement_snapshots(&self, node: NodeIndex) -> Vec<conclave_types::BinStateRecord> {
        self.nodes[node]
            .bin_db
            .get_height(self.working_height(node))
            .expect("store read")
    }

    /// Blocks committed by one node, in emission order.
    pub fn committed(&self, node: NodeIndex) -> &[CommittedBlock] {
        &self.nodes[node].committed
    }

    pub fn committed_height(&self, node: NodeIndex) -> u64 {
        self.nodes[node]
            .committed
            .last()
            .map(|b| b.block_id().0)
            .unwrap_or(0)
    }

    /// Lowest committed height among non-crashed nodes.
    pub fn min_committed_height(&self) -> u64 {
        (0..self.nodes.len())
            .filter(|i| !self.crashed.contains(i))
            .map(|i| self.committed_height(i))
            .min()
            .unwrap_or(0)
    }

    // ─── Fault control ───

    pub fn partition_groups(&mut self, group_a: &[NodeIndex], group_b: &[NodeIndex]) {
        self.network.partition_groups(group_a, group_b);
    }

    pub fn isolate(&mut self, node: NodeIndex) {
        let all: Vec<NodeIndex> = (0..self.nodes.len()).collect();
        self.network.isolate(node, &all);
    }

    /// Restore connectivity and flush traffic parked on severed links.
    pub fn heal_all(&mut self) {
        self.network.heal_all();
        let pending = std::mem::take(&mut self.pending_links);
        for ((_, dst), events) in pending {
            if self.crashed.contains(&dst) {
                self.pending_links
                    .entry((dst, dst))
                    .or_default()
                    .extend(events);
                continue;
            }
            for event in events {
                let latency = self.network.sample_latency(&mut self.rng);
                self.schedule(dst, self.now + latency, event);
            }
        }
    }

    /// Drop every outbound message of a node (it still receives).
    pub fn mute(&mut self, node: NodeIndex) {
        self.muted.insert(node);
    }

    /// Suppress a node's own block proposals, leaving the rest of its
    /// behavior intact.
    pub fn suppress_proposals(&mut self, node: NodeIndex) {
        self.no_propose.insert(node);
    }

    /// Deliver an event directly into a node, as if from the network.
    pub fn inject(&mut self, node: NodeIndex, event: Event) {
        self.schedule(node, self.now, event);
    }

    /// Kill a node: its machine is dropped, in-flight traffic to it is
    /// parked, and its timers die with it. The store survives.
    pub fn crash(&mut self, node: NodeIndex) {
        info!(node, "Crashing node");
        self.crashed.insert(node);
        self.nodes[node].machine = None;
        let dead_timers: Vec<(NodeIndex, TimerId)> = self
            .timers
            .keys()
            .filter(|(owner, _)| *owner == node)
            .copied()
            .collect();
        for key in dead_timers {
            if let Some(event_key) = self.timers.remove(&key) {
                self.queue.remove(&event_key);
            }
        }
    }

    /// Rebuild a crashed node from its surviving store and deliver
    /// everything that queued up while it was down.
    pub fn restart(&mut self, node: NodeIndex) {
        info!(node, "Restarting node");
        self.crashed.remove(&node);
        let seat = self.keys[node].index();
        let n = self.committee.n();
        let (proposal_db, block_db, bin_db, da_db) =
            SimNode::fresh_dbs(&self.nodes[node].store, seat, n);

        // The same recovery the production runner performs.
        let (last_committed, prev_ts) = block_db.last_committed().expect("watermark");
        let (prev_hash, prev_sig) = if last_committed.0 > 0 {
            let block = block_db
                .get(last_committed)
                .expect("read")
                .expect("committed block present");
            (block.hash(), Some(block.threshold_sig))
        } else {
            (Hash::ZERO, None)
        };
        let bin_records = bin_db.get_height(last_committed.next()).expect("snapshots");
        let da_proofs = da_db.get_height(last_committed.next()).expect("proofs");

        let mut machine = NodeStateMachine::new(
            self.committee.clone(),
            self.keys[node].clone(),
            self.proposal_timeout,
        );
        let actions = machine.bootstrap(
            last_committed,
            prev_ts,
            prev_hash,
            prev_sig,
            &bin_records,
            da_proofs,
        );

        let sim_node = &mut self.nodes[node];
        sim_node.machine = Some(machine);
        sim_node.proposal_db = proposal_db;
        sim_node.block_db = block_db;
        sim_node.bin_db = bin_db;
        sim_node.da_db = da_db;
        self.process_actions(node, actions);

        // Flush traffic parked while the node was down.
        let parked: Vec<(NodeIndex, NodeIndex)> = self
            .pending_links
            .keys()
            .filter(|(_, dst)| *dst == node)
            .copied()
            .collect();
        for link in parked {
            if self.network.is_partitioned(link.0, link.1) {
                continue;
            }
            for event in self.pending_links.remove(&link).unwrap_or_default() {
                let latency = self.network.sample_latency(&mut self.rng);
                self.schedule(node, self.now + latency, event);
            }
        }
    }

    // ─── Execution ───

    /// Process a single event. Returns `false` when the queue is empty.
    pub fn step(&mut self) -> bool {
        let Some((&key, _)) = self.queue.iter().next() else {
            return false;
        };
        let (node, event) = self.queue.remove(&key).expect("key just observed");
        self.now = key.0;
        self.stats.events_processed += 1;

        if self.crashed.contains(&node) {
            // In flight at crash time; the reliable layer redelivers after
            // restart.
            self.pending_links.entry((node, node)).or_default().push(event);
            return true;
        }
        let now = self.now;
        let actions = self.with_machine(node, |machine| {
            machine.set_time(now);
            machine.handle(event)
        });
        self.process_actions(node, actions);
        true
    }

    /// Run until `cond` holds, the queue drains, or virtual time advances
    /// past `budget`. Returns whether the condition was met.
    pub fn run_until(
        &mut self,
        budget: Duration,
        cond: impl Fn(&SimCluster) -> bool,
    ) -> bool {
        let deadline = self.now + budget;
        loop {
            if cond(self) {
                return true;
            }
            if self.now > deadline {
                return false;
            }
            if !self.step() {
                return cond(self);
            }
        }
    }

    /// Run for a stretch of virtual time with no exit condition.
    pub fn run_for(&mut self, budget: Duration) {
        self.run_until(budget, |_| false);
    }

    fn with_machine<R>(
        &mut self,
        node: NodeIndex,
        f: impl FnOnce(&mut NodeStateMachine) -> R,
    ) -> R {
        let machine = self.nodes[node]
            .machine
            .as_mut()
            .expect("machine is alive");
        f(machine)
    }

    fn schedule(&mut self, node: NodeIndex, at: Duration, event: Event) {
        self.sequence += 1;
        self.queue.insert((at.max(self.now), self.sequence), (node, event));
    }

    /// Route one message; severed links and crashed receivers park it.
    fn send(&mut self, src: NodeIndex, dst: NodeIndex, event: Event) {
        if self.muted.contains(&src) {
            return;
        }
        if self.network.is_partitioned(src, dst) {
            self.stats.messages_deferred += 1;
            self.pending_links.entry((src, dst)).or_default().push(event);
            return;
        }
        if self.crashed.contains(&dst) {
            self.stats.messages_deferred += 1;
            self.pending_links.entry((dst, dst)).or_default().push(event);
            return;
        }
        self.stats.messages_sent += 1;
        let latency = self.network.sample_latency(&mut self.rng);
        self.schedule(dst, self.now + latency, event);
    }

    fn peers(&self, node: NodeIndex) -> Vec<NodeIndex> {
        (0..self.nodes.len()).filter(|i| *i != node).collect()
    }

    fn process_actions(&mut self, node: NodeIndex, actions: Vec<Action>) {
        for action in actions {
            self.execute(node, action);
        }
    }

    fn execute(&mut self, node: NodeIndex, action: Action) {
        match action {
            Action::EnqueueItem { item } => {
                for peer in self.peers(node) {
                    let event = match &item {
                        OutboundItem::Proposal(p) => Event::ProposalReceived {
                            proposal: p.clone(),
                        },
                        OutboundItem::DaProof(p) => Event::DaProofReceived { proof: p.clone() },
                    };
                    self.send(node, peer, event);
                }
            }
            Action::SendDaShare {
                dst,
                block_id,
                proposer_index,
                block_hash,
                share,
            } => {
                self.send(
                    node,
                    (dst.0 - 1) as NodeIndex,
                    Event::DaShareReceived {
                        block_id,
                        proposer_index,
                        block_hash,
                        share,
                    },
                );
            }
            Action::BroadcastConsensus { msg } => {
                for peer in self.peers(node) {
                    self.send(node, peer, Event::ConsensusReceived { msg: msg.clone() });
                }
            }
            Action::BroadcastBlockSignShare {
                block_id,
                block_hash,
                share,
            } => {
                for peer in self.peers(node) {
                    self.send(
                        node,
                        peer,
                        Event::BlockSignShareReceived {
                            block_id,
                            block_hash,
                            share: share.clone(),
                        },
                    );
                }
            }
            Action::SetTimer { id, duration } => {
                if let Some(key) = self.timers.remove(&(node, id)) {
                    self.queue.remove(&key);
                }
                self.sequence += 1;
                let key = (self.now + duration, self.sequence);
                self.queue.insert(key, (node, timer_event(id)));
                self.timers.insert((node, id), key);
            }
            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(node, id)) {
                    self.queue.remove(&key);
                }
            }
            Action::EnqueueInternal { event } => self.schedule(node, self.now, event),
            Action::RequestProposalBatch {
                block_id,
                prev_hash,
            } => {
                if self.no_propose.contains(&node) {
                    debug!(node, block_id = %block_id, "Proposal suppressed");
                    return;
                }
                let key = &self.keys[node];
                // A proposal persisted for this height before a crash is
                // reused verbatim, as the runner does.
                let proposal = self.nodes[node]
                    .proposal_db
                    .get(block_id, key.index())
                    .expect("store read")
                    .unwrap_or_else(|| {
                        BlockProposal::build(
                            self.committee.schain_id(),
                            block_id,
                            key.index(),
                            self.now.as_secs(),
                            self.now.subsec_millis(),
                            prev_hash,
                            vec![Transaction(
                                format!("tx-{}-{}", block_id.0, key.index().0).into_bytes(),
                            )],
                            key,
                        )
                    });
                self.schedule(node, self.now, Event::OwnProposalBuilt { proposal });
            }
            Action::FetchProposal {
                block_id,
                proposer_index,
            } => {
                let proposal = self.nodes[node]
                    .proposal_db
                    .get(block_id, proposer_index)
                    .expect("store read");
                self.schedule(
                    node,
                    self.now,
                    Event::ProposalFetched {
                        block_id,
                        proposer_index,
                        proposal,
                    },
                );
            }
            Action::PersistProposal { proposal } => {
                self.nodes[node]
                    .proposal_db
                    .put(&proposal)
                    .expect("store write");
            }
            Action::PersistDaProof { proof } => {
                self.nodes[node].da_db.put(&proof).expect("store write");
            }
            Action::PersistBinState { record } => {
                self.nodes[node].bin_db.put(&record).expect("store write");
            }
            Action::PersistBlock { block } => {
                let sim_node = &mut self.nodes[node];
                sim_node.block_db.save(&block).expect("store write");
                sim_node
                    .block_db
                    .set_last_committed(block.block_id(), block.proposal.timestamp_s)
                    .expect("store write");
            }
            Action::PruneBelow { block_id } => {
                let sim_node = &mut self.nodes[node];
                sim_node.proposal_db.prune_below(block_id).expect("prune");
                sim_node.bin_db.prune_below(block_id).expect("prune");
                sim_node.da_db.prune_below(block_id).expect("prune");
            }
            Action::EmitCommittedBlock { block } => {
                debug!(
                    node,
                    block_id = %block.block_id(),
                    "Block committed"
                );
                self.nodes[node].committed.push(block);
            }
        }
    }
}

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::ProposalReceipt(block_id) => Event::ProposalTimeout { block_id },
    }
}
