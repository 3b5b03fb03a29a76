//! Threaded node runner.
//!
//! Owns the long-lived threads of a node:
//!
//! - one delivery worker per peer (the `conclave-net` fan-out),
//! - one dispatch thread that owns the state machine and executes its
//!   actions in order (persistence is synchronous, so a snapshot is
//!   durable before the machine sees its next event),
//! - a fixed-size rayon pool verifying consensus-message envelopes before
//!   they reach the dispatch queue,
//! - one timer thread,
//! - one monitoring thread.
//!
//! A single shutdown token is checked at every suspension point; once
//! triggered, no loop blocks again.

use crate::config::NodeConfig;
use crate::error::EngineError;
use crate::health::{HealthCheck, HealthStatus};
use crate::state::NodeStateMachine;
use crate::timers::{TimerHandle, TimerManager};
use crate::traits::{BlockFactory, CommitSink};
use conclave_core::{Action, Event, EventSink, ShutdownToken, StateMachine};
use conclave_net::{FanoutHandle, PeerFanout, Transport, WireMessage};
use conclave_storage::{BinStateDb, BlockDb, DaProofDb, OrderedByteMap, ProposalDb};
use conclave_types::{BlockId, BlockProposal, Committee, KeyPair, SchainIndex};
use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Blocks served per catch-up response.
const CATCHUP_BATCH: u64 = 128;

struct ChannelSink {
    tx: Sender<Event>,
}

impl EventSink for ChannelSink {
    fn post(&self, event: Event) {
        // The dispatch thread drains until the last sender drops; a closed
        // channel only happens during shutdown.
        let _ = self.tx.send(event);
    }
}

/// Inbound side of the node: the embedder's socket layer (or the test
/// transport) hands every decoded wire message here.
pub struct WireIntake {
    committee: Arc<Committee>,
    sink: Arc<dyn EventSink>,
    verify_pool: rayon::ThreadPool,
    block_db: Arc<BlockDb>,
    transport: Arc<dyn Transport>,
    shutdown: ShutdownToken,
}

impl WireIntake {
    /// Route one decoded message from `from`.
    ///
    /// Consensus envelopes are verified on the worker pool before they are
    /// posted; catch-up requests are served directly from the block DB.
    pub fn deliver(&self, from: SchainIndex, msg: WireMessage) {
        if self.shutdown.is_triggered() {
            return;
        }
        match msg {
            WireMessage::CatchupReq { from_block } => self.serve_catchup(from, from_block),
            WireMessage::BvBroadcast { msg }
            | WireMessage::AuxBroadcast { msg }
            | WireMessage::ConsensusCommit { msg } => {
                // The caller (one receive path per peer) blocks until its
                // message is verified, which keeps per-sender arrival
                // order; the pool bounds how many verifications run at
                // once across peers.
                let valid = self.verify_pool.install(|| msg.verify(&self.committee));
                match valid {
                    Ok(()) => self.sink.post(Event::ConsensusReceived { msg }),
                    Err(e) => warn!(
                        src = %msg.src_index,
                        block_id = %msg.block_id,
                        error = %e,
                        "Consensus envelope failed verification, dropping"
                    ),
                }
            }
            other => match other.into_event() {
                Ok(Some(event)) => self.sink.post(event),
                Ok(None) => {}
                Err(e) => warn!(from = %from, error = %e, "Undeliverable wire message"),
            },
        }
    }

    fn serve_catchup(&self, from: SchainIndex, from_block: BlockId) {
        let mut blocks = Vec::new();
        for id in from_block.0..from_block.0 + CATCHUP_BATCH {
            match self.block_db.get(BlockId(id)) {
                Ok(Some(block)) => blocks.push(block),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Catch-up read failed");
                    break;
                }
            }
        }
        debug!(from = %from, from_block = %from_block, served = blocks.len(), "Serving catch-up");
        if !blocks.is_empty() {
            self.transport.send(from, WireMessage::CatchupRsp { blocks });
        }
    }
}

/// Running node; dropping it does not stop the threads, call
/// [`shutdown`](NodeHandle::shutdown).
pub struct NodeHandle {
    shutdown: ShutdownToken,
    intake: Arc<WireIntake>,
    last_committed: Arc<AtomicU64>,
    fanout: Option<PeerFanout>,
    timers: Option<TimerManager>,
    dispatch: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl NodeHandle {
    /// Where the embedder's receive path delivers decoded messages.
    pub fn intake(&self) -> Arc<WireIntake> {
        self.intake.clone()
    }

    /// Highest committed height observed so far.
    pub fn last_committed(&self) -> BlockId {
        BlockId(self.last_committed.load(Ordering::SeqCst))
    }

    /// Cooperative shutdown: wakes every blocked thread and joins them.
    pub fn shutdown(mut self) {
        info!("Shutdown requested");
        self.shutdown.trigger();
        if let Some(timers) = self.timers.take() {
            timers.shutdown();
        }
        if let Some(fanout) = self.fanout.take() {
            fanout.shutdown();
        }
        if let Some(dispatch) = self.dispatch.take() {
            let _ = dispatch.join();
        }
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
        info!("Node stopped");
    }
}

/// Builds and starts a node.
pub struct NodeRunner;

impl NodeRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        config: NodeConfig,
        committee: Arc<Committee>,
        key: Arc<KeyPair>,
        store: Arc<dyn OrderedByteMap>,
        transport: Arc<dyn Transport>,
        factory: Arc<dyn BlockFactory>,
        commit_sink: Arc<dyn CommitSink>,
    ) -> Result<NodeHandle, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        let health = HealthCheck::new(config.data_dir.as_deref());
        health.set(HealthStatus::Starting);

        let proposal_db = Arc::new(ProposalDb::new(store.clone(), key.index(), committee.n()));
        let block_db = Arc::new(BlockDb::new(store.clone()));
        let bin_db = Arc::new(BinStateDb::new(store.clone()));
        let da_db = Arc::new(DaProofDb::new(store));

        // Recover chain state: watermark, previous block, and any
        // in-flight agreement snapshots for the next height.
        let (last_committed, prev_timestamp_s) = block_db.last_committed()?;
        let (prev_hash, prev_sig) = if last_committed.0 > 0 {
            let block = block_db.get(last_committed)?.ok_or_else(|| {
                EngineError::Fatal(format!(
                    "committed watermark {last_committed} has no stored block"
                ))
            })?;
            (block.hash(), Some(block.threshold_sig))
        } else {
            (conclave_types::Hash::ZERO, None)
        };
        let bin_records = bin_db.get_height(last_committed.next())?;
        let da_proofs = da_db.get_height(last_committed.next())?;
        info!(
            last_committed = %last_committed,
            restored_instances = bin_records.len(),
            restored_proofs = da_proofs.len(),
            "Recovered chain state"
        );

        let mut machine = NodeStateMachine::new(
            committee.clone(),
            key.clone(),
            config.proposal_timeout,
        );
        let initial_actions = machine.bootstrap(
            last_committed,
            prev_timestamp_s,
            prev_hash,
            prev_sig,
            &bin_records,
            da_proofs,
        );

        let (tx, rx) = crossbeam_channel::unbounded();
        let sink: Arc<dyn EventSink> = Arc::new(ChannelSink { tx: tx.clone() });
        let shutdown = ShutdownToken::new();

        let timers = TimerManager::spawn(sink.clone(), shutdown.clone());
        let fanout = PeerFanout::spawn(
            key.index(),
            committee.seats(),
            transport.clone(),
            config.delivery.clone(),
            shutdown.clone(),
        );

        let verify_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.verify_threads)
            .thread_name(|i| format!("verify-{}", i))
            .build()
            .map_err(|e| EngineError::Fatal(e.to_string()))?;

        let intake = Arc::new(WireIntake {
            committee: committee.clone(),
            sink: sink.clone(),
            verify_pool,
            block_db: block_db.clone(),
            transport: transport.clone(),
            shutdown: shutdown.clone(),
        });

        let last_committed_atomic = Arc::new(AtomicU64::new(last_committed.0));

        let mut dispatcher = Dispatcher {
            machine,
            committee,
            key,
            proposal_db,
            block_db,
            bin_db,
            da_db,
            transport,
            fanout: fanout.handle(),
            timers: timers.handle(),
            factory,
            commit_sink,
            health: health.clone(),
            shutdown: shutdown.clone(),
            last_committed: last_committed_atomic.clone(),
            internal: VecDeque::new(),
        };

        let dispatch = std::thread::Builder::new()
            .name("dispatch".to_string())
            .spawn(move || dispatcher.run(rx, initial_actions))
            .map_err(|e| EngineError::Fatal(e.to_string()))?;

        let monitor = {
            let shutdown = shutdown.clone();
            let fanout_handle = fanout.handle();
            let last_committed = last_committed_atomic.clone();
            let timer_handle = timers.handle();
            let interval = config.monitor_interval;
            let dispatch_tx = tx;
            std::thread::Builder::new()
                .name("monitor".to_string())
                .spawn(move || {
                    monitor_loop(
                        shutdown,
                        fanout_handle,
                        timer_handle,
                        last_committed,
                        dispatch_tx,
                        interval,
                    )
                })
                .map_err(|e| EngineError::Fatal(e.to_string()))?
        };

        health.set(HealthStatus::Serving);
        info!("Node started");
        Ok(NodeHandle {
            shutdown,
            intake,
            last_committed: last_committed_atomic,
            fanout: Some(fanout),
            timers: Some(timers),
            dispatch: Some(dispatch),
            monitor: Some(monitor),
        })
    }
}

/// The dispatch thread's working set.
struct Dispatcher {
    machine: NodeStateMachine,
    committee: Arc<Committee>,
    key: Arc<KeyPair>,
    proposal_db: Arc<ProposalDb>,
    block_db: Arc<BlockDb>,
    bin_db: Arc<BinStateDb>,
    da_db: Arc<DaProofDb>,
    transport: Arc<dyn Transport>,
    fanout: FanoutHandle,
    timers: TimerHandle,
    factory: Arc<dyn BlockFactory>,
    commit_sink: Arc<dyn CommitSink>,
    health: HealthCheck,
    shutdown: ShutdownToken,
    last_committed: Arc<AtomicU64>,
    /// Internal events run before the next external event is taken.
    internal: VecDeque<Event>,
}

impl Dispatcher {
    fn run(&mut self, rx: Receiver<Event>, initial_actions: Vec<Action>) {
        for action in initial_actions {
            self.execute(action);
        }
        loop {
            let event = if let Some(event) = self.internal.pop_front() {
                event
            } else {
                if self.shutdown.is_triggered() {
                    return;
                }
                match rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(event) => event,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                }
            };
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO);
            self.machine.set_time(now);
            for action in self.machine.handle(event) {
                self.execute(action);
                if self.shutdown.is_triggered() {
                    return;
                }
            }
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::EnqueueItem { item } => {
                if self.fanout.enqueue(item).is_err() {
                    debug!("Enqueue refused, shutting down");
                }
            }
            Action::SendDaShare {
                dst,
                block_id,
                proposer_index,
                block_hash,
                share,
            } => self.transport.send(
                dst,
                WireMessage::DaShareRsp {
                    block_id,
                    proposer_index,
                    block_hash,
                    share,
                },
            ),
            Action::BroadcastConsensus { msg } => {
                self.transport.broadcast(WireMessage::from_consensus(msg))
            }
            Action::BroadcastBlockSignShare {
                block_id,
                block_hash,
                share,
            } => self.transport.broadcast(WireMessage::BlockSignBroadcast {
                block_id,
                block_hash,
                share,
            }),
            Action::SetTimer { id, duration } => self.timers.set_timer(id, duration),
            Action::CancelTimer { id } => self.timers.cancel_timer(id),
            Action::EnqueueInternal { event } => self.internal.push_back(event),
            Action::RequestProposalBatch {
                block_id,
                prev_hash,
            } => {
                // A proposal persisted for this height before a restart is
                // reused verbatim; proposing different bytes for the same
                // height would be self-equivocation.
                let proposal = match self.proposal_db.get(block_id, self.key.index()) {
                    Ok(Some(existing)) => existing,
                    Ok(None) => {
                        let transactions = self.factory.pending_batch(block_id);
                        let now = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .unwrap_or(Duration::ZERO);
                        BlockProposal::build(
                            self.committee.schain_id(),
                            block_id,
                            self.key.index(),
                            now.as_secs(),
                            now.subsec_millis(),
                            prev_hash,
                            transactions,
                            &self.key,
                        )
                    }
                    Err(e) => {
                        self.fatal(&format!("own proposal lookup failed: {e}"));
                        return;
                    }
                };
                self.internal.push_back(Event::OwnProposalBuilt { proposal });
            }
            Action::FetchProposal {
                block_id,
                proposer_index,
            } => match self.proposal_db.get(block_id, proposer_index) {
                Ok(proposal) => self.internal.push_back(Event::ProposalFetched {
                    block_id,
                    proposer_index,
                    proposal,
                }),
                Err(e) => self.fatal(&format!("proposal fetch failed: {e}")),
            },
            Action::PersistProposal { proposal } => {
                if let Err(e) = self.proposal_db.put(&proposal) {
                    self.fatal(&format!("proposal persistence failed: {e}"));
                }
            }
            Action::PersistDaProof { proof } => {
                if let Err(e) = self.da_db.put(&proof) {
                    self.fatal(&format!("DA-proof persistence failed: {e}"));
                }
            }
            Action::PersistBinState { record } => {
                if let Err(e) = self.bin_db.put(&record) {
                    self.fatal(&format!("agreement snapshot persistence failed: {e}"));
                }
            }
            Action::PersistBlock { block } => {
                if let Err(e) = self.block_db.save(&block).and_then(|_| {
                    self.block_db
                        .set_last_committed(block.block_id(), block.proposal.timestamp_s)
                }) {
                    self.fatal(&format!("block persistence failed: {e}"));
                }
            }
            Action::PruneBelow { block_id } => {
                let pruned = self
                    .proposal_db
                    .prune_below(block_id)
                    .and_then(|_| self.bin_db.prune_below(block_id))
                    .and_then(|_| self.da_db.prune_below(block_id));
                if let Err(e) = pruned {
                    warn!(error = %e, "Pruning failed");
                }
            }
            Action::EmitCommittedBlock { block } => {
                self.last_committed
                    .store(block.block_id().0, Ordering::SeqCst);
                self.commit_sink.create_block(
                    block.block_id(),
                    &block.proposal.transactions,
                    block.proposal.timestamp_s,
                    block.proposal.timestamp_ms,
                );
            }
        }
    }

    /// Unrecoverable failure: log, flag the health file, unwind everything.
    fn fatal(&self, reason: &str) {
        error!(reason, "Fatal error, requesting exit");
        self.health.set(HealthStatus::Failed);
        self.shutdown.trigger();
    }
}

fn monitor_loop(
    shutdown: ShutdownToken,
    fanout: FanoutHandle,
    timers: TimerHandle,
    last_committed: Arc<AtomicU64>,
    dispatch_tx: Sender<Event>,
    interval: Duration,
) {
    while !shutdown.is_triggered() {
        let deadline = Instant::now() + interval;
        while Instant::now() < deadline {
            if shutdown.is_triggered() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50).min(interval));
        }
        info!(
            last_committed = last_committed.load(Ordering::SeqCst),
            dispatch_depth = dispatch_tx.len(),
            active_timers = timers.active_count(),
            peer_queues = ?fanout.queue_depths(),
            "Node progress"
        );
    }
}
