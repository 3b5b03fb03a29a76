//! Per-peer delivery workers and the enqueue fan-out.

use crate::queue::{PeerQueue, MAX_PROPOSAL_QUEUE_SIZE};
use crate::status::ConnectionStatus;
use crate::transport::{NetError, Transport};
use conclave_core::{OutboundItem, ShutdownToken};
use conclave_types::SchainIndex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Timing knobs for the delivery workers.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Queue bound per peer.
    pub max_queue_size: usize,
    /// Sleep before reconnecting after the peer answered `RetryLater`.
    pub proposal_retry_interval: Duration,
    /// Sleep before resending after a transient network error.
    pub wait_after_network_error: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            max_queue_size: MAX_PROPOSAL_QUEUE_SIZE,
            proposal_retry_interval: Duration::from_millis(1000),
            wait_after_network_error: Duration::from_millis(3000),
        }
    }
}

/// Error from [`PeerFanout::enqueue`].
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("shutting down")]
    ShuttingDown,
}

/// Clone-able front of a [`PeerFanout`]: enqueue and observe without
/// owning the worker threads.
#[derive(Clone)]
pub struct FanoutHandle {
    /// Queues by peer seat, ascending. Our own seat has no queue.
    queues: Arc<BTreeMap<SchainIndex, Arc<PeerQueue>>>,
    shutdown: ShutdownToken,
}

impl FanoutHandle {
    /// Replicate an item into every peer's queue, in seat order (the fixed
    /// acquisition order keeps the per-queue locks cycle-free).
    pub fn enqueue(&self, item: OutboundItem) -> Result<(), EnqueueError> {
        if self.shutdown.is_triggered() {
            return Err(EnqueueError::ShuttingDown);
        }
        for queue in self.queues.values() {
            queue.push(item.clone());
        }
        Ok(())
    }

    /// Queue depth per peer, for the monitoring thread.
    pub fn queue_depths(&self) -> BTreeMap<SchainIndex, usize> {
        self.queues
            .iter()
            .map(|(seat, queue)| (*seat, queue.len()))
            .collect()
    }
}

/// One bounded queue and one worker thread per peer; each worker drains
/// its queue through the transport with unbounded retry on transient
/// failures.
pub struct PeerFanout {
    handle: FanoutHandle,
    workers: Vec<JoinHandle<()>>,
    shutdown: ShutdownToken,
}

impl PeerFanout {
    /// Spawn one worker per committee peer (every seat except our own).
    pub fn spawn(
        own_index: SchainIndex,
        seats: impl Iterator<Item = SchainIndex>,
        transport: Arc<dyn Transport>,
        config: DeliveryConfig,
        shutdown: ShutdownToken,
    ) -> PeerFanout {
        let mut queues = BTreeMap::new();
        let mut workers = Vec::new();
        for seat in seats {
            if seat == own_index {
                continue;
            }
            let queue = Arc::new(PeerQueue::new(config.max_queue_size, shutdown.clone()));
            queues.insert(seat, queue.clone());
            let transport = transport.clone();
            let config = config.clone();
            let shutdown = shutdown.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("peer-{}", seat))
                    .spawn(move || worker_loop(seat, queue, transport, config, shutdown))
                    .expect("thread spawn"),
            );
        }
        PeerFanout {
            handle: FanoutHandle {
                queues: Arc::new(queues),
                shutdown: shutdown.clone(),
            },
            workers,
            shutdown,
        }
    }

    /// A clone-able enqueue/observe handle.
    pub fn handle(&self) -> FanoutHandle {
        self.handle.clone()
    }

    /// Replicate an item into every peer's queue.
    pub fn enqueue(&self, item: OutboundItem) -> Result<(), EnqueueError> {
        self.handle.enqueue(item)
    }

    /// Queue depth per peer.
    pub fn queue_depths(&self) -> BTreeMap<SchainIndex, usize> {
        self.handle.queue_depths()
    }

    /// Trigger shutdown and join every worker.
    pub fn shutdown(mut self) {
        self.shutdown.trigger();
        for queue in self.handle.queues.values() {
            queue.notify_shutdown();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Peer worker panicked during shutdown");
            }
        }
        info!("Peer delivery workers stopped");
    }
}

fn worker_loop(
    peer: SchainIndex,
    queue: Arc<PeerQueue>,
    transport: Arc<dyn Transport>,
    config: DeliveryConfig,
    shutdown: ShutdownToken,
) {
    debug!(peer = %peer, "Peer delivery worker started");
    while let Some(item) = queue.pop() {
        deliver_with_retry(peer, &item, transport.as_ref(), &config, &shutdown);
        if shutdown.is_triggered() {
            break;
        }
    }
    debug!(peer = %peer, "Peer delivery worker exiting");
}

/// Deliver one item, retrying until it is accepted, rejected, or shutdown.
fn deliver_with_retry(
    peer: SchainIndex,
    item: &OutboundItem,
    transport: &dyn Transport,
    config: &DeliveryConfig,
    shutdown: &ShutdownToken,
) {
    loop {
        if shutdown.is_triggered() {
            return;
        }
        match transport.send_item(peer, item) {
            Ok(reply) => match reply.status {
                ConnectionStatus::Success => return,
                ConnectionStatus::RetryLater => {
                    debug!(
                        peer = %peer,
                        item = item.type_name(),
                        "Peer asked to retry later"
                    );
                    sleep_interruptible(shutdown, config.proposal_retry_interval);
                }
                ConnectionStatus::Disconnect | ConnectionStatus::Error => {
                    warn!(
                        peer = %peer,
                        item = item.type_name(),
                        block_id = %item.block_id(),
                        status = ?reply.status,
                        substatus = ?reply.substatus,
                        "Peer rejected item, dropping"
                    );
                    return;
                }
            },
            Err(e) if e.is_transient() => {
                debug!(peer = %peer, error = %e, "Transient network error, will retry");
                sleep_interruptible(shutdown, config.wait_after_network_error);
            }
            Err(e) => {
                // Fatal for this connection only: the item is lost, the
                // worker moves on.
                warn!(
                    peer = %peer,
                    item = item.type_name(),
                    block_id = %item.block_id(),
                    error = %e,
                    "Dropping item after protocol failure"
                );
                return;
            }
        }
    }
}

/// Sleep in short slices so a shutdown is observed promptly.
fn sleep_interruptible(shutdown: &ShutdownToken, duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if shutdown.is_triggered() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25).min(duration));
    }
}
