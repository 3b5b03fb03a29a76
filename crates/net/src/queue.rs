//! Bounded per-peer delivery queue.

use conclave_core::{OutboundItem, ShutdownToken};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

/// Hard bound on queued items per peer. A slow or dead peer can cost at
/// most this much memory; overflow discards the oldest item, since every
/// proposer re-broadcasts at the next height and consensus tolerates loss.
pub const MAX_PROPOSAL_QUEUE_SIZE: usize = 64;

/// FIFO of outbound items for one peer, drained by that peer's worker.
///
/// One mutex and one condvar per queue, held only across the push or pop.
pub struct PeerQueue {
    items: Mutex<VecDeque<OutboundItem>>,
    available: Condvar,
    capacity: usize,
    shutdown: ShutdownToken,
}

impl PeerQueue {
    pub fn new(capacity: usize, shutdown: ShutdownToken) -> PeerQueue {
        PeerQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
            shutdown,
        }
    }

    /// Append an item, discarding the oldest when full.
    pub fn push(&self, item: OutboundItem) {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            if let Some(dropped) = items.pop_front() {
                warn!(
                    dropped = dropped.type_name(),
                    block_id = %dropped.block_id(),
                    "Peer queue full, dropping oldest item"
                );
            }
        }
        items.push_back(item);
        drop(items);
        self.available.notify_one();
    }

    /// Block until an item is available or shutdown is requested.
    /// `None` means shutdown.
    pub fn pop(&self) -> Option<OutboundItem> {
        let mut items = self.items.lock();
        loop {
            if self.shutdown.is_triggered() {
                return None;
            }
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            // Re-check the shutdown flag at least once a second even if no
            // wake-up arrives.
            self.available
                .wait_for(&mut items, Duration::from_secs(1));
        }
    }

    /// Wake the worker so it observes a shutdown.
    pub fn notify_shutdown(&self) {
        self.available.notify_all();
    }

    /// Current queue depth.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::test_utils::{test_committee, test_proposal};
    use conclave_types::{BlockId, Hash};

    fn item(block: u64) -> OutboundItem {
        let (committee, keys) = test_committee(4);
        OutboundItem::Proposal(test_proposal(
            &committee,
            &keys[0],
            BlockId(block),
            Hash::ZERO,
        ))
    }

    #[test]
    fn test_fifo_order() {
        let queue = PeerQueue::new(8, ShutdownToken::new());
        queue.push(item(1));
        queue.push(item(2));
        assert_eq!(queue.pop().unwrap().block_id(), BlockId(1));
        assert_eq!(queue.pop().unwrap().block_id(), BlockId(2));
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = PeerQueue::new(3, ShutdownToken::new());
        for block in 1..=5 {
            queue.push(item(block));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().block_id(), BlockId(3));
        assert_eq!(queue.pop().unwrap().block_id(), BlockId(4));
        assert_eq!(queue.pop().unwrap().block_id(), BlockId(5));
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let queue = PeerQueue::new(MAX_PROPOSAL_QUEUE_SIZE, ShutdownToken::new());
        for block in 1..=(MAX_PROPOSAL_QUEUE_SIZE as u64 * 2) {
            queue.push(item(block));
            assert!(queue.len() <= MAX_PROPOSAL_QUEUE_SIZE);
        }
    }

    #[test]
    fn test_shutdown_unblocks_pop() {
        let shutdown = ShutdownToken::new();
        let queue = std::sync::Arc::new(PeerQueue::new(8, shutdown.clone()));
        let handle = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pop())
        };
        std::thread::sleep(Duration::from_millis(50));
        shutdown.trigger();
        queue.notify_shutdown();
        assert_eq!(handle.join().unwrap(), None);
    }
}
