//! Timer management for the threaded runner.
//!
//! One thread owns every deadline; arming a timer that already exists
//! replaces it, and firing posts the matching event to the dispatch queue.

use conclave_core::{Event, EventSink, ShutdownToken, TimerId};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::ProposalReceipt(block_id) => Event::ProposalTimeout { block_id },
    }
}

struct TimerInner {
    deadlines: Mutex<BTreeMap<TimerId, Instant>>,
    changed: Condvar,
}

/// Clone-able arm/cancel front of the timer thread.
#[derive(Clone)]
pub struct TimerHandle {
    inner: Arc<TimerInner>,
}

impl TimerHandle {
    /// Arm a timer, replacing any existing deadline with the same id.
    pub fn set_timer(&self, id: TimerId, duration: Duration) {
        debug!(?id, ?duration, "Timer set");
        self.inner
            .deadlines
            .lock()
            .insert(id, Instant::now() + duration);
        self.inner.changed.notify_all();
    }

    /// Cancel a timer. A no-op if it does not exist or already fired.
    pub fn cancel_timer(&self, id: TimerId) {
        if self.inner.deadlines.lock().remove(&id).is_some() {
            debug!(?id, "Timer cancelled");
        }
        self.inner.changed.notify_all();
    }

    /// Number of armed timers.
    pub fn active_count(&self) -> usize {
        self.inner.deadlines.lock().len()
    }
}

/// Manages timers for the runner.
pub struct TimerManager {
    handle: TimerHandle,
    shutdown: ShutdownToken,
    thread: Option<JoinHandle<()>>,
}

impl TimerManager {
    pub fn spawn(sink: Arc<dyn EventSink>, shutdown: ShutdownToken) -> TimerManager {
        let inner = Arc::new(TimerInner {
            deadlines: Mutex::new(BTreeMap::new()),
            changed: Condvar::new(),
        });
        let thread = {
            let inner = inner.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("timers".to_string())
                .spawn(move || timer_loop(inner, sink, shutdown))
                .expect("thread spawn")
        };
        TimerManager {
            handle: TimerHandle { inner },
            shutdown,
            thread: Some(thread),
        }
    }

    /// A clone-able arm/cancel handle.
    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    /// Arm a timer, replacing any existing deadline with the same id.
    pub fn set_timer(&self, id: TimerId, duration: Duration) {
        self.handle.set_timer(id, duration);
    }

    /// Cancel a timer.
    pub fn cancel_timer(&self, id: TimerId) {
        self.handle.cancel_timer(id);
    }

    /// Number of armed timers.
    pub fn active_count(&self) -> usize {
        self.handle.active_count()
    }

    /// Stop the timer thread and discard every pending deadline.
    pub fn shutdown(mut self) {
        self.shutdown.trigger();
        self.handle.inner.changed.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn timer_loop(inner: Arc<TimerInner>, sink: Arc<dyn EventSink>, shutdown: ShutdownToken) {
    let mut deadlines = inner.deadlines.lock();
    loop {
        if shutdown.is_triggered() {
            return;
        }
        let now = Instant::now();
        let fired: Vec<TimerId> = deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in fired {
            deadlines.remove(&id);
            trace!(?id, "Timer fired");
            sink.post(timer_event(id));
        }
        let wait = deadlines
            .values()
            .min()
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(Duration::from_secs(1));
        inner
            .changed
            .wait_for(&mut deadlines, wait.min(Duration::from_secs(1)));
    }
}
