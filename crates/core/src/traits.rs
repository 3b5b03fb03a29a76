//! State machine trait.

use crate::{Action, Event};
use std::time::Duration;

/// A synchronous, deterministic event processor.
///
/// Implementations mutate internal state and return the actions the runner
/// must perform. They never block and never touch the network or disk.
pub trait StateMachine {
    /// Process one event.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Inform the machine of the current time. Called by the runner before
    /// each `handle`.
    fn set_time(&mut self, now: Duration);
}

/// Destination for events produced outside the dispatch thread (peer
/// workers, timers, the transport's receive path).
pub trait EventSink: Send + Sync {
    /// Enqueue an event for dispatch. Never blocks.
    fn post(&self, event: Event);
}
