//! Cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide shutdown flag, checked at every suspension point.
///
/// Cloning shares the flag. Once triggered it never resets; every loop that
/// observes it unwinds with `ExitRequested` rather than blocking again.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> ShutdownToken {
        ShutdownToken::default()
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_is_shared_and_sticky() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        assert!(!clone.is_triggered());
        token.trigger();
        assert!(clone.is_triggered());
        token.trigger();
        assert!(token.is_triggered());
    }
}
