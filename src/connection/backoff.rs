//! Retry delay policies for connection establishment

use std::time::Duration;

/// Strategy for the delay between connection attempts.
///
/// `attempt` is the 1-based index of the attempt that just failed; the
/// returned delay is slept before the next one.
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

/// Fixed delay between attempts.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffPolicy for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}
