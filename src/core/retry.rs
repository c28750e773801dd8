//! Bounded retry policies
//!
//! Two named budgets cover every retry site in the daemon: `BUSY_POLL` for
//! camera operations that report a transient busy state, and `ACK_WAIT` for
//! router acknowledgement replies. Both are fixed-interval with a hard
//! attempt cap; exhaustion surfaces the last error instead of spinning.

use std::thread;
use std::time::Duration;

/// An error kind that can distinguish "try again shortly" from hard failure.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Fixed-interval retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

/// Camera operations: poll every 100ms, up to 30 attempts (3 seconds).
pub const BUSY_POLL: RetryPolicy = RetryPolicy {
    interval: Duration::from_millis(100),
    max_attempts: 30,
};

/// Router acknowledgements: poll every 100ms, up to 10 attempts (1 second).
pub const ACK_WAIT: RetryPolicy = RetryPolicy {
    interval: Duration::from_millis(100),
    max_attempts: 10,
};

impl RetryPolicy {
    /// Run `op` until it succeeds, fails hard, or the budget is spent.
    ///
    /// Transient errors sleep for the interval and retry; any other error
    /// returns immediately. If the final attempt is still transient, that
    /// error is returned.
    pub fn run_busy<T, E, F>(&self, mut op: F) -> std::result::Result<T, E>
    where
        E: Transient,
        F: FnMut() -> std::result::Result<T, E>,
    {
        for attempt in 1..=self.max_attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    thread::sleep(self.interval);
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("max_attempts is at least 1")
    }
}
