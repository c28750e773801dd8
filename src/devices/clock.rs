//! Wall clock access
//!
//! The airborne board boots with no RTC, so the time-sync exchange may have
//! to step the wall clock by a large amount. Stepping is privileged and
//! destructive, which is why it sits behind a trait the tests can fake.

use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::time::TimeSpec;
use nix::time::ClockId;

use crate::error::{ControlError, Result};

pub trait Clock {
    fn now_epoch_secs(&self) -> Result<i64>;
    fn set_epoch_secs(&mut self, secs: i64) -> Result<()>;
}

/// The real wall clock, stepped through `clock_settime`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_secs(&self) -> Result<i64> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ControlError::Config(format!("wall clock before epoch: {e}")))?;
        Ok(now.as_secs() as i64)
    }

    fn set_epoch_secs(&mut self, secs: i64) -> Result<()> {
        nix::time::clock_settime(ClockId::CLOCK_REALTIME, TimeSpec::new(secs, 0))?;
        Ok(())
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;

    /// Fake clock recording every step applied to it.
    pub struct MockClock {
        pub now: i64,
        pub steps: Vec<i64>,
    }

    impl MockClock {
        pub fn at(now: i64) -> Self {
            Self {
                now,
                steps: Vec::new(),
            }
        }
    }

    impl Clock for MockClock {
        fn now_epoch_secs(&self) -> Result<i64> {
            Ok(self.now)
        }

        fn set_epoch_secs(&mut self, secs: i64) -> Result<()> {
            self.now = secs;
            self.steps.push(secs);
            Ok(())
        }
    }
}
