//! Global virtual clock

use crate::error::{SchedulerError, SchedulerResult};
use vdm_primitives::Time;

/// Monotonic virtual time, advanced only by the dispatcher
#[derive(Debug, Clone, Default)]
pub struct Clock {
    now: Time,
    advances: u64,
}

impl Clock {
    /// Clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time
    pub fn now(&self) -> Time {
        self.now
    }

    /// Number of times the clock has moved forward
    pub fn advances(&self) -> u64 {
        self.advances
    }

    /// Move to `t`. Advancing to the current time is a no-op.
    pub fn advance_to(&mut self, t: Time) -> SchedulerResult<()> {
        if t < self.now {
            return Err(SchedulerError::ClockRegression {
                now: self.now,
                requested: t,
            });
        }
        if t > self.now {
            self.now = t;
            self.advances += 1;
        }
        Ok(())
    }

    /// Back to time zero, for a fresh run
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
