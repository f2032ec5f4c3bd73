//! Monotonic time source
//!
//! The engine measures long-press thresholds, request deadlines and retry
//! back-off through this trait so tests can drive time by hand.

use std::time::{Duration, Instant};

pub trait Clock {
    /// Current monotonic time
    fn now(&self) -> Instant;

    /// Block the calling thread for `duration`
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant::now`] and [`std::thread::sleep`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
