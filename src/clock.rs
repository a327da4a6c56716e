//! Time source for polling waits; tests swap in a clock that only advances
//! when slept on.

use std::time::{Duration, Instant};

/// Wall-clock access used by every polling wait.
pub trait Clock {
    fn now(&self) -> Instant;

    fn elapsed_since(&self, start: Instant) -> Duration {
        self.now().saturating_duration_since(start)
    }

    fn sleep(&self, duration: Duration);
}

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
