//! Fixed-rate pacing for the control loop

use std::time::{Duration, Instant};

/// Keeps each loop iteration at least `interval` long
#[derive(Debug)]
pub struct CycleTimer {
    interval: Duration,
    cycle_start: Instant,
}

impl CycleTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            cycle_start: Instant::now(),
        }
    }

    /// Mark the start of a cycle
    pub fn begin(&mut self) {
        self.cycle_start = Instant::now();
    }

    /// Time left before the next cycle may start
    pub fn remaining(&self) -> Duration {
        self.interval.saturating_sub(self.cycle_start.elapsed())
    }

    /// Sleep out the rest of the cycle; returns how long it slept
    pub fn wait(&mut self) -> Duration {
        if self.interval.is_zero() {
            std::thread::yield_now();
            return Duration::ZERO;
        }

        let remaining = self.remaining();
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
        remaining
    }
}
