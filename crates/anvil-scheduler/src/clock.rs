//! Injectable monotonic clock

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Monotonic time source used for all scheduling arithmetic
///
/// Injected at scheduler construction so tests can control queue ages and
/// delay deadlines without real sleeps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Default clock backed by `Instant::now`
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(10));
        assert_eq!(clock.now() - start, Duration::from_millis(10));
    }
}
