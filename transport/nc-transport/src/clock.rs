//! Wall-clock capability, grounded on `nc_core::random::Generator`'s
//! capability-trait/testing-fake split: keep-alive timeout comparisons need
//! real elapsed milliseconds, not a per-call counter, so production and
//! tests have to supply genuinely different implementations rather than a
//! free function shared by both.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// A source of monotonic milliseconds. `EndpointManager`'s keep-alive loop
/// compares two readings of this against `Config::keep_alive_read_timeout_ms`
/// (spec.md §8 testable property 6), so it must advance with real time
/// regardless of how many other endpoints are reading or writing.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Milliseconds elapsed since construction, measured off `Instant` (monotonic,
/// immune to wall-clock adjustment).
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// A clock tests advance explicitly, so a keep-alive timeout can be
    /// exercised without an actual multi-second (or multi-hour) sleep.
    pub struct FakeClock {
        now: AtomicI64,
    }

    impl FakeClock {
        pub fn new(start_ms: i64) -> Self {
            Self { now: AtomicI64::new(start_ms) }
        }

        pub fn advance(&self, delta_ms: i64) {
            self.now.fetch_add(delta_ms, Ordering::Relaxed);
        }
    }

    impl Clock for FakeClock {
        fn now_ms(&self) -> i64 {
            self.now.load(Ordering::Relaxed)
        }
    }
}
