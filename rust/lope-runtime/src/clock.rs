//! Monotonic microsecond clocks.
//!
//! Every timestamp the scheduler stores (arrival, dispatch, I/O start) is a
//! count of microseconds read from a [`Clock`]. Production code uses
//! [`MonotonicClock`]; tests drive a [`ManualClock`] forward explicitly so a
//! scheduler tick can be reasoned about without wall-clock sleeps.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A source of monotonic timestamps in microseconds.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Microseconds elapsed since the clock's origin. Never decreases.
    fn now_micros(&self) -> u64;
}

// ---------------------------------------------------------------------------
// MonotonicClock
// ---------------------------------------------------------------------------

/// Wall-clock time measured from the moment the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        // Saturate rather than wrap; u64 microseconds covers ~584k years.
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start` microseconds.
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move the clock forward by `micros`.
    pub fn advance(&self, micros: u64) {
        self.now.fetch_add(micros, Ordering::AcqRel);
    }

    /// Jump to an absolute reading. Ignored if it would move time backwards.
    pub fn set(&self, micros: u64) {
        self.now.fetch_max(micros, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now_micros();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = clock.now_micros();
        assert!(b >= a + 1_000);
    }

    #[test]
    fn manual_clock_advances_only_on_request() {
        let clock = ManualClock::new(500);
        assert_eq!(clock.now_micros(), 500);
        clock.advance(250);
        assert_eq!(clock.now_micros(), 750);
        clock.set(100);
        assert_eq!(clock.now_micros(), 750, "set must not rewind");
        clock.set(2_000);
        assert_eq!(clock.now_micros(), 2_000);
    }
}
