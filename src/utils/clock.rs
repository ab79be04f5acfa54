//! Time sources
//!
//! Everything time-dependent in the session (VAD hangover, playback cursors,
//! event timestamps) reads time through [`Clock`] so tests can drive it.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Monotonic plus wall-clock time source
pub trait Clock: Send + Sync {
    /// Monotonic time elapsed since the clock's origin
    fn now(&self) -> Duration;

    /// Wall-clock time as unix milliseconds (used for event timestamps)
    fn unix_millis(&self) -> i64;
}

/// Real clock backed by `Instant` and the system wall clock
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// The instant corresponding to `Duration::ZERO` on this clock
    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// Convert a clock reading back into an `Instant`
    pub fn instant_at(&self, at: Duration) -> Instant {
        self.origin + at
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn unix_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually advanced clock for deterministic tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<ManualInner>,
}

#[derive(Debug)]
struct ManualInner {
    now: Duration,
    unix_base_ms: i64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(Duration::ZERO)
    }

    pub fn starting_at(now: Duration) -> Self {
        Self {
            inner: Mutex::new(ManualInner {
                now,
                unix_base_ms: 1_700_000_000_000,
            }),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.inner.lock().now += by;
    }

    pub fn set(&self, now: Duration) {
        self.inner.lock().now = now;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.inner.lock().now
    }

    fn unix_millis(&self) -> i64 {
        let inner = self.inner.lock();
        inner.unix_base_ms + inner.now.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);

        clock.advance(Duration::from_millis(20));
        clock.advance(Duration::from_millis(30));
        assert_eq!(clock.now(), Duration::from_millis(50));

        let t0 = clock.unix_millis();
        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.unix_millis() - t0, 1000);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(clock.instant_at(b) >= clock.origin());
    }
}
