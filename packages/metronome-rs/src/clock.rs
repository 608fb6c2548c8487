//! Injectable clock.
//!
//! The engine never reads wall time directly; every operation that needs
//! "now" receives it from a [`Clock`]. Production code uses [`SystemClock`],
//! tests use [`FixedClock`] and advance it by hand.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of the current instant, always UTC.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to an explicit instant, settable from tests.
///
/// Cloning shares the underlying instant, so a handle kept by the test can
/// move time forward for an engine that holds another handle.
#[derive(Debug, Clone)]
pub struct FixedClock {
    instant: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self {
            instant: Arc::new(Mutex::new(instant)),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.instant.lock() = instant;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.instant.lock();
        *guard += delta;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.instant.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fixed_clock_reads_back() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let clock = FixedClock::at(t0);
        assert_eq!(clock.now(), t0);
    }

    #[test]
    fn test_fixed_clock_shared_across_clones() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let clock = FixedClock::at(t0);
        let handle = clock.clone();
        handle.advance(chrono::Duration::hours(3));
        assert_eq!(clock.now(), t0 + chrono::Duration::hours(3));
    }
}
