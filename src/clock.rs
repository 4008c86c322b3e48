//! Wall-clock sources
//!
//! The migration loop compares its cursor against "now" on every slice and
//! the TSDB computes retention cutoffs from it, so both take a [`Clock`]
//! rather than calling `Utc::now()` directly. Production uses
//! [`BoundedClock`]; tests drive time with [`ManualClock`].

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }

    /// Oldest timestamp still inside a retention of `retention_ms`.
    fn retention_cutoff_ms(&self, retention_ms: i64) -> i64 {
        self.now_ms() - retention_ms
    }
}

/// A clock that never goes backward and applies a skew margin to
/// retention cutoffs.
pub struct BoundedClock {
    /// Largest timestamp handed out so far (millis)
    high_water_ms: AtomicI64,
    /// Maximum tolerated clock skew (millis)
    max_skew_ms: i64,
}

impl BoundedClock {
    pub fn new(max_skew: std::time::Duration) -> Self {
        Self {
            high_water_ms: AtomicI64::new(0),
            max_skew_ms: max_skew.as_millis() as i64,
        }
    }

    /// Monotonic millisecond timestamp.
    ///
    /// If the wall clock stepped backward (NTP adjustment), the previous
    /// high-water mark is returned instead.
    pub fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        let prev = self.high_water_ms.fetch_max(wall, Ordering::AcqRel);
        wall.max(prev)
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(30))
    }
}

impl Clock for BoundedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_millis()).unwrap_or_else(Utc::now)
    }

    fn now_ms(&self) -> i64 {
        self.now_millis()
    }

    /// Shifted earlier by the skew margin, so data stamped by a clock
    /// running ahead is not deleted early.
    fn retention_cutoff_ms(&self, retention_ms: i64) -> i64 {
        self.now_millis() - retention_ms - self.max_skew_ms
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        self.now_ms
            .fetch_add(by.num_milliseconds(), Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_ms.load(Ordering::Acquire))
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}
