//! Wall-clock sources for record timestamps.
//!
//! # Responsibility
//! - Provide the single source of `created_at`/`updated_at`/`deleted_at`
//!   values written by repositories and the engine.
//!
//! # Invariants
//! - Every clock hands out strictly increasing millisecond timestamps, so a
//!   write that happens after another write always compares greater.
//!   Staleness detection in the slicer depends on this.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Shared clock handle injected into repositories and services.
pub type SharedClock = Arc<dyn Clock + Send + Sync>;

/// Source of record timestamps.
pub trait Clock {
    /// Returns the next timestamp, strictly greater than any previously
    /// returned by this clock.
    fn now(&self) -> DateTime<Utc>;

    /// Calendar date of "now" in UTC.
    fn today(&self) -> chrono::NaiveDate {
        self.now().date_naive()
    }
}

static LAST_SYSTEM_MS: AtomicI64 = AtomicI64::new(0);

/// Process-wide system clock with millisecond resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_millis();
        let issued = next_after(&LAST_SYSTEM_MS, wall);
        millis_to_datetime(issued)
    }
}

/// Returns the default shared system clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Manually driven clock for deterministic tests and replays.
///
/// Each `now()` call returns the current position and then moves one
/// millisecond forward.
#[derive(Debug)]
pub struct ManualClock {
    current_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current_ms: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.current_ms
            .fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
    }

    /// Jumps to `at`; moving backwards is ignored.
    pub fn set(&self, at: DateTime<Utc>) {
        self.current_ms
            .fetch_max(at.timestamp_millis(), Ordering::SeqCst);
    }

    /// Wraps this clock into a shared handle.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        millis_to_datetime(self.current_ms.fetch_add(1, Ordering::SeqCst))
    }
}

fn next_after(last: &AtomicI64, wall_ms: i64) -> i64 {
    let mut previous = last.load(Ordering::SeqCst);
    loop {
        let candidate = wall_ms.max(previous + 1);
        match last.compare_exchange(previous, candidate, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return candidate,
            Err(actual) => previous = actual,
        }
    }
}

/// Converts epoch milliseconds to a UTC timestamp, saturating on overflow.
pub(crate) fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::{Clock, ManualClock, SystemClock};
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn system_clock_is_strictly_increasing() {
        let clock = SystemClock;
        let mut previous = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn manual_clock_ticks_and_advances() {
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let first = clock.now();
        let second = clock.now();
        assert_eq!(first, start);
        assert!(second > first);

        clock.advance(Duration::days(2));
        assert_eq!(
            clock.today(),
            chrono::NaiveDate::from_ymd_opt(2024, 3, 12).unwrap()
        );
    }

    #[test]
    fn manual_clock_set_never_moves_backwards() {
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.set(start - Duration::days(1));
        assert!(clock.now() >= start);
    }
}
