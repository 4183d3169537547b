//! Time Sources
//!
//! The tracker never reads the wall clock directly. It asks a [`TimeSource`],
//! which is the system clock in production and a [`SimClock`] under replay.
//! Both share the same nanosecond unit, so the state machine code is identical.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Nanoseconds since Unix epoch (1970-01-01 00:00:00 UTC).
pub type Nanos = i64;

pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;
pub const NANOS_PER_HOUR: i64 = 3_600 * NANOS_PER_SEC;

/// Source of "now" for the health tracker.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Nanos;
}

/// Wall-clock time source used by the live platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    #[inline]
    fn now(&self) -> Nanos {
        datetime_to_nanos(&chrono::Utc::now())
    }
}

/// Shared simulated clock.
///
/// Cloning yields a handle onto the same cell: the replay orchestrator keeps one
/// handle and advances it, the tracker reads through another.
///
/// # Determinism Contract
/// - `now()` returns the simulated time, never system time
/// - `advance_to()` only moves forward
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    current: Arc<AtomicI64>,
}

impl SimClock {
    pub fn new(start_time: Nanos) -> Self {
        Self {
            current: Arc::new(AtomicI64::new(start_time)),
        }
    }

    pub fn from_unix_secs(secs: i64) -> Self {
        Self::new(secs * NANOS_PER_SEC)
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        self.current.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn now_secs(&self) -> i64 {
        self.now() / NANOS_PER_SEC
    }

    /// Advance clock to a new time. Debug builds panic if time would go backward.
    pub fn advance_to(&self, new_time: Nanos) {
        let current = self.now();
        debug_assert!(
            new_time >= current,
            "SimClock: cannot go backward from {} to {}",
            current,
            new_time
        );
        self.current.store(new_time.max(current), Ordering::SeqCst);
    }

    pub fn advance_by(&self, delta: Nanos) {
        debug_assert!(delta >= 0, "SimClock: delta must be non-negative");
        self.current.fetch_add(delta.max(0), Ordering::SeqCst);
    }
}

impl TimeSource for SimClock {
    #[inline]
    fn now(&self) -> Nanos {
        SimClock::now(self)
    }
}

impl fmt::Display for SimClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let now = self.now();
        write!(f, "{}.{:09}s", now / NANOS_PER_SEC, now % NANOS_PER_SEC)
    }
}

#[inline]
pub fn secs_to_nanos(secs: u64) -> Nanos {
    (secs as i64).saturating_mul(NANOS_PER_SEC)
}

#[inline]
pub fn nanos_to_hours(nanos: Nanos) -> f64 {
    nanos as f64 / NANOS_PER_HOUR as f64
}

#[inline]
pub fn datetime_to_nanos(dt: &chrono::DateTime<chrono::Utc>) -> Nanos {
    dt.timestamp_nanos_opt().unwrap_or(0)
}

/// Convert Nanos to a chrono DateTime. Out-of-range values yield `None`.
pub fn nanos_to_datetime(nanos: Nanos) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::TimeZone;
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let nsecs = nanos.rem_euclid(NANOS_PER_SEC) as u32;
    chrono::Utc.timestamp_opt(secs, nsecs).single()
}

/// Parse an RFC3339 string to Nanos.
pub fn parse_timestamp(s: &str) -> Option<Nanos> {
    chrono::DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| datetime_to_nanos(&dt.with_timezone(&chrono::Utc)))
}

/// Render Nanos as RFC3339 (UTC, `Z` suffix), or the raw integer if out of range.
pub fn format_nanos(nanos: Nanos) -> String {
    nanos_to_datetime(nanos)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
        .unwrap_or_else(|| nanos.to_string())
}
