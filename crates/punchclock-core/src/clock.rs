//! Time sources and local calendar helpers.
//!
//! All stored timestamps are Unix seconds. Business rules (working hours,
//! calendar days) are evaluated in the site's local time, described by a
//! fixed UTC offset.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, TimeZone, Utc, Weekday};

use crate::db::unix_timestamp;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current Unix timestamp in seconds.
    fn now(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        unix_timestamp()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct FixedClock {
    now: Arc<AtomicI64>,
}

impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now)),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Converts between Unix timestamps and the site's local calendar.
#[derive(Debug, Clone, Copy)]
pub struct LocalCalendar {
    offset: FixedOffset,
}

impl LocalCalendar {
    /// Build a calendar from a UTC offset in minutes (e.g. `60` for CET).
    /// Out-of-range offsets fall back to UTC.
    pub fn from_offset_minutes(minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// Local date-time for a Unix timestamp.
    pub fn local(&self, ts: i64) -> DateTime<FixedOffset> {
        DateTime::from_timestamp(ts, 0)
            .unwrap_or_default()
            .with_timezone(&self.offset)
    }

    /// Local calendar date of a Unix timestamp.
    pub fn date_of(&self, ts: i64) -> NaiveDate {
        self.local(ts).date_naive()
    }

    /// Whether the timestamp falls on a Saturday or Sunday locally.
    pub fn is_weekend(&self, ts: i64) -> bool {
        matches!(self.local(ts).weekday(), Weekday::Sat | Weekday::Sun)
    }

    /// Unix timestamp range `[start, end)` covering a local date.
    pub fn day_bounds(&self, date: NaiveDate) -> (i64, i64) {
        let start = date
            .and_hms_opt(0, 0, 0)
            .and_then(|naive| self.offset.from_local_datetime(&naive).single())
            .map_or(0, |dt| dt.timestamp());
        (start, start + 86_400)
    }
}

impl Default for LocalCalendar {
    fn default() -> Self {
        Self::utc()
    }
}
