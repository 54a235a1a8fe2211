//! Weekly opening hours: time model, open/closed evaluation and retry delays.
//!
//! Every instant is mapped onto a single axis of minutes since the start of the
//! week (Sunday 00:00 UTC), `0..10_080`. A range whose close lies "before" its open
//! on that axis wraps past the end of the week (e.g. Saturday 22:00 → Sunday 02:00).
//!
//! Both functions here are pure and total: they never fail and hold no state.

use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

pub const MINUTES_PER_DAY: u32 = 24 * 60;
pub const MINUTES_PER_WEEK: u32 = 7 * MINUTES_PER_DAY;

/// Added to every computed wait so the call does not land on the opening minute.
pub const OPENING_BUFFER: Duration = Duration::from_secs(30 * 60);

/// Returned when there is nothing to wait for (no ranges at all). Not buffered.
pub const FALLBACK_DELAY: Duration = Duration::from_secs(60 * 60);

/// A weekday + hour + minute instant in UTC. Weekday 0 is Sunday.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTimePoint")]
pub struct TimePoint {
    weekday: u8,
    hour: u8,
    minute: u8,
}

#[derive(Deserialize)]
struct RawTimePoint {
    weekday: i64,
    hour: i64,
    minute: i64,
}

impl TryFrom<RawTimePoint> for TimePoint {
    type Error = DomainError;

    fn try_from(raw: RawTimePoint) -> Result<Self, Self::Error> {
        let narrow = |v: i64, what: &str| {
            u8::try_from(v).map_err(|_| DomainError::validation(format!("{what} out of range: {v}")))
        };
        TimePoint::new(
            narrow(raw.weekday, "weekday")?,
            narrow(raw.hour, "hour")?,
            narrow(raw.minute, "minute")?,
        )
    }
}

impl TimePoint {
    pub fn new(weekday: u8, hour: u8, minute: u8) -> Result<Self, DomainError> {
        if weekday > 6 {
            return Err(DomainError::validation(format!("weekday out of range: {weekday}")));
        }
        if hour > 23 {
            return Err(DomainError::validation(format!("hour out of range: {hour}")));
        }
        if minute > 59 {
            return Err(DomainError::validation(format!("minute out of range: {minute}")));
        }
        Ok(Self { weekday, hour, minute })
    }

    /// Point on the week axis for a wall-clock instant.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            weekday: at.weekday().num_days_from_sunday() as u8,
            hour: at.hour() as u8,
            minute: at.minute() as u8,
        }
    }

    /// Inverse of [`TimePoint::minutes_since_week_start`]; the input is taken modulo a week.
    pub fn from_week_minutes(minutes: u32) -> Self {
        let minutes = minutes % MINUTES_PER_WEEK;
        Self {
            weekday: (minutes / MINUTES_PER_DAY) as u8,
            hour: ((minutes % MINUTES_PER_DAY) / 60) as u8,
            minute: (minutes % 60) as u8,
        }
    }

    pub fn weekday(&self) -> u8 {
        self.weekday
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn minutes_since_week_start(&self) -> u32 {
        u32::from(self.weekday) * MINUTES_PER_DAY + u32::from(self.hour) * 60 + u32::from(self.minute)
    }
}

/// Weekly open/close interval in UTC. `[open, close)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub open: TimePoint,
    pub close: TimePoint,
}

impl TimeRange {
    pub fn new(open: TimePoint, close: TimePoint) -> Self {
        Self { open, close }
    }

    /// Whether the interval crosses the end of the week.
    pub fn wraps(&self) -> bool {
        self.close.minutes_since_week_start() <= self.open.minutes_since_week_start()
    }

    pub fn contains(&self, now: TimePoint) -> bool {
        let open = self.open.minutes_since_week_start();
        let close = self.close.minutes_since_week_start();
        let current = now.minutes_since_week_start();

        if close > open {
            open <= current && current < close
        } else {
            current >= open || current < close
        }
    }

    /// Minutes from `now` until this range next opens, in `1..=MINUTES_PER_WEEK`.
    pub fn minutes_until_open(&self, now: TimePoint) -> u32 {
        let open = self.open.minutes_since_week_start();
        let current = now.minutes_since_week_start();

        if open > current {
            open - current
        } else {
            MINUTES_PER_WEEK - current + open
        }
    }
}

/// Whether any range covers `now`. An empty list means closed.
pub fn is_open(ranges: &[TimeRange], now: TimePoint) -> bool {
    ranges.iter().any(|range| range.contains(now))
}

/// How long to wait before the soonest upcoming opening, plus [`OPENING_BUFFER`].
///
/// Array order is irrelevant; the minimum wait across all ranges wins. With no ranges
/// the raw [`FALLBACK_DELAY`] is returned without a buffer.
pub fn next_open_delay(ranges: &[TimeRange], now: TimePoint) -> Duration {
    match ranges.iter().map(|range| range.minutes_until_open(now)).min() {
        Some(minutes) => Duration::from_secs(u64::from(minutes) * 60) + OPENING_BUFFER,
        None => FALLBACK_DELAY,
    }
}
