//! Calendar boundaries in the fixed reference timezone.
//!
//! Monthly resets happen on the 1st of the month and resource flags clear at
//! midnight, both measured at a configured UTC offset rather than the
//! caller's local time.

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Calendar month in the reference timezone. Ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeriodKey {
    pub year: i32,
    pub month: u32,
}

impl PeriodKey {
    pub fn new(year: i32, month: u32) -> Self {
        PeriodKey { year, month }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Reference timezone used for every calendar decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceZone {
    offset: FixedOffset,
}

impl ReferenceZone {
    pub fn utc() -> Self {
        ReferenceZone {
            offset: Utc.fix(),
        }
    }

    pub fn from_offset_minutes(minutes: i32) -> Result<Self> {
        let offset = FixedOffset::east_opt(minutes * 60).ok_or_else(|| {
            Error::InvalidArgument(format!("UTC offset of {} minutes is out of range", minutes))
        })?;
        Ok(ReferenceZone { offset })
    }

    /// Month containing `now`.
    pub fn period_of(&self, now: DateTime<Utc>) -> PeriodKey {
        let local = now.with_timezone(&self.offset);
        PeriodKey::new(local.year(), local.month())
    }

    /// Next local midnight strictly after `now`, as UTC.
    pub fn next_midnight(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.offset);
        let tomorrow = local.date_naive() + Duration::days(1);
        let midnight = tomorrow.and_time(NaiveTime::MIN);
        match self.offset.from_local_datetime(&midnight).single() {
            Some(dt) => dt.with_timezone(&Utc),
            // fixed offsets are never ambiguous; keep a sane bound regardless
            None => now + Duration::days(1),
        }
    }
}

impl Default for ReferenceZone {
    fn default() -> Self {
        ReferenceZone::utc()
    }
}
