//! Clock abstraction over "now" and "which local calendar day is it".

use chrono::{DateTime, Local, NaiveDate, Utc};

/// Source of wall-clock time for the accountant.
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;

    /// Calendar date of `at` in the local timezone
    fn local_day(&self, at: DateTime<Utc>) -> NaiveDate;
}

/// Production clock backed by the system clock and timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_day(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&Local).date_naive()
    }
}

#[cfg(test)]
pub(crate) use manual::ManualClock;
