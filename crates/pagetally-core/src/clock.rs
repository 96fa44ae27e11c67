//! Wall-clock access and local-day arithmetic.
//!
//! Every "day" in pagetally is a calendar day in the server's local timezone:
//! dedup markers expire at the next local midnight and the rollover job fires
//! at local midnight. Time is read through [`Clock`] so tests can move it.

use std::sync::Mutex;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    /// Current calendar day in local time.
    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&Local).date_naive()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// A manual clock set to local noon of `date`, far from either midnight.
    pub fn at_local_noon(date: NaiveDate) -> Self {
        let noon = date
            .and_hms_opt(12, 0, 0)
            .and_then(|dt| Local.from_local_datetime(&dt).earliest())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        Self::new(noon)
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Local midnight at the start of `date`, as a UTC instant.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(chrono::NaiveTime::MIN);
    match Local.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.with_timezone(&Utc),
        // Midnight skipped by a DST jump; the first valid instant is an hour on.
        None => Local
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| naive.and_utc()),
    }
}

/// The local midnight that ends `date`.
pub fn next_midnight(date: NaiveDate) -> DateTime<Utc> {
    start_of_day(date + chrono::Duration::days(1))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Minute-resolution local timestamp used for realtime snapshots.
pub fn format_minute(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}
