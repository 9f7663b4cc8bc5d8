//! Injectable wall clock

use chrono::{DateTime, Duration, FixedOffset, Local, Timelike, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    /// Local wall-clock time
    fn now(&self) -> DateTime<FixedOffset>;

    fn now_utc(&self) -> DateTime<Utc> {
        self.now().with_timezone(&Utc)
    }
}

/// The host clock in its local timezone
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl ManualClock {
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<FixedOffset>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Coarse part of day for an hour in 0..24
pub fn time_bucket(hour: u32) -> &'static str {
    match hour {
        5..=11 => "morning",
        12..=16 => "afternoon",
        17..=20 => "evening",
        _ => "night",
    }
}

/// Part of day for a wall-clock instant
pub fn time_bucket_of(now: &DateTime<FixedOffset>) -> &'static str {
    time_bucket(now.hour())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_cover_the_day() {
        assert_eq!(time_bucket(4), "night");
        assert_eq!(time_bucket(5), "morning");
        assert_eq!(time_bucket(11), "morning");
        assert_eq!(time_bucket(12), "afternoon");
        assert_eq!(time_bucket(17), "evening");
        assert_eq!(time_bucket(20), "evening");
        assert_eq!(time_bucket(21), "night");
    }

    #[test]
    fn manual_clock_moves_on_demand() {
        let start = DateTime::parse_from_rfc3339("2024-05-01T19:30:00+02:00").unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::minutes(45));
        assert_eq!(clock.now().hour(), 20);
        assert_eq!(time_bucket_of(&clock.now()), "evening");
        assert_eq!(clock.now_utc().hour(), 18);
    }
}
