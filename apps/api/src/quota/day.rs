use std::time::Duration;

use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};

/// Fixed instant at which quota day buckets roll over: local midnight at a
/// configured UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct DayBoundary {
    offset: FixedOffset,
}

impl DayBoundary {
    /// `offset_minutes` east of UTC. Out-of-range offsets fall back to UTC.
    pub fn new(offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    pub fn bucket_for(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    pub fn today(&self) -> NaiveDate {
        self.bucket_for(Utc::now())
    }

    /// The UTC instant the bucket containing `now` ends.
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = self.bucket_for(now);
        let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
        let local_midnight = tomorrow.and_time(NaiveTime::MIN);
        let utc_midnight = local_midnight - self.offset;
        DateTime::from_naive_utc_and_offset(utc_midnight, Utc)
    }

    pub fn time_until_reset(&self, now: DateTime<Utc>) -> Duration {
        (self.next_reset(now) - now).to_std().unwrap_or_default()
    }
}

impl Default for DayBoundary {
    fn default() -> Self {
        Self::utc()
    }
}

/// Human-readable countdown, e.g. `"5h 12m"` or `"42m"`.
pub fn format_countdown(remaining: Duration) -> String {
    let total_minutes = remaining.as_secs() / 60;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
