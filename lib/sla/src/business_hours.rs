//! Optional business-hours clock (§4.4): counts elapsed time only within a
//! configured [start, end) window, optionally excluding weekends, carrying
//! correctly across night/weekend boundaries.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::is_weekend;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessHoursConfig {
    /// Hour of day business hours start, inclusive (0-23).
    pub start_hour: u32,
    /// Hour of day business hours end, exclusive (1-24).
    pub end_hour: u32,
    pub exclude_weekends: bool,
}

impl Default for BusinessHoursConfig {
    fn default() -> Self { Self { start_hour: 9, end_hour: 17, exclude_weekends: true } }
}

/// Hours of business time between `from` and `to`, walking day by day so
/// partial first/last days and any number of intervening nights/weekends are
/// handled uniformly.
pub fn business_hours_between(from: DateTime<Utc>, to: DateTime<Utc>, config: &BusinessHoursConfig) -> f64 {
    if to <= from {
        return 0.0;
    }

    let mut total = Duration::zero();
    let mut cursor = from;

    while cursor < to {
        let day_end = (cursor.date_naive() + chrono::Duration::days(1)).and_hms_opt(0, 0, 0).unwrap().and_utc();
        let window_end = day_end.min(to);
        total = total + business_hours_within_day(cursor, window_end, config);
        cursor = day_end;
    }

    total.num_milliseconds() as f64 / 3_600_000.0
}

/// Computes business hours between two timestamps guaranteed to fall on the
/// same calendar day.
fn business_hours_within_day(from: DateTime<Utc>, to: DateTime<Utc>, config: &BusinessHoursConfig) -> Duration {
    if config.exclude_weekends && is_weekend(from) {
        return Duration::zero();
    }

    let day_start = from.date_naive().and_hms_opt(config.start_hour, 0, 0).unwrap().and_utc();
    let day_end = from.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc() + Duration::hours(config.end_hour as i64);

    let window_start = from.max(day_start);
    let window_end = to.min(day_end);

    if window_end <= window_start {
        return Duration::zero();
    }
    window_end - window_start
}

/// Convenience for logging/diagnostics: whether `when` falls within the
/// configured business window on its own day (ignoring weekend exclusion).
pub fn is_within_window(when: DateTime<Utc>, config: &BusinessHoursConfig) -> bool {
    let hour = when.hour();
    hour >= config.start_hour && hour < config.end_hour
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn same_business_day_counts_directly() {
        let config = BusinessHoursConfig::default();
        let from = Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).unwrap(); // Monday
        let to = Utc.with_ymd_and_hms(2026, 8, 3, 14, 0, 0).unwrap();
        assert_eq!(business_hours_between(from, to, &config), 4.0);
    }

    #[test]
    fn overnight_gap_is_excluded() {
        let config = BusinessHoursConfig::default();
        let from = Utc.with_ymd_and_hms(2026, 8, 3, 16, 0, 0).unwrap(); // Monday 16:00
        let to = Utc.with_ymd_and_hms(2026, 8, 4, 10, 0, 0).unwrap(); // Tuesday 10:00
        // Monday 16:00-17:00 (1h) + Tuesday 09:00-10:00 (1h) = 2h.
        assert_eq!(business_hours_between(from, to, &config), 2.0);
    }

    #[test]
    fn weekend_is_excluded_when_configured() {
        let config = BusinessHoursConfig::default();
        let from = Utc.with_ymd_and_hms(2026, 8, 7, 16, 0, 0).unwrap(); // Friday 16:00
        let to = Utc.with_ymd_and_hms(2026, 8, 10, 10, 0, 0).unwrap(); // Monday 10:00
        // Friday 16:00-17:00 (1h) + Monday 09:00-10:00 (1h) = 2h.
        assert_eq!(business_hours_between(from, to, &config), 2.0);
    }
}
