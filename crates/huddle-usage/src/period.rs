//! Counter window arithmetic. Everything is UTC so reads, writes and cleanup
//! agree on where a window starts.

use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveTime, Timelike, Utc};

use huddle_types::models::UsagePeriod;

/// Start of the window containing `now`.
pub fn period_start(period: UsagePeriod, now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    match period {
        UsagePeriod::Hour => midnight + Duration::hours(now.hour() as i64),
        UsagePeriod::Day => midnight,
        UsagePeriod::Month => midnight - Days::new(now.day0() as u64),
    }
}

/// When the window containing `now` resets.
pub fn next_reset(period: UsagePeriod, now: DateTime<Utc>) -> DateTime<Utc> {
    let start = period_start(period, now);
    match period {
        UsagePeriod::Hour => start + Duration::hours(1),
        UsagePeriod::Day => start + Days::new(1),
        UsagePeriod::Month => start + Months::new(1),
    }
}

/// Per period, the oldest window start that is still live. Rows that started
/// before it have fully elapsed.
pub fn cleanup_cutoffs(now: DateTime<Utc>) -> [(UsagePeriod, DateTime<Utc>); 3] {
    UsagePeriod::ALL.map(|p| (p, period_start(p, now)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn hour_window() {
        let now = at(2026, 3, 14, 9, 42);
        assert_eq!(period_start(UsagePeriod::Hour, now), at(2026, 3, 14, 9, 0));
        assert_eq!(next_reset(UsagePeriod::Hour, now), at(2026, 3, 14, 10, 0));
    }

    #[test]
    fn day_window_rolls_at_utc_midnight() {
        let now = at(2026, 3, 14, 23, 59);
        assert_eq!(period_start(UsagePeriod::Day, now), at(2026, 3, 14, 0, 0));
        assert_eq!(next_reset(UsagePeriod::Day, now), at(2026, 3, 15, 0, 0));
    }

    #[test]
    fn month_window_handles_year_end() {
        let now = at(2026, 12, 31, 18, 0);
        assert_eq!(period_start(UsagePeriod::Month, now), at(2026, 12, 1, 0, 0));
        assert_eq!(next_reset(UsagePeriod::Month, now), at(2027, 1, 1, 0, 0));
    }

    #[test]
    fn exact_boundary_starts_a_new_window() {
        let now = at(2026, 3, 1, 0, 0);
        for period in UsagePeriod::ALL {
            assert_eq!(period_start(period, now), now);
        }
    }

    #[test]
    fn cutoffs_are_current_window_starts() {
        let now = at(2026, 3, 14, 9, 42);
        let cutoffs = cleanup_cutoffs(now);
        assert_eq!(cutoffs[0], (UsagePeriod::Hour, at(2026, 3, 14, 9, 0)));
        assert_eq!(cutoffs[2], (UsagePeriod::Month, at(2026, 3, 1, 0, 0)));
    }
}
