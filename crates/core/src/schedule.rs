//! Time and schedule oracle.
//!
//! Everything here is a pure function of its inputs. Callers pass `now` explicitly so
//! tests can pin the clock; production code reads it from a [`Clock`].

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use chrono_tz::Tz;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to a single instant.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// Whether `now`, seen from `timezone`, falls inside the inclusive `[start, end]` window on
/// an active ISO weekday. Unknown zones and malformed times fail closed.
pub fn is_business_hours(
    now: DateTime<Utc>,
    timezone: &str,
    start: &str,
    end: &str,
    active_weekdays: &[u8],
) -> bool {
    let Ok(tz) = timezone.trim().parse::<Tz>() else {
        return false;
    };
    let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
        return false;
    };

    let local = now.with_timezone(&tz);
    let weekday = local.weekday().number_from_monday();
    if !active_weekdays.iter().any(|day| u32::from(*day) == weekday) {
        return false;
    }

    let current = local.time();
    start <= current && current <= end
}

pub fn next_followup_time(last_sent_at: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    last_sent_at + Duration::days(i64::from(days))
}

pub fn is_ready_for_action(next_check_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match next_check_at {
        None => true,
        Some(due) => now >= due,
    }
}

pub fn current_date_string(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Renders a duration in seconds as `"45s"`, `"3m 20s"`, or `"2h 5m"`.
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 3600 {
        return format!("{}m {}s", seconds / 60, seconds % 60);
    }
    format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{
        current_date_string, format_duration, is_business_hours, is_ready_for_action,
        next_followup_time,
    };

    const WEEKDAYS: [u8; 5] = [1, 2, 3, 4, 5];

    #[test]
    fn business_hours_are_evaluated_in_the_configured_zone() {
        // 2026-03-04 is a Wednesday; 15:00 UTC is 10:00 in New York.
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 15, 0, 0).single().expect("valid instant");
        assert!(is_business_hours(now, "America/New_York", "09:00", "17:00", &WEEKDAYS));

        // 13:30 UTC is 08:30 in New York.
        let early = Utc.with_ymd_and_hms(2026, 3, 4, 13, 30, 0).single().expect("valid instant");
        assert!(!is_business_hours(early, "America/New_York", "09:00", "17:00", &WEEKDAYS));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let at_start = Utc.with_ymd_and_hms(2026, 3, 4, 9, 0, 0).single().expect("valid instant");
        let at_end = Utc.with_ymd_and_hms(2026, 3, 4, 17, 0, 0).single().expect("valid instant");
        assert!(is_business_hours(at_start, "UTC", "09:00", "17:00", &WEEKDAYS));
        assert!(is_business_hours(at_end, "UTC", "09:00", "17:00", &WEEKDAYS));
    }

    #[test]
    fn inactive_weekday_is_rejected() {
        // 2026-03-07 is a Saturday.
        let saturday = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).single().expect("valid instant");
        assert!(!is_business_hours(saturday, "UTC", "09:00", "17:00", &WEEKDAYS));
        assert!(is_business_hours(saturday, "UTC", "09:00", "17:00", &[6, 7]));
    }

    #[test]
    fn bad_inputs_fail_closed() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).single().expect("valid instant");
        assert!(!is_business_hours(now, "Mars/Olympus", "09:00", "17:00", &WEEKDAYS));
        assert!(!is_business_hours(now, "UTC", "9am", "17:00", &WEEKDAYS));
        assert!(!is_business_hours(now, "UTC", "09:00", "25:00", &WEEKDAYS));
    }

    #[test]
    fn readiness_and_followup_arithmetic() {
        let now = Utc::now();
        assert!(is_ready_for_action(None, now));
        assert!(is_ready_for_action(Some(now), now));
        assert!(!is_ready_for_action(Some(now + Duration::seconds(1)), now));
        assert_eq!(next_followup_time(now, 3), now + Duration::days(3));
    }

    #[test]
    fn formatting_helpers() {
        let now = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 0).single().expect("valid instant");
        assert_eq!(current_date_string(now), "2026-01-09");
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(200), "3m 20s");
        assert_eq!(format_duration(7500), "2h 5m");
    }
}
