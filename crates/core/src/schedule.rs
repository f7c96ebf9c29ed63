use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{AssistantConfig, UpcomingWindow};

/// Half-open interval `[start, end)` in the user's local offset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl TimeWindow {
    pub fn contains(&self, instant: &DateTime<FixedOffset>) -> bool {
        *instant >= self.start && *instant < self.end
    }
}

/// Decides what "upcoming" means when someone asks for their schedule.
pub trait UpcomingWindowPolicy: Send + Sync {
    fn window(&self, now: DateTime<FixedOffset>) -> TimeWindow;
    fn name(&self) -> &'static str;
}

/// `now` until the same instant `days` later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RollingDays {
    pub days: u32,
}

impl Default for RollingDays {
    fn default() -> Self {
        Self { days: 7 }
    }
}

impl UpcomingWindowPolicy for RollingDays {
    fn window(&self, now: DateTime<FixedOffset>) -> TimeWindow {
        TimeWindow { start: now, end: now + Duration::days(i64::from(self.days)) }
    }

    fn name(&self) -> &'static str {
        "rolling_days"
    }
}

/// `now` until the end of the current Monday-based week. When fewer than
/// `min_days` calendar days remain (today included), the window runs to the
/// end of the following week instead, so a Saturday query still covers next
/// week.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemainderOfWeek {
    pub min_days: u32,
}

impl Default for RemainderOfWeek {
    fn default() -> Self {
        Self { min_days: 3 }
    }
}

impl UpcomingWindowPolicy for RemainderOfWeek {
    fn window(&self, now: DateTime<FixedOffset>) -> TimeWindow {
        let days_left = 7 - now.weekday().num_days_from_monday();
        let span = if days_left < self.min_days { days_left + 7 } else { days_left };
        let end_date = now.date_naive() + Duration::days(i64::from(span));
        let end = now
            .offset()
            .from_local_datetime(&end_date.and_time(NaiveTime::MIN))
            .single()
            .unwrap_or_else(|| now + Duration::days(i64::from(span)));
        TimeWindow { start: now, end }
    }

    fn name(&self) -> &'static str {
        "remainder_of_week"
    }
}

pub fn policy_from_config(config: &AssistantConfig) -> Box<dyn UpcomingWindowPolicy> {
    match config.upcoming_window {
        UpcomingWindow::RollingDays => Box::new(RollingDays { days: config.upcoming_days }),
        UpcomingWindow::RemainderOfWeek => Box::new(RemainderOfWeek::default()),
    }
}

/// Fixed offset from minutes east of UTC, falling back to UTC when out of range.
pub fn offset_from_minutes(minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(minutes * 60).unwrap_or_else(|| Utc.fix())
}

pub fn local_now(offset: FixedOffset) -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&offset)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Weekday};

    use super::{offset_from_minutes, RemainderOfWeek, RollingDays, UpcomingWindowPolicy};

    fn dubai(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<FixedOffset> {
        match offset_from_minutes(240).with_ymd_and_hms(y, m, d, h, min, 0).single() {
            Some(value) => value,
            None => panic!("invalid test timestamp"),
        }
    }

    #[test]
    fn rolling_days_spans_exactly_seven_days() {
        let now = dubai(2026, 10, 16, 23, 59);
        let window = RollingDays::default().window(now);
        assert_eq!(window.start, now);
        assert_eq!(window.end - window.start, Duration::days(7));
        assert!(window.contains(&dubai(2026, 10, 23, 23, 58)));
        assert!(!window.contains(&dubai(2026, 10, 23, 23, 59)));
    }

    #[test]
    fn remainder_of_week_ends_at_next_monday_midnight() {
        // 2026-10-12 is a Monday.
        let monday = dubai(2026, 10, 12, 9, 0);
        assert_eq!(monday.weekday(), Weekday::Mon);
        let window = RemainderOfWeek::default().window(monday);
        assert_eq!(window.end, dubai(2026, 10, 19, 0, 0));

        let friday_late = dubai(2026, 10, 16, 23, 59);
        let window = RemainderOfWeek::default().window(friday_late);
        assert_eq!(window.end, dubai(2026, 10, 19, 0, 0));
        assert!(window.contains(&dubai(2026, 10, 18, 23, 59)));
    }

    #[test]
    fn remainder_of_week_rolls_weekend_queries_into_next_week() {
        let saturday = dubai(2026, 10, 17, 0, 0);
        let window = RemainderOfWeek::default().window(saturday);
        assert_eq!(window.end, dubai(2026, 10, 26, 0, 0));

        let sunday_late = dubai(2026, 10, 18, 23, 30);
        let window = RemainderOfWeek::default().window(sunday_late);
        assert_eq!(window.end, dubai(2026, 10, 26, 0, 0));
    }
}
