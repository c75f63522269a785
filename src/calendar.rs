use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{Instant, Span};

/// DST gaps are at most a few hours; a full day bounds the search.
const MAX_GAP_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalendarError {
    #[error("local time {time} does not exist in {tz}")]
    NonexistentLocalTime { time: NaiveDateTime, tz: Tz },
    #[error("date out of range: {0}")]
    OutOfRange(NaiveDate),
}

/// Resolve a wall-clock time in `tz`. Ambiguous times (DST fall-back)
/// resolve to the earlier instant; times inside a DST gap are rejected.
pub fn resolve_local(local: NaiveDateTime, tz: Tz) -> Result<Instant, CalendarError> {
    tz.from_local_datetime(&local)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or(CalendarError::NonexistentLocalTime { time: local, tz })
}

/// First instant of `date` in `tz`. When a DST jump swallows midnight the
/// day starts at the first local minute that exists.
pub fn start_of_day(date: NaiveDate, tz: Tz) -> Result<Instant, CalendarError> {
    let midnight = date.and_time(NaiveTime::MIN);
    for minute in 0..=MAX_GAP_MINUTES {
        let local = midnight
            .checked_add_signed(TimeDelta::minutes(minute))
            .ok_or(CalendarError::OutOfRange(date))?;
        if let Some(dt) = tz.from_local_datetime(&local).earliest() {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    Err(CalendarError::OutOfRange(date))
}

/// `[start of date, start of date + 1)` in `tz`. 23 or 25 hours long on DST
/// transition days.
pub fn day_span(date: NaiveDate, tz: Tz) -> Result<Span, CalendarError> {
    let next = date.succ_opt().ok_or(CalendarError::OutOfRange(date))?;
    Ok(Span::new(start_of_day(date, tz)?, start_of_day(next, tz)?))
}

pub fn today_in(tz: Tz, now: Instant) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

// ── Day navigation ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayStep {
    Previous,
    Next,
}

/// Which days around "today" a dashboard may page through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub back_days: u32,
    pub forward_days: u32,
}

impl Default for DayWindow {
    fn default() -> Self {
        Self {
            back_days: 7,
            forward_days: 7,
        }
    }
}

impl DayWindow {
    pub fn new(back_days: u32, forward_days: u32) -> Self {
        Self {
            back_days,
            forward_days,
        }
    }

    /// Inclusive first and last navigable day.
    pub fn bounds(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let first = today
            .checked_sub_days(Days::new(self.back_days.into()))
            .unwrap_or(NaiveDate::MIN);
        let last = today
            .checked_add_days(Days::new(self.forward_days.into()))
            .unwrap_or(NaiveDate::MAX);
        (first, last)
    }

    pub fn contains(&self, today: NaiveDate, date: NaiveDate) -> bool {
        let (first, last) = self.bounds(today);
        first <= date && date <= last
    }

    /// The neighbouring day, or `None` when it falls outside the window.
    pub fn step(&self, today: NaiveDate, current: NaiveDate, step: DayStep) -> Option<NaiveDate> {
        let target = match step {
            DayStep::Previous => current.pred_opt()?,
            DayStep::Next => current.succ_opt()?,
        };
        self.contains(today, target).then_some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Sao_Paulo;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Instant {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn plain_day_is_24_hours() {
        let span = day_span(date(2024, 5, 10), Sao_Paulo).unwrap();
        assert_eq!(span.start, utc(2024, 5, 10, 3, 0));
        assert_eq!(span.end, utc(2024, 5, 11, 3, 0));
        assert_eq!(span.duration(), TimeDelta::hours(24));
    }

    #[test]
    fn utc_day_is_utc_midnight() {
        let span = day_span(date(2024, 5, 10), chrono_tz::UTC).unwrap();
        assert_eq!(span.start, utc(2024, 5, 10, 0, 0));
    }

    #[test]
    fn skipped_midnight_starts_at_first_valid_minute() {
        // Brazil sprang forward 00:00 -> 01:00 on 2018-11-04.
        let span = day_span(date(2018, 11, 4), Sao_Paulo).unwrap();
        assert_eq!(span.start, utc(2018, 11, 4, 3, 0)); // 01:00 -02:00
        assert_eq!(span.duration(), TimeDelta::hours(23));
    }

    #[test]
    fn fall_back_day_is_25_hours() {
        // 2019-02-17 00:00 -02:00 fell back to 2019-02-16 23:00 -03:00.
        let span = day_span(date(2019, 2, 16), Sao_Paulo).unwrap();
        assert_eq!(span.start, utc(2019, 2, 16, 2, 0));
        assert_eq!(span.end, utc(2019, 2, 17, 3, 0));
        assert_eq!(span.duration(), TimeDelta::hours(25));
    }

    #[test]
    fn ambiguous_local_time_takes_earlier_instant() {
        let local = date(2019, 2, 16).and_hms_opt(23, 30, 0).unwrap();
        assert_eq!(resolve_local(local, Sao_Paulo).unwrap(), utc(2019, 2, 17, 1, 30));
    }

    #[test]
    fn nonexistent_local_time_rejected() {
        let local = date(2018, 11, 4).and_hms_opt(0, 30, 0).unwrap();
        assert!(matches!(
            resolve_local(local, Sao_Paulo),
            Err(CalendarError::NonexistentLocalTime { .. })
        ));
    }

    #[test]
    fn today_follows_timezone() {
        // 01:00 UTC is still the previous evening in São Paulo.
        let now = utc(2024, 5, 11, 1, 0);
        assert_eq!(today_in(Sao_Paulo, now), date(2024, 5, 10));
        assert_eq!(today_in(chrono_tz::UTC, now), date(2024, 5, 11));
    }

    #[test]
    fn window_bounds_and_contains() {
        let today = date(2024, 5, 10);
        let window = DayWindow::default();
        assert_eq!(window.bounds(today), (date(2024, 5, 3), date(2024, 5, 17)));
        assert!(window.contains(today, date(2024, 5, 3)));
        assert!(window.contains(today, date(2024, 5, 17)));
        assert!(!window.contains(today, date(2024, 5, 2)));
        assert!(!window.contains(today, date(2024, 5, 18)));
    }

    #[test]
    fn window_step_stops_at_edges() {
        let today = date(2024, 5, 10);
        let window = DayWindow::new(1, 2);
        assert_eq!(window.step(today, today, DayStep::Previous), Some(date(2024, 5, 9)));
        assert_eq!(window.step(today, date(2024, 5, 9), DayStep::Previous), None);
        assert_eq!(window.step(today, date(2024, 5, 11), DayStep::Next), Some(date(2024, 5, 12)));
        assert_eq!(window.step(today, date(2024, 5, 12), DayStep::Next), None);
    }

    #[test]
    fn zero_window_is_today_only() {
        let today = date(2024, 5, 10);
        let window = DayWindow::new(0, 0);
        assert!(window.contains(today, today));
        assert_eq!(window.step(today, today, DayStep::Next), None);
    }
}
