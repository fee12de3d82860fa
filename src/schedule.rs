//! Task activity windows, evaluated against local wall-clock time.

use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Continuous,
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid time '{0}' (expected HH:MM or HH:MM:SS)")]
    BadTime(String),
    #[error("{kind:?} schedule day {day} out of range")]
    BadDay { kind: ScheduleType, day: u32 },
    #[error("{0:?} schedule needs at least one day")]
    NoDays(ScheduleType),
    #[error("start and end time must be given together")]
    HalfWindow,
}

/// When a task should be running.
///
/// Days are ISO weekdays (Monday = 1 .. Sunday = 7) for weekly schedules
/// and days of the month (1..31) for monthly ones. A window whose start is
/// after its end wraps past midnight. Without a window the whole day is
/// active.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    kind: ScheduleType,
    window: Option<(NaiveTime, NaiveTime)>,
    days: BTreeSet<u32>,
}

impl Schedule {
    pub fn continuous() -> Self {
        Self {
            kind: ScheduleType::Continuous,
            window: None,
            days: BTreeSet::new(),
        }
    }

    pub fn new(
        kind: ScheduleType,
        start: Option<&str>,
        end: Option<&str>,
        days: &[u32],
    ) -> Result<Self, ScheduleError> {
        let window = match (start, end) {
            (Some(start), Some(end)) => Some((parse_time(start)?, parse_time(end)?)),
            (None, None) => None,
            _ => return Err(ScheduleError::HalfWindow),
        };
        let max_day = match kind {
            ScheduleType::Weekly => 7,
            ScheduleType::Monthly => 31,
            ScheduleType::Continuous | ScheduleType::Daily => u32::MAX,
        };
        if let Some(&day) = days.iter().find(|d| **d == 0 || **d > max_day) {
            return Err(ScheduleError::BadDay { kind, day });
        }
        if matches!(kind, ScheduleType::Weekly | ScheduleType::Monthly) && days.is_empty() {
            return Err(ScheduleError::NoDays(kind));
        }
        Ok(Self {
            kind,
            window,
            days: days.iter().copied().collect(),
        })
    }

    pub fn kind(&self) -> ScheduleType {
        self.kind
    }

    pub fn is_active(&self, now: NaiveDateTime) -> bool {
        match self.kind {
            ScheduleType::Continuous => true,
            ScheduleType::Daily => self.in_window(now.time()),
            ScheduleType::Weekly => {
                self.days.contains(&now.weekday().number_from_monday())
                    && self.in_window(now.time())
            }
            ScheduleType::Monthly => self.days.contains(&now.day()) && self.in_window(now.time()),
        }
    }

    fn in_window(&self, t: NaiveTime) -> bool {
        match self.window {
            None => true,
            Some((start, end)) if start <= end => start <= t && t <= end,
            Some((start, end)) => t >= start || t <= end,
        }
    }
}

pub fn parse_time(value: &str) -> Result<NaiveTime, ScheduleError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| ScheduleError::BadTime(value.to_string()))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hh, mm, 0)
            .unwrap()
    }

    #[test]
    fn continuous_is_always_active() {
        assert!(Schedule::continuous().is_active(at(2024, 1, 1, 3, 0)));
    }

    #[test]
    fn daily_window_crossing_midnight() {
        let s = Schedule::new(ScheduleType::Daily, Some("22:00"), Some("06:00"), &[]).unwrap();
        assert!(s.is_active(at(2024, 5, 1, 23, 0)));
        assert!(s.is_active(at(2024, 5, 1, 5, 0)));
        assert!(!s.is_active(at(2024, 5, 1, 12, 0)));
    }

    #[test]
    fn daily_window_bounds_are_inclusive() {
        let s = Schedule::new(ScheduleType::Daily, Some("08:00"), Some("17:30:00"), &[]).unwrap();
        assert!(s.is_active(at(2024, 5, 1, 8, 0)));
        assert!(s.is_active(at(2024, 5, 1, 17, 30)));
        assert!(!s.is_active(at(2024, 5, 1, 17, 31)));
        assert!(!s.is_active(at(2024, 5, 1, 7, 59)));
    }

    #[test]
    fn weekly_requires_iso_weekday() {
        // 2024-05-06 is a Monday.
        let s = Schedule::new(ScheduleType::Weekly, Some("09:00"), Some("18:00"), &[1, 5]).unwrap();
        assert!(s.is_active(at(2024, 5, 6, 10, 0)));
        assert!(s.is_active(at(2024, 5, 10, 10, 0)));
        assert!(!s.is_active(at(2024, 5, 7, 10, 0)));
        assert!(!s.is_active(at(2024, 5, 6, 20, 0)));
    }

    #[test]
    fn monthly_requires_day_of_month() {
        let s = Schedule::new(ScheduleType::Monthly, None, None, &[1, 15]).unwrap();
        assert!(s.is_active(at(2024, 2, 15, 0, 0)));
        assert!(!s.is_active(at(2024, 2, 16, 0, 0)));
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert_eq!(
            Schedule::new(ScheduleType::Daily, Some("25:00"), Some("06:00"), &[]),
            Err(ScheduleError::BadTime("25:00".into()))
        );
        assert!(matches!(
            Schedule::new(ScheduleType::Weekly, None, None, &[8]),
            Err(ScheduleError::BadDay { day: 8, .. })
        ));
        assert_eq!(
            Schedule::new(ScheduleType::Monthly, None, None, &[]),
            Err(ScheduleError::NoDays(ScheduleType::Monthly))
        );
        assert_eq!(
            Schedule::new(ScheduleType::Daily, Some("08:00"), None, &[]),
            Err(ScheduleError::HalfWindow)
        );
    }
}
