//! Weekly schedule arithmetic: day parsing, `HH:MM` parsing and next-fire computation.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Weekday};

use crate::errors::{BackupError, Result};

/// Day used when the configured value is not a recognizable weekday.
pub const FALLBACK_DAY: Weekday = Weekday::Sat;

/// Parses English or Spanish day names, case-insensitive, accents optional.
pub fn parse_day(value: &str) -> Option<Weekday> {
    let normalized: String = value
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' => 'u',
            other => other,
        })
        .collect();
    match normalized.as_str() {
        "lunes" => Some(Weekday::Mon),
        "martes" => Some(Weekday::Tue),
        "miercoles" => Some(Weekday::Wed),
        "jueves" => Some(Weekday::Thu),
        "viernes" => Some(Weekday::Fri),
        "sabado" => Some(Weekday::Sat),
        "domingo" => Some(Weekday::Sun),
        other => other.parse::<Weekday>().ok(),
    }
}

/// Like [`parse_day`], substituting [`FALLBACK_DAY`] for unknown values.
pub fn resolve_day(value: &str) -> Weekday {
    parse_day(value).unwrap_or_else(|| {
        tracing::warn!(day = value, fallback = day_name(FALLBACK_DAY), "unrecognized backup day");
        FALLBACK_DAY
    })
}

/// Lowercase English name, as stored in the configuration file.
pub fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Wall-clock time of day with minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay {
    hour: u32,
    minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 || minute > 59 {
            return Err(BackupError::Schedule(format!(
                "{hour:02}:{minute:02} is outside the 24h range"
            )));
        }
        Ok(Self { hour, minute })
    }

    /// Parses `HH:MM` (24h). A single-digit hour is accepted.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || BackupError::Schedule(format!("`{value}` is not a HH:MM time"));
        let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(invalid());
        }
        let hour = hour.parse::<u32>().map_err(|_| invalid())?;
        let minute = minute.parse::<u32>().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    fn as_naive(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for TimeOfDay {
    type Err = BackupError;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// A recurring once-a-week instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklySchedule {
    pub weekday: Weekday,
    pub time: TimeOfDay,
}

impl WeeklySchedule {
    pub fn new(weekday: Weekday, time: TimeOfDay) -> Self {
        Self { weekday, time }
    }

    /// Builds a schedule from stored strings; unknown days use [`FALLBACK_DAY`].
    pub fn from_config(day: &str, time: &str) -> Result<Self> {
        Ok(Self::new(resolve_day(day), TimeOfDay::parse(time)?))
    }

    /// First occurrence strictly after `now`, in `now`'s time zone.
    ///
    /// Ambiguous local times resolve to their earliest instant; a local time
    /// skipped by a DST jump moves to the following week.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        let tz = now.timezone();
        let today = now.date_naive();
        let current = i64::from(today.weekday().num_days_from_monday());
        let target = i64::from(self.weekday.num_days_from_monday());
        let days_ahead = (target - current).rem_euclid(7);

        for week in 0..3 {
            let date = today + Duration::days(days_ahead + week * 7);
            let naive = date.and_time(self.time.as_naive());
            if let Some(candidate) = tz.from_local_datetime(&naive).earliest() {
                if candidate > *now {
                    return candidate;
                }
            }
        }
        now.clone() + Duration::days(7)
    }

    pub fn is_due<Tz: TimeZone>(next: &DateTime<Tz>, now: &DateTime<Tz>) -> bool {
        now >= next
    }
}

impl fmt::Display for WeeklySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "every {} at {}", day_name(self.weekday), self.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().expect("valid instant")
    }

    #[test]
    fn parses_english_and_spanish_days() {
        assert_eq!(parse_day("tuesday"), Some(Weekday::Tue));
        assert_eq!(parse_day("  Monday "), Some(Weekday::Mon));
        assert_eq!(parse_day("Sábado"), Some(Weekday::Sat));
        assert_eq!(parse_day("miercoles"), Some(Weekday::Wed));
        assert_eq!(parse_day("Miércoles"), Some(Weekday::Wed));
        assert_eq!(parse_day("domingo"), Some(Weekday::Sun));
        assert_eq!(parse_day("fri"), Some(Weekday::Fri));
        assert_eq!(parse_day("someday"), None);
    }

    #[test]
    fn unknown_day_resolves_to_fallback() {
        assert_eq!(resolve_day("holiday"), FALLBACK_DAY);
        assert_eq!(day_name(resolve_day("holiday")), "saturday");
    }

    #[test]
    fn time_of_day_parsing() {
        let time = TimeOfDay::parse("09:05").expect("valid");
        assert_eq!((time.hour(), time.minute()), (9, 5));
        assert_eq!(time.to_string(), "09:05");
        assert_eq!("7:30".parse::<TimeOfDay>().expect("valid").to_string(), "07:30");

        for bad in ["24:00", "12:60", "1200", "12:5", "ab:cd", "", ":30", "123:00"] {
            assert!(TimeOfDay::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn next_fire_later_this_week() {
        // 2024-01-01 is a Monday.
        let schedule = WeeklySchedule::from_config("tuesday", "09:00").expect("schedule");
        let next = schedule.next_after(&utc(2024, 1, 1, 10, 0));
        assert_eq!(next, utc(2024, 1, 2, 9, 0));
    }

    #[test]
    fn next_fire_same_day_later_time() {
        let schedule = WeeklySchedule::from_config("monday", "10:30").expect("schedule");
        assert_eq!(
            schedule.next_after(&utc(2024, 1, 1, 10, 0)),
            utc(2024, 1, 1, 10, 30)
        );
    }

    #[test]
    fn next_fire_is_strictly_in_the_future() {
        let schedule = WeeklySchedule::from_config("monday", "10:00").expect("schedule");
        let now = utc(2024, 1, 1, 10, 0);
        let next = schedule.next_after(&now);
        assert_eq!(next, utc(2024, 1, 8, 10, 0));
        assert!(!WeeklySchedule::is_due(&next, &now));
        assert!(WeeklySchedule::is_due(&next, &next));
    }

    #[test]
    fn next_fire_is_always_within_a_week() {
        let now = utc(2024, 3, 14, 17, 45);
        for day in ["lunes", "martes", "miercoles", "jueves", "viernes", "sabado", "domingo"] {
            let schedule = WeeklySchedule::from_config(day, "17:45").expect("schedule");
            let next = schedule.next_after(&now);
            assert!(next > now);
            assert!(next - now <= Duration::days(7));
            assert_eq!(next.weekday(), schedule.weekday);
        }
    }

    #[test]
    fn invalid_time_is_a_schedule_error() {
        let err = WeeklySchedule::from_config("monday", "25:00").expect_err("invalid");
        assert!(matches!(err, BackupError::Schedule(_)));
    }
}
