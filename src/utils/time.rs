//! Date and timestamp conversions shared by the store and the jobs.
//!
//! Timestamps are persisted as fixed-width UTC text so that string comparison
//! in SQL is chronological and the first ten characters are the day.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::{AppError, Result};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Today's date in UTC.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Format a timestamp for storage.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| AppError::validation(format!("invalid timestamp '{s}': {e}")))
}

/// Stored timestamp of midnight UTC at the start of `date`.
pub fn day_start(date: NaiveDate) -> String {
    format_timestamp(&date.and_time(chrono::NaiveTime::MIN).and_utc())
}

/// Format a date for storage.
pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parse a stored date.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|e| AppError::validation(format!("invalid date '{s}': {e}")))
}

/// Compact date used in archive file names.
pub fn compact_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_round_trip_keeps_microseconds() {
        let ts = Utc.with_ymd_and_hms(2020, 1, 1, 15, 30, 35).unwrap()
            + chrono::Duration::microseconds(123_456);
        let stored = format_timestamp(&ts);
        assert_eq!(stored, "2020-01-01 15:30:35.123456");
        assert_eq!(parse_timestamp(&stored).unwrap(), ts);
    }

    #[test]
    fn test_day_start_sorts_before_same_day_events() {
        let date = NaiveDate::from_ymd_opt(2020, 9, 10).unwrap();
        assert_eq!(day_start(date), "2020-09-10 00:00:00.000000");
        assert!(day_start(date).as_str() < "2020-09-10 12:09:14.000000");
    }

    #[test]
    fn test_compact_date() {
        let date = NaiveDate::from_ymd_opt(2020, 1, 5).unwrap();
        assert_eq!(compact_date(date), "20200105");
        assert_eq!(parse_date(&format_date(date)).unwrap(), date);
    }
}
