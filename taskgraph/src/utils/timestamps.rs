//! Timestamp and time-offset helpers for task definitions.
//!
//! Task definitions carry absolute timestamps in the execution service's
//! format (`2024-03-01T12:00:00.000Z`) and relative offsets such as
//! `"3 days 2 hours"`.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Errors that can occur during timestamp parsing.
#[derive(Debug, Clone, Error)]
pub enum TimestampError {
    /// The timestamp string is empty.
    #[error("Empty timestamp string")]
    EmptyString,

    /// The timestamp value is invalid.
    #[error("Invalid timestamp: {0}")]
    InvalidFormat(String),

    /// The time offset string is invalid.
    #[error("Invalid time offset: {0}")]
    InvalidOffset(String),

    /// The offset does not fit in a timestamp.
    #[error("Time offset out of range: {0}")]
    OutOfRange(String),
}

fn absolute_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:\d{2})$")
            .expect("static regex is valid")
    })
}

fn offset_term_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)\s*([a-zA-Z]+)").expect("static regex is valid"))
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Returns true if the string looks like an absolute RFC 3339 timestamp.
#[must_use]
pub fn is_absolute_timestamp(value: &str) -> bool {
    absolute_pattern().is_match(value)
}

/// Parses an absolute timestamp.
///
/// # Errors
///
/// Returns `TimestampError` if the input cannot be parsed.
pub fn parse_timestamp(input: &str) -> Result<Timestamp, TimestampError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(TimestampError::EmptyString);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }

    let formats = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];
    for fmt in formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(TimestampError::InvalidFormat(trimmed.to_string()))
}

/// Formats a timestamp the way the execution service expects.
#[must_use]
pub fn format_timestamp(dt: &Timestamp) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

fn unit_seconds(unit: &str) -> Option<i64> {
    let seconds = match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 7 * 86_400,
        "mo" | "month" | "months" => 30 * 86_400,
        "y" | "yr" | "year" | "years" => 365 * 86_400,
        _ => return None,
    };
    Some(seconds)
}

/// Parses a relative offset such as `"1 day"`, `"3 days 2 hours"` or `"-90 seconds"`.
///
/// Months count as 30 days and years as 365 days.
///
/// # Errors
///
/// Returns `TimestampError::InvalidOffset` if any part of the string is not
/// a `<number> <unit>` term.
pub fn parse_time_offset(input: &str) -> Result<Duration, TimestampError> {
    let trimmed = input.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let mut total: i64 = 0;
    let mut consumed = 0;
    for caps in offset_term_pattern().captures_iter(body) {
        let whole = caps.get(0).map_or("", |m| m.as_str());
        let gap = &body[consumed..caps.get(0).map_or(consumed, |m| m.start())];
        if !gap.trim().is_empty() {
            return Err(TimestampError::InvalidOffset(input.to_string()));
        }
        consumed += gap.len() + whole.len();

        let amount: i64 = caps[1]
            .parse()
            .map_err(|_| TimestampError::InvalidOffset(input.to_string()))?;
        let unit = unit_seconds(&caps[2])
            .ok_or_else(|| TimestampError::InvalidOffset(input.to_string()))?;
        total = amount
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| TimestampError::OutOfRange(input.to_string()))?;
    }

    if consumed == 0 || !body[consumed..].trim().is_empty() {
        return Err(TimestampError::InvalidOffset(input.to_string()));
    }

    Ok(Duration::seconds(if negative { -total } else { total }))
}

/// Formats an offset as whole seconds, e.g. `"86400 seconds"`.
#[must_use]
pub fn format_time_offset(offset: Duration) -> String {
    format!("{} seconds", offset.num_seconds())
}

/// Applies a relative offset to a base time.
///
/// # Errors
///
/// Returns an error if the offset cannot be parsed or overflows.
pub fn from_now(offset: &str, now: &Timestamp) -> Result<Timestamp, TimestampError> {
    let delta = parse_time_offset(offset)?;
    now.checked_add_signed(delta)
        .ok_or_else(|| TimestampError::OutOfRange(offset.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_parse_timestamp_rfc3339() {
        let dt = parse_timestamp("2023-10-05T14:30:00.000Z").unwrap();
        assert_eq!(dt.year(), 2023);
        assert_eq!(dt.month(), 10);
        assert_eq!(dt.day(), 5);
    }

    #[test]
    fn test_parse_timestamp_empty() {
        assert!(matches!(parse_timestamp("  "), Err(TimestampError::EmptyString)));
    }

    #[test]
    fn test_format_round_trips_through_parse() {
        let dt = parse_timestamp("2023-10-05T14:30:00Z").unwrap();
        assert_eq!(format_timestamp(&dt), "2023-10-05T14:30:00.000Z");
    }

    #[test]
    fn test_is_absolute_timestamp() {
        assert!(is_absolute_timestamp("2023-10-05T14:30:00.123Z"));
        assert!(is_absolute_timestamp("2023-10-05T14:30:00+00:00"));
        assert!(!is_absolute_timestamp("1 day"));
        assert!(!is_absolute_timestamp("build-2023-10-05"));
    }

    #[test]
    fn test_parse_time_offset_compound() {
        assert_eq!(parse_time_offset("1 day").unwrap(), Duration::days(1));
        assert_eq!(
            parse_time_offset("3 days 2 hours").unwrap(),
            Duration::hours(74)
        );
        assert_eq!(parse_time_offset("-90 seconds").unwrap(), Duration::seconds(-90));
        assert_eq!(parse_time_offset("1 year").unwrap(), Duration::days(365));
    }

    #[test]
    fn test_parse_time_offset_rejects_garbage() {
        assert!(parse_time_offset("").is_err());
        assert!(parse_time_offset("soon").is_err());
        assert!(parse_time_offset("3 fortnights").is_err());
        assert!(parse_time_offset("1 day and 2 hours").is_err());
    }

    #[test]
    fn test_from_now() {
        let now = parse_timestamp("2023-10-05T00:00:00Z").unwrap();
        let later = from_now("2 days", &now).unwrap();
        assert_eq!(format_timestamp(&later), "2023-10-07T00:00:00.000Z");
    }

    #[test]
    fn test_format_time_offset() {
        assert_eq!(format_time_offset(Duration::hours(1)), "3600 seconds");
    }
}
