//! Timestamp and date parsing.
//!
//! A single ordered pattern list backs both the type inferencer's
//! classification pass and the row builder's coercion pass, so "does this
//! string look like an instant" and "parse this string as an instant" never
//! drift apart.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::ParseError;

/// Patterns with a time-of-day component, tried in order; the first match
/// decides. RFC 3339 is tried via `DateTime::parse_from_rfc3339` first since
/// `chrono::format` strptime specifiers can't express the optional fractional
/// seconds and the `Z`/`±HH:MM` suffix in one pattern.
const INSTANT_STRPTIME_PATTERNS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.3f%:z",
];

const DATE_PATTERNS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%d.%m.%Y"];

/// Seconds-vs-milliseconds boundary for numeric timestamps (spec §4.3 / §8).
const SECONDS_MS_BOUNDARY: f64 = 1e11;

pub fn looks_like_instant(s: &str) -> bool {
    parse_instant(s).is_ok()
}

pub fn looks_like_date(s: &str) -> bool {
    parse_date(s).is_ok()
}

pub fn parse_instant(s: &str) -> Result<DateTime<Utc>, ParseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    for pattern in INSTANT_STRPTIME_PATTERNS {
        if let Ok(dt) = DateTime::parse_from_str(s, pattern) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, pattern) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(ParseError::NotAnInstant {
        value: s.to_string(),
    })
}

pub fn parse_date(s: &str) -> Result<NaiveDate, ParseError> {
    for pattern in DATE_PATTERNS {
        if let Ok(date) = NaiveDate::parse_from_str(s, pattern) {
            return Ok(date);
        }
    }

    Err(ParseError::NotADate {
        value: s.to_string(),
    })
}

/// Numeric epoch value to instant, disambiguating seconds vs. milliseconds
/// by magnitude (spec §4.3 / §8 boundary: `>= 1e11` is milliseconds).
pub fn numeric_to_instant(n: f64) -> DateTime<Utc> {
    if n.abs() < SECONDS_MS_BOUNDARY {
        Utc.timestamp_opt(n as i64, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
    } else {
        Utc.timestamp_millis_opt(n as i64)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
    }
}
