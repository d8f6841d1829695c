//! Parsing of operator-supplied publish times
//!
//! Accepted forms, tried in order:
//! - `now`
//! - Unix timestamps (`1767225600`)
//! - RFC 3339 (`2026-01-01T09:00:00Z`)
//! - Relative durations (`30m`, `2h`, `1 day`)
//! - Natural language (`tomorrow`, `next monday 10am`)

use chrono::{DateTime, Duration, Utc};

use crate::error::{CastlineError, Result};

/// Resolve `input` relative to `now`.
///
/// Does not check that the result lies in the future; the store does that
/// when the time is written.
pub fn parse_schedule(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CastlineError::InvalidInput(
            "Schedule time cannot be empty".to_string(),
        ));
    }

    if input.eq_ignore_ascii_case("now") {
        return Ok(now);
    }

    if let Ok(secs) = input.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0).ok_or_else(|| {
            CastlineError::InvalidInput(format!("Timestamp out of range: {}", secs))
        });
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Some(duration) = parse_duration(input) {
        return now.checked_add_signed(duration).ok_or_else(|| {
            CastlineError::InvalidInput(format!("Duration out of range: {}", input))
        });
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).map_err(|e| {
        CastlineError::InvalidInput(format!("Could not parse schedule time '{}': {}", input, e))
    })
}

fn parse_duration(input: &str) -> Option<Duration> {
    let std_duration = humantime::parse_duration(input).ok()?;
    let seconds = i64::try_from(std_duration.as_secs()).ok()?;
    Duration::try_seconds(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_225_600, 0).unwrap() // 2026-01-01T00:00:00Z
    }

    #[test]
    fn test_now_keyword() {
        assert_eq!(parse_schedule("NOW", fixed_now()).unwrap(), fixed_now());
    }

    #[test]
    fn test_relative_durations() {
        let now = fixed_now();
        assert_eq!(parse_schedule("30m", now).unwrap(), now + Duration::minutes(30));
        assert_eq!(parse_schedule("2h", now).unwrap(), now + Duration::hours(2));
        assert_eq!(parse_schedule("1 day", now).unwrap(), now + Duration::days(1));
    }

    #[test]
    fn test_unix_timestamp() {
        let parsed = parse_schedule("1767229200", fixed_now()).unwrap();
        assert_eq!(parsed.timestamp(), 1_767_229_200);
    }

    #[test]
    fn test_rfc3339_with_offset() {
        let parsed = parse_schedule("2026-01-01T10:00:00+01:00", fixed_now()).unwrap();
        assert_eq!(parsed.timestamp(), 1_767_225_600 + 9 * 3600);
    }

    #[test]
    fn test_natural_language_tomorrow() {
        let now = fixed_now();
        let parsed = parse_schedule("tomorrow", now).unwrap();
        let hours = (parsed - now).num_hours();
        assert!((0..=48).contains(&hours), "Expected about a day, got {}h", hours);
        assert!(parsed > now);
    }

    #[test]
    fn test_rejects_empty_and_garbage() {
        assert!(matches!(
            parse_schedule("   ", fixed_now()),
            Err(CastlineError::InvalidInput(_))
        ));
        let err = parse_schedule("when pigs fly", fixed_now()).unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("when pigs fly"));
    }
}
