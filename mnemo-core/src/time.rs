//! Timestamp formatting and since/until parsing.
//!
//! All stored timestamps are UTC RFC 3339 with microsecond precision,
//! produced by [`format_ts`] so that string comparison orders correctly.

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};

#[derive(Debug, thiserror::Error)]
#[error("invalid date or duration: {0:?} (expected YYYY-MM-DD or ISO 8601 duration like P7D, PT1H)")]
pub struct WhenParseError(pub String);

pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Canonical storage format: RFC 3339, UTC, microseconds.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_ts() -> String {
    format_ts(utc_now())
}

/// Parse a stored timestamp, tolerating legacy suffix variants.
pub fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    // Legacy: no timezone suffix, assume UTC
    let patched = format!("{value}Z");
    DateTime::parse_from_rfc3339(&patched)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Date projection (YYYY-MM-DD) for `_updated_date` / `_accessed_date`.
pub fn date_of(ts: &str) -> String {
    ts.chars().take(10).collect()
}

/// Parse a `since`/`until` parameter: either a date (`YYYY-MM-DD`) or an
/// ISO 8601 duration token (`P7D`, `P1W`, `PT1H`, `P1DT12H`) interpreted
/// as "now minus duration". Returns the cutoff timestamp.
pub fn parse_when(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, WhenParseError> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| WhenParseError(value.into()))?;
        return Ok(DateTime::from_naive_utc_and_offset(midnight, Utc));
    }
    let duration = parse_duration(value).ok_or_else(|| WhenParseError(value.into()))?;
    Ok(now - duration)
}

/// Subset of ISO 8601 durations: weeks, days, hours, minutes, seconds.
fn parse_duration(token: &str) -> Option<Duration> {
    let rest = token.strip_prefix(['P', 'p'])?;
    let (date_part, time_part) = match rest.split_once(['T', 't']) {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };

    let mut total = Duration::zero();
    let mut any = false;

    let mut number = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else {
            let n: i64 = number.parse().ok()?;
            number.clear();
            total = total
                + match c.to_ascii_uppercase() {
                    'W' => Duration::weeks(n),
                    'D' => Duration::days(n),
                    _ => return None,
                };
            any = true;
        }
    }
    if !number.is_empty() {
        return None;
    }

    if let Some(time_part) = time_part {
        for c in time_part.chars() {
            if c.is_ascii_digit() {
                number.push(c);
            } else {
                let n: i64 = number.parse().ok()?;
                number.clear();
                total = total
                    + match c.to_ascii_uppercase() {
                        'H' => Duration::hours(n),
                        'M' => Duration::minutes(n),
                        'S' => Duration::seconds(n),
                        _ => return None,
                    };
                any = true;
            }
        }
        if !number.is_empty() {
            return None;
        }
    }

    any.then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn format_round_trips() {
        let now = utc_now();
        let s = format_ts(now);
        let parsed = parse_ts(&s).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn parse_when_accepts_dates_and_durations() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        let date = parse_when("2025-06-01", now).unwrap();
        assert_eq!(date, Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());

        assert_eq!(parse_when("P7D", now).unwrap(), now - Duration::days(7));
        assert_eq!(parse_when("P1W", now).unwrap(), now - Duration::weeks(1));
        assert_eq!(parse_when("PT1H", now).unwrap(), now - Duration::hours(1));
        assert_eq!(
            parse_when("P1DT12H", now).unwrap(),
            now - Duration::days(1) - Duration::hours(12)
        );
    }

    #[test]
    fn parse_when_rejects_garbage() {
        let now = utc_now();
        assert!(parse_when("tomorrow", now).is_err());
        assert!(parse_when("P", now).is_err());
        assert!(parse_when("P12", now).is_err());
    }
}
