use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::errors::{QueueError, Result};

/// Current wall-clock time in epoch seconds
pub fn now_secs() -> Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| QueueError::SystemTimeError(e.to_string()))?;
    Ok(elapsed.as_secs() as i64)
}

/// Parses a date/time string into epoch seconds.
///
/// Accepts RFC 3339 (with `Z` or an explicit offset), or a naive
/// `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD`, which are read as UTC.
pub fn parse_timestamp(text: &str) -> Option<i64> {
    let text = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp());
    }

    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc().timestamp());
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp())
}

/// Identity recorded in `claimed_by`: `{hostname}-{pid}`
pub fn worker_identity() -> String {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());

    format!("{}-{}", host, std::process::id())
}

/// Cuts a string down to at most `max` bytes without splitting a character
pub fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }

    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rfc3339() {
        assert_eq!(parse_timestamp("1970-01-01T00:01:40Z"), Some(100));
        assert_eq!(parse_timestamp("1970-01-01T01:00:00+01:00"), Some(0));
    }

    #[test]
    fn test_parse_naive_formats_as_utc() {
        assert_eq!(parse_timestamp("2024-01-01 00:00:00"), Some(1_704_067_200));
        assert_eq!(parse_timestamp("2024-01-01T00:00:00"), Some(1_704_067_200));
        assert_eq!(parse_timestamp("2024-01-01"), Some(1_704_067_200));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_timestamp("tomorrow"), None);
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("1700000000"), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // 'é' is two bytes
        assert_eq!(truncate("héllo", 2), "h");
    }

    #[test]
    fn test_worker_identity_contains_pid() {
        let id = worker_identity();
        assert!(id.ends_with(&format!("-{}", std::process::id())));
    }
}
