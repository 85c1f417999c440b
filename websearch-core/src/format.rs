//! Formatting helpers shared by front-ends.

use chrono::{DateTime, Local, TimeZone, Utc};

/// Format an epoch-millis timestamp as relative time (e.g., "2m ago").
pub fn format_relative_time(epoch_ms: i64) -> String {
    let Some(ts) = Utc.timestamp_millis_opt(epoch_ms).single() else {
        return "unknown time".to_string();
    };
    format_relative_to(ts, Utc::now())
}

fn format_relative_to(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let duration = now.signed_duration_since(ts);

    if duration.num_seconds() < 0 {
        "just now".to_string()
    } else if duration.num_seconds() < 60 {
        format!("{}s ago", duration.num_seconds())
    } else if duration.num_minutes() < 60 {
        format!("{}m ago", duration.num_minutes())
    } else if duration.num_hours() < 24 {
        format!("{}h ago", duration.num_hours())
    } else if duration.num_days() < 7 {
        format!("{}d ago", duration.num_days())
    } else {
        ts.format("%b %d").to_string()
    }
}

/// Format an epoch-millis timestamp as local wall-clock time (`HH:MM:SS`).
pub fn format_clock_time(epoch_ms: i64) -> String {
    match Local.timestamp_millis_opt(epoch_ms).single() {
        Some(ts) => ts.format("%H:%M:%S").to_string(),
        None => "Invalid time".to_string(),
    }
}

/// Truncate to at most `max_chars` characters, ending in "..." when cut.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Duration between two epoch-millis timestamps, e.g. "1m 05s".
pub fn format_elapsed(start_ms: i64, end_ms: i64) -> String {
    let secs = (end_ms - start_ms).max(0) / 1000;
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_relative_time_buckets() {
        let now = Utc::now();
        assert_eq!(format_relative_to(now + Duration::seconds(5), now), "just now");
        assert_eq!(format_relative_to(now - Duration::seconds(42), now), "42s ago");
        assert_eq!(format_relative_to(now - Duration::minutes(3), now), "3m ago");
        assert_eq!(format_relative_to(now - Duration::hours(5), now), "5h ago");
        assert_eq!(format_relative_to(now - Duration::days(2), now), "2d ago");
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("a long search query", 10), "a long ...");
        assert_eq!(truncate_text("héllo wörld", 8), "héllo...");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0, 9_500), "9s");
        assert_eq!(format_elapsed(0, 65_000), "1m 05s");
        assert_eq!(format_elapsed(0, 3_720_000), "1h 02m");
        assert_eq!(format_elapsed(10, 0), "0s");
    }
}
