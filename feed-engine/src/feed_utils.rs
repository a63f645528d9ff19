/// Feed-specific utility functions for the engine

/// URL utilities for subscriptions
pub mod url {
    use url::Url;

    /// Host portion of a URL, the unit of rate limiting.
    pub fn origin(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        let host = url.host_str()?.to_ascii_lowercase();
        Some(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        })
    }

    /// Subscriptions accept http(s) URLs with a host.
    pub fn is_valid_feed_url(url_str: &str) -> bool {
        match Url::parse(url_str) {
            Ok(url) => {
                matches!(url.scheme(), "http" | "https")
                    && url.host_str().is_some_and(|h| !h.is_empty())
            }
            Err(_) => false,
        }
    }
}

/// Time utilities: multi-format timestamp parsing and relative formatting
pub mod time {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
    use once_cell::sync::Lazy;
    use regex::Regex;
    use serde_json::Value;

    static MS_DATE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^/Date\((-?\d+)([+-]\d{4})?\)/$").expect("valid /Date()/ pattern")
    });

    const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    /// Parses the vendor JSON date encoding `/Date(1690000000000-0700)/`.
    /// The offset is display-only; the milliseconds are the instant.
    pub fn parse_ms_json_date(s: &str) -> Option<DateTime<Utc>> {
        let caps = MS_DATE.captures(s.trim())?;
        let millis: i64 = caps.get(1)?.as_str().parse().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
        if !secs.is_finite() {
            return None;
        }
        Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
    }

    /// Parses a timestamp string: `/Date(ms)/`, ISO-8601 / RFC 3339,
    /// RFC 2822, naive date-times (UTC assumed), bare dates, or epoch seconds.
    pub fn parse_instant_str(s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if s.starts_with("/Date(") {
            return parse_ms_json_date(s);
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
            return Some(dt.with_timezone(&Utc));
        }
        for fmt in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                return Some(Utc.from_utc_datetime(&naive));
            }
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
        if s.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
            return s.parse::<f64>().ok().and_then(from_epoch_seconds);
        }
        None
    }

    /// Numbers are epoch seconds; strings go through [`parse_instant_str`].
    pub fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
        match value {
            Value::Number(n) => n.as_f64().and_then(from_epoch_seconds),
            Value::String(s) => parse_instant_str(s),
            _ => None,
        }
    }

    /// Relative age such as `now`, `5m ago`, `2h 30m ago`, `3d ago`.
    pub fn format_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
        let minutes = now.signed_duration_since(then).num_minutes();

        if minutes < 1 {
            "now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h {}m ago", minutes / 60, minutes % 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }
}

/// Text cleanup for feed bodies
pub mod text {
    use once_cell::sync::Lazy;
    use regex::Regex;

    static RE_BR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid regex"));
    static RE_P_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</p>").expect("valid regex"));
    static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").expect("valid regex"));
    static RE_BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n\s*\n+").expect("valid regex"));

    /// Turns an HTML fragment into plain text, keeping paragraph and line
    /// breaks and collapsing whitespace within each line.
    pub fn html_to_text(html: &str) -> String {
        if html.is_empty() {
            return String::new();
        }
        let out = html_escape::decode_html_entities(html).to_string();
        let out = RE_BR.replace_all(&out, "\n");
        let out = RE_P_CLOSE.replace_all(&out, "\n\n");
        let out = RE_TAGS.replace_all(&out, "");
        let out = RE_BLANK_RUNS.replace_all(&out, "\n\n");

        out.split('\n')
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}
