//! Extraction of server-provided retry hints from failure output.
//!
//! Providers that throttle often say how long to wait (`Retry-After: 5`,
//! "retry after 2s", "retry in 1500ms"). The scheduler never waits less than
//! the largest hint found.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

/// Hints above this are treated as bogus and capped.
pub const MAX_HINT: Duration = Duration::from_secs(60 * 60);

static HINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)retry[-_ ]?(?:after|in)\s*[:=]?\s*(\d+(?:\.\d+)?)\s*(milliseconds?|ms|seconds?|secs?|s)?\b",
    )
    .unwrap_or_else(|err| panic!("retry hint regex: {err}"))
});

/// Largest retry delay mentioned in `text`, capped at [`MAX_HINT`].
///
/// A bare number is read as seconds, as in the `Retry-After` header.
pub fn parse_retry_after(text: &str) -> Option<Duration> {
    HINT_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let value: f64 = caps.get(1)?.as_str().parse().ok()?;
            let unit = caps
                .get(2)
                .map_or("s", |m| m.as_str())
                .to_ascii_lowercase();
            let secs = if unit.starts_with("ms") || unit.starts_with("milli") {
                value / 1000.0
            } else {
                value
            };
            Duration::try_from_secs_f64(secs.min(MAX_HINT.as_secs_f64())).ok()
        })
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_hint_is_capped_not_dropped() {
        assert_eq!(
            parse_retry_after("SlowDown: retry after 99999999999999999999999"),
            Some(MAX_HINT)
        );
        assert_eq!(
            parse_retry_after(&format!("Retry-After: {}", "9".repeat(400))),
            Some(MAX_HINT)
        );
    }

    #[test]
    fn header_style_seconds() {
        assert_eq!(
            parse_retry_after("HTTP 429 Too Many Requests, Retry-After: 5"),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn prose_with_units() {
        assert_eq!(
            parse_retry_after("rate limit exceeded, retry after 2s"),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            parse_retry_after("throttled: retry in 1500ms"),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            parse_retry_after("please retry after 3 seconds"),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn takes_the_largest_hint() {
        let text = "attempt 1: retry after 1s\nattempt 2: Retry-After: 4\n";
        assert_eq!(parse_retry_after(text), Some(Duration::from_secs(4)));
    }

    #[test]
    fn caps_absurd_hints() {
        assert_eq!(parse_retry_after("retry after 999999"), Some(MAX_HINT));
    }

    #[test]
    fn no_hint_in_plain_errors() {
        assert_eq!(parse_retry_after("AccessDenied: Access Denied"), None);
        assert_eq!(parse_retry_after("will retry later"), None);
    }
}
