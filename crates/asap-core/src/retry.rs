//! Backoff schedule and `Retry-After` parsing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::RetryConfig;

/// `factor ^ attempt` seconds, before jitter and capping.
pub fn base_backoff(config: &RetryConfig, attempt: u32) -> f64 {
    config.backoff_factor.powi(attempt.min(i32::MAX as u32) as i32)
}

/// Delay before retry number `attempt` (0-based).
///
/// Jitter is drawn from `[0, jitter_ratio * base)` and the sum is capped at
/// `backoff_max_secs`.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = base_backoff(config, attempt);
    let spread = config.jitter_ratio.max(0.0) * base;
    let jitter = if spread > 0.0 && spread.is_finite() {
        rand::thread_rng().gen_range(0.0..spread)
    } else {
        0.0
    };
    let delay = (base + jitter).min(config.backoff_max_secs);
    if delay.is_finite() && delay > 0.0 {
        Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// Parse a `Retry-After` header as delta-seconds or an HTTP-date.
///
/// Dates in the past yield zero and values too large for a `Duration`
/// saturate at `Duration::MAX`. Unparseable values yield `None`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(secs) = value.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX));
        }
        return None;
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Server-directed delay, bounded by `max_retry_after_secs`.
pub fn cap_retry_after(config: &RetryConfig, delay: Duration) -> Duration {
    delay.min(Duration::from_secs(config.max_retry_after_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = RetryConfig {
            jitter_ratio: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(compute_backoff(&config, 0), Duration::from_secs(1));
        assert_eq!(compute_backoff(&config, 1), Duration::from_secs(2));
        assert_eq!(compute_backoff(&config, 3), Duration::from_secs(8));
        assert_eq!(compute_backoff(&config, 10), Duration::from_secs(60));
        assert_eq!(compute_backoff(&config, 500), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let config = RetryConfig::default();
        for _ in 0..200 {
            let delay = compute_backoff(&config, 2).as_secs_f64();
            assert!((4.0..4.4).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn retry_after_formats() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_retry_after("5", now), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 1.5 ", now), Some(Duration::from_millis(1500)));
        assert_eq!(
            parse_retry_after("Wed, 01 Jan 2025 12:00:30 GMT", now),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 01 Jan 2025 11:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
        assert_eq!(parse_retry_after("-3", now), None);
        assert_eq!(parse_retry_after("1e30", now), Some(Duration::MAX));
        assert_eq!(parse_retry_after("inf", now), None);
    }

    #[test]
    fn retry_after_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(
            cap_retry_after(&config, Duration::from_secs(3600)),
            Duration::from_secs(300)
        );
        assert_eq!(
            cap_retry_after(&config, Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        let huge = parse_retry_after("1e30", Utc::now()).unwrap();
        assert_eq!(cap_retry_after(&config, huge), Duration::from_secs(300));
    }
}
