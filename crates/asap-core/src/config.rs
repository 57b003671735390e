//! Runtime configuration.
//!
//! Values resolve in three layers: built-in defaults, an optional TOML file
//! (`[asap]` table) and `ASAP_*` environment variables. The binary applies
//! CLI flags on top.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{AsapError, AsapResult};

pub const DEFAULT_MAX_ENVELOPE_AGE_SECS: u64 = 5 * 60;
pub const DEFAULT_FUTURE_TOLERANCE_SECS: u64 = 30;
pub const DEFAULT_NONCE_TTL_MULTIPLIER: u32 = 2;
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_WEBHOOK_RATE_LIMIT: &str = "10/second;100/minute";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AsapConfig {
    pub replay: ReplayConfig,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub ack: AckConfig,
    pub webhook: WebhookConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplayConfig {
    pub max_envelope_age_secs: u64,
    pub future_tolerance_secs: u64,
    pub nonce_ttl_multiplier: u32,
    /// Check nonces at all. When disabled only timestamps are validated.
    pub nonce_validation: bool,
    /// Reject envelopes that carry no nonce.
    pub require_nonce: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_envelope_age_secs: DEFAULT_MAX_ENVELOPE_AGE_SECS,
            future_tolerance_secs: DEFAULT_FUTURE_TOLERANCE_SECS,
            nonce_ttl_multiplier: DEFAULT_NONCE_TTL_MULTIPLIER,
            nonce_validation: true,
            require_nonce: false,
        }
    }
}

impl ReplayConfig {
    pub fn max_envelope_age(&self) -> Duration {
        Duration::from_secs(self.max_envelope_age_secs)
    }

    pub fn future_tolerance(&self) -> Duration {
        Duration::from_secs(self.future_tolerance_secs)
    }

    /// A nonce must outlive the window in which its envelope is still accepted.
    pub fn nonce_ttl(&self) -> Duration {
        self.max_envelope_age() * self.nonce_ttl_multiplier.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub backoff_max_secs: f64,
    /// Jitter as a fraction of the exponential delay.
    pub jitter_ratio: f64,
    /// Upper bound on a server-supplied `Retry-After`.
    pub max_retry_after_secs: u64,
    pub request_timeout_secs: u64,
    pub health_ttl_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: 2.0,
            backoff_max_secs: 60.0,
            jitter_ratio: 0.1,
            max_retry_after_secs: 300,
            request_timeout_secs: 30,
            health_ttl_secs: 30,
        }
    }
}

impl RetryConfig {
    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs_f64(self.backoff_max_secs.max(0.0))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
        }
    }
}

impl CircuitConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AckConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_ACK_TIMEOUT_SECS,
            max_retries: 3,
        }
    }
}

impl AckConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebhookConfig {
    pub max_attempts: u32,
    pub backoff_ladder_secs: Vec<u64>,
    /// Development only: accept `http://` callback URLs.
    pub allow_insecure_http: bool,
    /// Hosts exempt from the private-address check.
    pub allowed_hosts: Vec<String>,
    #[serde(with = "rate_limits_serde")]
    pub rate_limit: RateLimits,
    pub request_timeout_secs: u64,
    pub queue_capacity: usize,
    pub secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ladder_secs: vec![1, 2, 4, 8, 16],
            allow_insecure_http: false,
            allowed_hosts: Vec::new(),
            rate_limit: RateLimits::parse_str(DEFAULT_WEBHOOK_RATE_LIMIT)
                .unwrap_or_else(|| RateLimits(vec![RateLimit::per_second(10)])),
            request_timeout_secs: 10,
            queue_capacity: 1024,
            secret: None,
        }
    }
}

impl WebhookConfig {
    /// Delay before attempt `attempt + 1`; the last rung repeats.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let index = (attempt.saturating_sub(1) as usize)
            .min(self.backoff_ladder_secs.len().saturating_sub(1));
        Duration::from_secs(self.backoff_ladder_secs.get(index).copied().unwrap_or(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub identity: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            identity: "urn:asap:agent:asapd".to_string(),
        }
    }
}

#[derive(Deserialize, Default)]
struct RootConfig {
    #[serde(default)]
    asap: Option<AsapConfig>,
}

impl AsapConfig {
    /// Defaults, then the file (if it exists), then the environment.
    pub fn load(path: Option<&Path>) -> AsapResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path).map_err(|err| {
                    AsapError::Config(format!("failed to read {}: {err}", path.display()))
                })?;
                Self::from_toml_str(&contents)?
            }
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> AsapResult<Self> {
        let parsed: RootConfig = toml::from_str(contents)?;
        Ok(parsed.asap.unwrap_or_default())
    }

    /// Apply `ASAP_*` overrides through `lookup` (normally the process env).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> AsapResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> AsapResult<Option<T>> {
            match raw {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| AsapError::Config(format!("invalid value '{value}' for {key}"))),
            }
        }

        macro_rules! set {
            ($key:literal, $field:expr) => {
                if let Some(value) = parsed($key, lookup($key))? {
                    $field = value;
                }
            };
        }

        set!("ASAP_MAX_ENVELOPE_AGE_SECS", self.replay.max_envelope_age_secs);
        set!("ASAP_FUTURE_TOLERANCE_SECS", self.replay.future_tolerance_secs);
        set!("ASAP_NONCE_TTL_MULTIPLIER", self.replay.nonce_ttl_multiplier);
        set!("ASAP_NONCE_VALIDATION", self.replay.nonce_validation);
        set!("ASAP_REQUIRE_NONCE", self.replay.require_nonce);
        set!("ASAP_MAX_RETRIES", self.retry.max_retries);
        set!("ASAP_BACKOFF_FACTOR", self.retry.backoff_factor);
        set!("ASAP_BACKOFF_MAX_SECS", self.retry.backoff_max_secs);
        set!("ASAP_CIRCUIT_FAILURE_THRESHOLD", self.circuit.failure_threshold);
        set!("ASAP_CIRCUIT_COOLDOWN_SECS", self.circuit.cooldown_secs);
        set!("ASAP_ACK_TIMEOUT_SECS", self.ack.timeout_secs);
        set!("ASAP_MAX_ACK_RETRIES", self.ack.max_retries);
        set!("ASAP_WEBHOOK_MAX_ATTEMPTS", self.webhook.max_attempts);
        set!("ASAP_WEBHOOK_ALLOW_HTTP", self.webhook.allow_insecure_http);
        set!("ASAP_HOST", self.server.host);
        set!("ASAP_PORT", self.server.port);

        if let Some(raw) = lookup("ASAP_WEBHOOK_BACKOFF_LADDER") {
            self.webhook.backoff_ladder_secs = raw
                .split(',')
                .map(|step| step.trim().parse::<u64>())
                .collect::<Result<_, _>>()
                .map_err(|_| {
                    AsapError::Config(format!("invalid ASAP_WEBHOOK_BACKOFF_LADDER '{raw}'"))
                })?;
        }
        if let Some(raw) = lookup("ASAP_WEBHOOK_RATE_LIMIT") {
            self.webhook.rate_limit = RateLimits::parse_str(&raw).ok_or_else(|| {
                AsapError::Config(format!("invalid ASAP_WEBHOOK_RATE_LIMIT '{raw}'"))
            })?;
        }
        if let Some(secret) = lookup("ASAP_WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }
        Ok(())
    }

    pub fn validate(&self) -> AsapResult<()> {
        if self.retry.backoff_factor < 1.0 {
            return Err(AsapError::Config(
                "retry.backoff_factor must be >= 1.0".into(),
            ));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(AsapError::Config(
                "circuit.failure_threshold must be at least 1".into(),
            ));
        }
        if self.webhook.max_attempts == 0 {
            return Err(AsapError::Config(
                "webhook.max_attempts must be at least 1".into(),
            ));
        }
        if self.webhook.backoff_ladder_secs.is_empty() {
            return Err(AsapError::Config(
                "webhook.backoff_ladder_secs must not be empty".into(),
            ));
        }
        if self.webhook.secret.as_deref().is_some_and(str::is_empty) {
            return Err(AsapError::Config("webhook.secret must not be empty".into()));
        }
        if self.ack.timeout_secs == 0 {
            return Err(AsapError::Config("ack.timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_events: u32,
    pub per_seconds: u64,
}

impl RateLimit {
    pub const fn new(max_events: u32, per_seconds: u64) -> Self {
        Self {
            max_events,
            per_seconds,
        }
    }

    pub const fn per_second(max_events: u32) -> Self {
        Self::new(max_events, 1)
    }

    pub const fn per_minute(max_events: u32) -> Self {
        Self::new(max_events, 60)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.per_seconds)
    }
}

/// All windows must admit an event (burst per second plus sustained per minute).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RateLimits(pub Vec<RateLimit>);

impl RateLimits {
    /// Parse `"10/second;100/minute"`, `"5 per min"` or `"3/10s"`.
    pub fn parse_str(input: &str) -> Option<Self> {
        rate_limits_serde::parse_rate_limits(input).ok()
    }

    pub fn limits(&self) -> &[RateLimit] {
        &self.0
    }
}

mod rate_limits_serde {
    use super::{RateLimit, RateLimits};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &RateLimits, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let parts: Vec<String> = value
            .0
            .iter()
            .map(|limit| {
                let window = match limit.per_seconds {
                    1 => "second".to_string(),
                    60 => "minute".to_string(),
                    3600 => "hour".to_string(),
                    other => format!("{}s", other),
                };
                format!("{}/{}", limit.max_events, window)
            })
            .collect();
        serializer.serialize_str(&parts.join(";"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<RateLimits, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        parse_value(&raw).map_err(D::Error::custom)
    }

    fn parse_value(value: &serde_json::Value) -> Result<RateLimits, String> {
        match value {
            serde_json::Value::String(s) => parse_rate_limits(s),
            serde_json::Value::Array(items) => {
                let mut limits = Vec::new();
                for item in items {
                    limits.extend(parse_value(item)?.0);
                }
                Ok(RateLimits(limits))
            }
            serde_json::Value::Object(map) => {
                let max_events = map
                    .get("count")
                    .or_else(|| map.get("max"))
                    .or_else(|| map.get("max_events"))
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| "missing count field".to_string())?;
                let per_seconds = map
                    .get("per_seconds")
                    .or_else(|| map.get("window_secs"))
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| "missing per_seconds field".to_string())?;
                Ok(RateLimits(vec![RateLimit::new(max_events as u32, per_seconds)]))
            }
            serde_json::Value::Number(num) => num
                .as_u64()
                .map(|count| RateLimits(vec![RateLimit::per_minute(count as u32)]))
                .ok_or_else(|| "invalid numeric rate limit".to_string()),
            _ => Err("unsupported rate limit format".to_string()),
        }
    }

    pub(super) fn parse_rate_limits(raw: &str) -> Result<RateLimits, String> {
        let limits = raw
            .split([';', ','])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(parse_rate_limit_str)
            .collect::<Result<Vec<_>, _>>()?;
        if limits.is_empty() {
            return Err(format!("empty rate limit '{}'", raw));
        }
        Ok(RateLimits(limits))
    }

    fn parse_rate_limit_str(raw: &str) -> Result<RateLimit, String> {
        let normalized = raw.trim().to_lowercase();

        let (count_str, period_str) = if let Some((left, right)) = normalized.split_once('/') {
            (left.trim(), right.trim())
        } else if let Some(idx) = normalized.find("per") {
            let (left, right) = normalized.split_at(idx);
            (left.trim(), right.trim_start_matches("per").trim())
        } else {
            return Err(format!("invalid rate limit '{}'", raw));
        };

        let count: u32 = count_str
            .parse()
            .map_err(|_| format!("invalid rate limit count '{}'", count_str))?;
        if count == 0 {
            return Err(format!("rate limit count must be positive in '{}'", raw));
        }

        let per_seconds = match period_str.trim_end_matches('s').trim() {
            "sec" | "second" => 1,
            "min" | "minute" => 60,
            "hour" | "hr" => 3600,
            "day" => 86_400,
            _ => parse_free_form_window(period_str)
                .ok_or_else(|| format!("invalid rate limit window '{}'", period_str))?,
        };

        Ok(RateLimit::new(count, per_seconds))
    }

    fn parse_free_form_window(raw: &str) -> Option<u64> {
        let trimmed = raw.trim();
        let (num_part, multiplier) = if let Some(stripped) = trimmed.strip_suffix('h') {
            (stripped, 3600)
        } else if let Some(stripped) = trimmed.strip_suffix('m') {
            (stripped, 60)
        } else if let Some(stripped) = trimmed.strip_suffix('s') {
            (stripped, 1)
        } else {
            (trimmed, 1)
        };

        let value = num_part.trim().parse::<u64>().ok()?;
        let seconds = value.saturating_mul(multiplier);
        if seconds == 0 {
            None
        } else {
            Some(seconds)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = AsapConfig::default();
        assert_eq!(config.replay.max_envelope_age(), Duration::from_secs(300));
        assert_eq!(config.replay.future_tolerance(), Duration::from_secs(30));
        assert_eq!(config.replay.nonce_ttl(), Duration::from_secs(600));
        assert_eq!(config.ack.timeout(), Duration::from_secs(30));
        assert_eq!(config.webhook.backoff_ladder_secs, vec![1, 2, 4, 8, 16]);
        assert_eq!(
            config.webhook.rate_limit,
            RateLimits(vec![RateLimit::per_second(10), RateLimit::per_minute(100)])
        );
        config.validate().expect("defaults validate");
    }

    #[test]
    fn rate_limit_strings() {
        assert_eq!(
            RateLimits::parse_str("5 per min"),
            Some(RateLimits(vec![RateLimit::per_minute(5)]))
        );
        assert_eq!(
            RateLimits::parse_str("3/10s, 50/hour"),
            Some(RateLimits(vec![RateLimit::new(3, 10), RateLimit::new(50, 3600)]))
        );
        assert_eq!(RateLimits::parse_str("fast"), None);
        assert_eq!(RateLimits::parse_str("0/second"), None);
        assert_eq!(RateLimits::parse_str(""), None);
    }

    #[test]
    fn toml_file_then_env_overrides() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("asap.toml");
        std::fs::write(
            &path,
            r#"
[asap.replay]
max_envelope_age_secs = 120
require_nonce = true

[asap.webhook]
rate_limit = "2/second;20/minute"
backoff_ladder_secs = [1, 1, 2]

[asap.server]
port = 9100
"#,
        )
        .expect("write config");

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut config = AsapConfig::from_toml_str(&contents).expect("parse config");
        assert_eq!(config.replay.max_envelope_age_secs, 120);
        assert!(config.replay.require_nonce);
        assert_eq!(config.replay.future_tolerance_secs, 30);
        assert_eq!(config.webhook.backoff_ladder_secs, vec![1, 1, 2]);
        assert_eq!(config.server.port, 9100);
        assert_eq!(
            config.webhook.rate_limit,
            RateLimits(vec![RateLimit::per_second(2), RateLimit::per_minute(20)])
        );

        let env: HashMap<&str, &str> = [
            ("ASAP_MAX_RETRIES", "7"),
            ("ASAP_ACK_TIMEOUT_SECS", "5"),
            ("ASAP_WEBHOOK_BACKOFF_LADDER", "3, 6"),
            ("ASAP_WEBHOOK_RATE_LIMIT", "1/second"),
        ]
        .into_iter()
        .collect();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .expect("apply overrides");
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.ack.timeout_secs, 5);
        assert_eq!(config.webhook.backoff_ladder_secs, vec![3, 6]);
        assert_eq!(
            config.webhook.rate_limit,
            RateLimits(vec![RateLimit::per_second(1)])
        );
    }

    #[test]
    fn bad_env_value_is_a_config_error() {
        let mut config = AsapConfig::default();
        let err = config
            .apply_overrides(|key| (key == "ASAP_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, AsapError::Config(msg) if msg.contains("ASAP_PORT")));
    }

    #[test]
    fn ladder_repeats_last_rung() {
        let config = WebhookConfig::default();
        assert_eq!(config.delay_after(1), Duration::from_secs(1));
        assert_eq!(config.delay_after(3), Duration::from_secs(4));
        assert_eq!(config.delay_after(5), Duration::from_secs(16));
        assert_eq!(config.delay_after(9), Duration::from_secs(16));
    }

    #[test]
    fn validation_rejects_zero_threshold() {
        let mut config = AsapConfig::default();
        config.circuit.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_empty_webhook_secret() {
        let mut config = AsapConfig::default();
        config.webhook.secret = Some(String::new());
        assert!(config.validate().is_err());
        config.webhook.secret = Some("s3cret".into());
        assert!(config.validate().is_ok());
    }
}
