use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::{
    error::{RateLimitError, Result},
    utils::{window_ttl, DEFAULT_KEY_PREFIX},
};

/// Maximum accepted submissions per window when none is configured
pub const DEFAULT_MAX_SUBMISSIONS: u64 = 3;

/// Window length in seconds when none is configured
pub const DEFAULT_TIME_LIMIT_SECS: u64 = 3600;

/// Limits applied to every resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum accepted submissions per window per key
    pub max_submissions: u64,
    /// Window length in seconds; 0 means counters never expire
    pub time_limit: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_submissions: DEFAULT_MAX_SUBMISSIONS,
            time_limit: DEFAULT_TIME_LIMIT_SECS,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_submissions: u64, time_limit: u64) -> Self {
        Self {
            max_submissions,
            time_limit,
        }
    }

    /// Build a configuration from an untrusted options map.
    ///
    /// Missing or unusable values fall back to the defaults, numbers and
    /// numeric strings are truncated to integers and negatives clamp to zero.
    pub fn sanitize(raw: &Value) -> Self {
        Self {
            max_submissions: sanitize_field(raw, "max_submissions", DEFAULT_MAX_SUBMISSIONS),
            time_limit: sanitize_field(raw, "time_limit", DEFAULT_TIME_LIMIT_SECS),
        }
    }

    /// Load and sanitize limits from a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(yaml)?;
        Ok(Self::sanitize(&raw))
    }

    /// Load and sanitize limits from a YAML file
    pub fn from_yaml_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// TTL for newly created counters
    pub fn ttl(&self) -> Option<Duration> {
        window_ttl(self.time_limit)
    }

    /// The sanitized values as an options map
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "max_submissions": self.max_submissions,
            "time_limit": self.time_limit,
        })
    }
}

fn sanitize_field(raw: &Value, field: &'static str, default: u64) -> u64 {
    match raw.get(field) {
        None | Some(Value::Null) => default,
        Some(value) => parse_integer(field, value).unwrap_or_else(|e| {
            warn!(error = %e, default, "Ignoring invalid rate limit option");
            default
        }),
    }
}

/// Coerce a single option value to a non-negative integer
pub fn parse_integer(field: &'static str, value: &Value) -> Result<u64> {
    let parsed = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().map(|_| 0))
            .or_else(|| n.as_f64().map(truncate)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<i64>().ok().map(|_| 0))
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(truncate))
        }
        _ => None,
    };

    parsed.ok_or_else(|| RateLimitError::ConfigInvalid {
        field,
        value: value.to_string(),
    })
}

fn truncate(f: f64) -> u64 {
    if f <= 0.0 {
        0
    } else {
        f.trunc() as u64
    }
}

/// Which counter store the service runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

/// Counter store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Namespace prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-operation store timeout; slower calls count as unavailable
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum number of counters kept by the in-memory store
    #[serde(default = "default_local_capacity")]
    pub local_capacity: u64,

    /// Interval of the in-memory expiry sweep, 0 disables it
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            local_capacity: default_local_capacity(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_local_capacity() -> u64 {
    100_000
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    #[serde(default)]
    pub store: StoreConfig,

    /// Raw limit options, sanitized on use
    #[serde(default)]
    pub limits: Option<Value>,

    /// Bearer token required by `PUT /config`; updates are refused when unset
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            store: StoreConfig::default(),
            limits: None,
            admin_token: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from an optional file overlaid with
    /// `FORM_RATELIMIT__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("FORM_RATELIMIT").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Sanitized limits, defaults when none are configured
    pub fn rate_limits(&self) -> RateLimitConfig {
        self.limits
            .as_ref()
            .map(RateLimitConfig::sanitize)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_empty_uses_defaults() {
        assert_eq!(RateLimitConfig::sanitize(&json!({})), RateLimitConfig::new(3, 3600));
        assert_eq!(RateLimitConfig::sanitize(&Value::Null), RateLimitConfig::default());
    }

    #[test]
    fn test_sanitize_coerces_values() {
        let config = RateLimitConfig::sanitize(&json!({
            "max_submissions": "5",
            "time_limit": 120.9,
        }));
        assert_eq!(config, RateLimitConfig::new(5, 120));

        let config = RateLimitConfig::sanitize(&json!({
            "max_submissions": " 7 ",
            "time_limit": "90.5",
        }));
        assert_eq!(config, RateLimitConfig::new(7, 90));
    }

    #[test]
    fn test_sanitize_clamps_negatives() {
        let config = RateLimitConfig::sanitize(&json!({
            "max_submissions": -2,
            "time_limit": "-30",
        }));
        assert_eq!(config, RateLimitConfig::new(0, 0));
    }

    #[test]
    fn test_sanitize_invalid_falls_back() {
        let config = RateLimitConfig::sanitize(&json!({
            "max_submissions": "lots",
            "time_limit": [1, 2],
        }));
        assert_eq!(config, RateLimitConfig::default());

        let config = RateLimitConfig::sanitize(&json!({
            "max_submissions": true,
            "time_limit": null,
        }));
        assert_eq!(config, RateLimitConfig::default());
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let once = RateLimitConfig::sanitize(&json!({"max_submissions": "10", "time_limit": -1}));
        let twice = RateLimitConfig::sanitize(&once.to_value());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_parse_integer_reports_invalid() {
        let result = parse_integer("max_submissions", &json!("NaN"));
        assert!(matches!(
            result,
            Err(RateLimitError::ConfigInvalid { field: "max_submissions", .. })
        ));
    }

    #[test]
    fn test_load_limits_from_yaml() {
        let yaml = r#"
max_submissions: 10
time_limit: "600"
"#;
        let config = RateLimitConfig::from_yaml(yaml).unwrap();
        assert_eq!(config, RateLimitConfig::new(10, 600));
        assert_eq!(config.ttl(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_zero_time_limit_never_expires() {
        assert_eq!(RateLimitConfig::new(3, 0).ttl(), None);
    }

    #[test]
    fn test_service_config_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.http_addr, "0.0.0.0:8080");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(config.store.timeout(), Duration::from_secs(1));
        assert_eq!(config.rate_limits(), RateLimitConfig::default());
        assert_eq!(config.admin_token, None);
    }

    #[test]
    fn test_load_service_config_from_file() {
        let path = std::env::temp_dir().join(format!(
            "form-ratelimit-config-{}.yaml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            r#"
http_addr: "127.0.0.1:9000"
store:
  backend: redis
  redis_url: "redis://cache:6379"
  timeout_ms: 250
limits:
  max_submissions: 5
  time_limit: 60
admin_token: "s3cret"
"#,
        )
        .unwrap();

        let config = ServiceConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.http_addr, "127.0.0.1:9000");
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url, "redis://cache:6379");
        assert_eq!(config.store.timeout(), Duration::from_millis(250));
        assert_eq!(config.store.local_capacity, 100_000);
        assert_eq!(config.rate_limits(), RateLimitConfig::new(5, 60));
        assert_eq!(config.admin_token.as_deref(), Some("s3cret"));
    }
}
