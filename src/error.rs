use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur in the rate limiter
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid configuration value for `{field}`: {value}")]
    ConfigInvalid { field: &'static str, value: String },

    #[error("Caller identity could not be resolved")]
    IdentityUnresolved,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RateLimitError {
    /// Whether the error means the counter store could not answer.
    ///
    /// The limiter fails open on these instead of rejecting the caller.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, RateLimitError::Redis(_) | RateLimitError::StoreUnavailable(_))
    }
}

impl From<config::ConfigError> for RateLimitError {
    fn from(e: config::ConfigError) -> Self {
        RateLimitError::Config(e.to_string())
    }
}
