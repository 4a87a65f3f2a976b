use async_trait::async_trait;
use redis::{aio::ConnectionManager, RedisResult, Script};
use std::{future::Future, time::Duration};
use tracing::{info, warn};

use crate::{
    cache::{CounterStore, Increment},
    error::{RateLimitError, Result},
};

/// Creates the counter at 1 with an expiry when absent, whatever the maximum,
/// increments it while below the maximum, and reports saturation otherwise. INCR keeps the TTL
/// set at creation, so the window never moves.
///
/// Returns `{count, status}` with status 0 = incremented, 1 = created,
/// 2 = saturated.
const INCREMENT_IF_BELOW: &str = r#"
local max = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local current = redis.call('GET', KEYS[1])
if not current then
  if ttl > 0 then
    redis.call('SET', KEYS[1], 1, 'EX', ttl)
  else
    redis.call('SET', KEYS[1], 1)
  end
  return {1, 1}
end
current = tonumber(current)
if current < max then
  return {redis.call('INCR', KEYS[1]), 0}
end
return {current, 2}
"#;

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
        }
    }
}

/// Counter store on a shared Redis instance
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    config: RedisConfig,
    increment_script: Script,
}

impl RedisClient {
    /// Create a new Redis client
    pub async fn new(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::Redis(e)
        })?;

        let connection =
            match tokio::time::timeout(config.connection_timeout, client.get_connection_manager())
                .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!("Failed to create connection manager: {}", e);
                    return Err(RateLimitError::Redis(e));
                }
                Err(_) => {
                    warn!(
                        "Timeout while creating connection manager ({}s)",
                        config.connection_timeout.as_secs()
                    );
                    return Err(RateLimitError::StoreUnavailable(
                        "Timeout while creating Redis connection manager".to_string(),
                    ));
                }
            };

        let redis = Self {
            connection,
            config,
            increment_script: Script::new(INCREMENT_IF_BELOW),
        };
        redis.health_check().await?;

        info!("Redis client initialized successfully");
        Ok(redis)
    }

    /// Run a command under the configured command timeout
    async fn timed<T>(
        &self,
        operation: &'static str,
        command: impl Future<Output = RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.command_timeout, command).await {
            Ok(result) => result.map_err(RateLimitError::Redis),
            Err(_) => Err(RateLimitError::StoreUnavailable(format!(
                "Redis {} timed out after {}ms",
                operation,
                self.config.command_timeout.as_millis()
            ))),
        }
    }
}

fn ttl_seconds(ttl: Option<Duration>) -> u64 {
    // Redis rejects EX 0, so sub-second windows round up
    ttl.map(|ttl| ttl.as_secs().max(1)).unwrap_or(0)
}

fn decode_increment(count: u64, status: u8) -> Result<Increment> {
    match status {
        0 => Ok(Increment::Incremented(count)),
        1 => Ok(Increment::Created),
        2 => Ok(Increment::Saturated(count)),
        other => Err(RateLimitError::Redis(redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "Unexpected status from increment script",
            other.to_string(),
        )))),
    }
}

#[async_trait]
impl CounterStore for RedisClient {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.connection.clone();
        self.timed("GET", async move {
            redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<u64>>(&mut conn)
                .await
        })
        .await
    }

    async fn set_with_expiry(&self, key: &str, count: u64, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(count);
        if ttl.is_some() {
            cmd.arg("EX").arg(ttl_seconds(ttl));
        }

        self.timed("SET", async move { cmd.query_async::<_, ()>(&mut conn).await })
            .await
    }

    async fn increment_if_below(
        &self,
        key: &str,
        max: u64,
        ttl: Option<Duration>,
    ) -> Result<Increment> {
        let mut conn = self.connection.clone();
        let mut invocation = self.increment_script.key(key);
        invocation.arg(max).arg(ttl_seconds(ttl));

        let (count, status): (u64, u8) = self
            .timed("EVALSHA", async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        decode_increment(count, status)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.timed("PING", async move {
            redis::cmd("PING").query_async::<_, ()>(&mut conn).await
        })
        .await
    }
}
