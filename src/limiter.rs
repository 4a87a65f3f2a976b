use serde_json::Value;
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::{
    cache::{CounterStore, Increment},
    config::RateLimitConfig,
    error::{RateLimitError, Result},
    metrics::Metrics,
    utils::{generate_counter_key, DEFAULT_KEY_PREFIX},
};

/// Message shown to the end user when a submission is rejected.
///
/// Clients match on this text, so it must not change.
pub const LIMIT_EXCEEDED_REASON: &str = "exceeded maximum submissions; retry later";

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a check was allowed without a counter decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedReason {
    StoreUnavailable,
    IdentityUnresolved,
}

/// How a verdict was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The submission was counted against the window
    Counted,
    /// Privileged caller, nothing was counted
    Bypassed,
    /// Allowed because the check could not be performed
    Degraded(DegradedReason),
    /// The window is full
    LimitExceeded,
}

impl Outcome {
    /// Stable machine-readable code
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Counted => "counted",
            Outcome::Bypassed => "bypassed",
            Outcome::Degraded(DegradedReason::StoreUnavailable) => "store_unavailable",
            Outcome::Degraded(DegradedReason::IdentityUnresolved) => "identity_unresolved",
            Outcome::LimitExceeded => "limit_exceeded",
        }
    }
}

/// Accept/reject decision for one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    /// User-facing message, only set on rejection
    pub reason: Option<&'static str>,
    pub outcome: Outcome,
    /// Counter value after this check, when the counter was consulted
    pub count: Option<u64>,
    /// Submissions left in the current window, when the counter was consulted
    pub limit_remaining: Option<u64>,
}

impl Verdict {
    fn counted(count: u64, max_submissions: u64) -> Self {
        Self {
            allowed: true,
            reason: None,
            outcome: Outcome::Counted,
            count: Some(count),
            limit_remaining: Some(max_submissions.saturating_sub(count)),
        }
    }

    fn bypassed() -> Self {
        Self {
            allowed: true,
            reason: None,
            outcome: Outcome::Bypassed,
            count: None,
            limit_remaining: None,
        }
    }

    fn degraded(reason: DegradedReason) -> Self {
        Self {
            allowed: true,
            reason: None,
            outcome: Outcome::Degraded(reason),
            count: None,
            limit_remaining: None,
        }
    }

    fn limit_exceeded(count: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(LIMIT_EXCEEDED_REASON),
            outcome: Outcome::LimitExceeded,
            count: Some(count),
            limit_remaining: Some(0),
        }
    }
}

/// Fixed-window submission limiter shared by all request handlers
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RwLock<RateLimitConfig>,
    metrics: Arc<Metrics>,
    key_prefix: String,
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter over the given store
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config: RwLock::new(config),
            metrics: Arc::new(Metrics::default()),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    /// Store calls slower than this count as the store being unavailable
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Limits used by the next check
    pub async fn config(&self) -> RateLimitConfig {
        *self.config.read().await
    }

    /// Replace the limits with a sanitized version of `raw`
    pub async fn update_config(&self, raw: &Value) -> RateLimitConfig {
        let config = RateLimitConfig::sanitize(raw);
        *self.config.write().await = config;
        self.metrics.record_config_update("applied");
        info!(
            max_submissions = config.max_submissions,
            time_limit = config.time_limit,
            "Rate limit configuration updated"
        );
        config
    }

    /// Counter key for a resource and caller identity
    pub fn counter_key(&self, resource_id: &str, identity: &str) -> String {
        generate_counter_key(&self.key_prefix, resource_id, identity.trim())
    }

    /// Decide whether a submission to `resource_id` from `identity` is accepted.
    ///
    /// Privileged callers pass without touching the store. A missing identity
    /// or a failing store lets the submission through; only a full window
    /// rejects it. The first submission of a window is always counted and
    /// allowed, even when `max_submissions` is 0.
    ///
    /// Leading and trailing whitespace is stripped from `identity` before it
    /// is hashed, so `" 10.0.0.1"` and `"10.0.0.1"` share a counter.
    pub async fn check(&self, resource_id: &str, identity: &str, bypass: bool) -> Verdict {
        let _timer = self.metrics.start_check_timer();
        let verdict = self.evaluate(resource_id, identity, bypass).await;
        self.metrics.record_check(verdict.outcome.as_str());
        verdict
    }

    async fn evaluate(&self, resource_id: &str, identity: &str, bypass: bool) -> Verdict {
        if bypass {
            trace!(resource_id, "Privileged caller, skipping rate limit");
            return Verdict::bypassed();
        }

        let identity = match resolve_identity(identity) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(resource_id, error = %e, "Degraded rate limit check, allowing submission");
                self.metrics.record_degraded_check("identity_unresolved");
                return Verdict::degraded(DegradedReason::IdentityUnresolved);
            }
        };

        let config = self.config().await;
        let key = generate_counter_key(&self.key_prefix, resource_id, identity);
        trace!(resource_id, key = %key, "Checking rate limit");

        let increment = self
            .call_store(
                "increment_if_below",
                self.store
                    .increment_if_below(&key, config.max_submissions, config.ttl()),
            )
            .await;

        match increment {
            Ok(Increment::Saturated(count)) => {
                debug!(resource_id, count, "Submission limit exceeded");
                Verdict::limit_exceeded(count)
            }
            Ok(increment) => Verdict::counted(increment.count(), config.max_submissions),
            Err(e) => {
                warn!(resource_id, error = %e, "Counter store unavailable, allowing submission");
                self.metrics.record_degraded_check("store_unavailable");
                Verdict::degraded(DegradedReason::StoreUnavailable)
            }
        }
    }

    /// Current count for a resource and identity, `None` outside any window
    pub async fn current_count(&self, resource_id: &str, identity: &str) -> Result<Option<u64>> {
        let identity = resolve_identity(identity)?;
        let key = generate_counter_key(&self.key_prefix, resource_id, identity);
        self.call_store("get", self.store.get(&key)).await
    }

    /// Health check for the limiter
    pub async fn health_check(&self) -> Result<()> {
        self.call_store("health_check", self.store.health_check())
            .await
    }

    async fn call_store<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RateLimitError::StoreUnavailable(format!(
                "{} timed out after {}ms",
                operation,
                self.store_timeout.as_millis()
            ))),
        };

        let label = if result.is_ok() { "ok" } else { "error" };
        self.metrics
            .record_store_operation(operation, label, started.elapsed().as_secs_f64());
        result
    }
}

fn resolve_identity(identity: &str) -> Result<&str> {
    let identity = identity.trim();
    if identity.is_empty() {
        Err(RateLimitError::IdentityUnresolved)
    } else {
        Ok(identity)
    }
}
