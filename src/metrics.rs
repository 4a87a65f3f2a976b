use prometheus::{CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the rate limiter
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Check outcomes
    checks: CounterVec,
    degraded_checks: CounterVec,

    // Store metrics
    store_operations: CounterVec,
    store_operation_duration: HistogramVec,

    // Service metrics
    config_updates: CounterVec,
    check_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let checks = CounterVec::new(
            Opts::new(
                "form_ratelimit_checks_total",
                "Rate limit checks by outcome",
            ),
            &["outcome"],
        )?;

        let degraded_checks = CounterVec::new(
            Opts::new(
                "form_ratelimit_degraded_checks_total",
                "Checks allowed without consulting the counter",
            ),
            &["reason"],
        )?;

        let store_operations = CounterVec::new(
            Opts::new(
                "form_ratelimit_store_operations_total",
                "Counter store operations by type and result",
            ),
            &["operation", "result"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "form_ratelimit_store_operation_duration_seconds",
                "Duration of counter store operations in seconds",
            ),
            &["operation"],
        )?;

        let config_updates = CounterVec::new(
            Opts::new(
                "form_ratelimit_config_updates_total",
                "Limit configuration updates by result",
            ),
            &["result"],
        )?;

        let check_duration = Histogram::with_opts(HistogramOpts::new(
            "form_ratelimit_check_duration_seconds",
            "Duration of rate limit checks in seconds",
        ))?;

        registry.register(Box::new(checks.clone()))?;
        registry.register(Box::new(degraded_checks.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(config_updates.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;

        Ok(Self {
            registry,
            checks,
            degraded_checks,
            store_operations,
            store_operation_duration,
            config_updates,
            check_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of a check
    pub fn record_check(&self, outcome: &str) {
        self.checks.with_label_values(&[outcome]).inc();
    }

    /// Record a check that was allowed without a counter decision
    pub fn record_degraded_check(&self, reason: &str) {
        self.degraded_checks.with_label_values(&[reason]).inc();
    }

    /// Record a store operation
    pub fn record_store_operation(&self, operation: &str, result: &str, duration_seconds: f64) {
        self.store_operations
            .with_label_values(&[operation, result])
            .inc();
        self.store_operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Record a configuration update
    pub fn record_config_update(&self, result: &str) {
        self.config_updates.with_label_values(&[result]).inc();
    }

    /// Create a timer for measuring check duration
    pub fn start_check_timer(&self) -> prometheus::HistogramTimer {
        self.check_duration.start_timer()
    }

    /// Current value of the checks counter, for tests and diagnostics
    pub fn check_count(&self, outcome: &str) -> u64 {
        self.checks.with_label_values(&[outcome]).get() as u64
    }

    /// Current value of the degraded checks counter
    pub fn degraded_count(&self, reason: &str) -> u64 {
        self.degraded_checks.with_label_values(&[reason]).get() as u64
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
