use anyhow::Result;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use form_ratelimit::{
    cache::{CounterStore, MemoryCounterStore},
    config::{ServiceConfig, StoreBackend, StoreConfig},
    limiter::RateLimiter,
    metrics::Metrics,
    redis::{RedisClient, RedisConfig},
    service::{router, RateLimitService},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "form_ratelimit=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting form submission rate limiter");

    let config_path = std::env::var("CONFIG_PATH").ok();
    if let Some(path) = &config_path {
        info!("Loading configuration from: {}", path);
    }
    let config = ServiceConfig::load(config_path.as_deref())?;

    let limits = config.rate_limits();
    info!(
        max_submissions = limits.max_submissions,
        time_limit = limits.time_limit,
        backend = ?config.store.backend,
        "Rate limits configured"
    );

    let metrics = Arc::new(Metrics::new()?);
    let store = create_store(&config.store).await?;
    let limiter = RateLimiter::new(store, limits)
        .with_metrics(metrics)
        .with_key_prefix(config.store.key_prefix.clone())
        .with_store_timeout(config.store.timeout());
    let service = Arc::new(RateLimitService::new(limiter).with_admin_token(config.admin_token.clone()));
    if config.admin_token.is_none() {
        info!("No admin token configured, PUT /config is disabled");
    }

    let http_addr: SocketAddr = config.http_addr.parse()?;
    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    tokio::select! {
        result = axum::serve(listener, router(service).layer(TraceLayer::new_for_http())) => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Service stopped");
    Ok(())
}

async fn create_store(config: &StoreConfig) -> Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryCounterStore::new(config.local_capacity));
            if config.sweep_interval_secs > 0 {
                store
                    .clone()
                    .spawn_sweeper(Duration::from_secs(config.sweep_interval_secs));
            }
            Ok(store)
        }
        StoreBackend::Redis => {
            let redis = RedisClient::new(RedisConfig {
                url: config.redis_url.clone(),
                command_timeout: config.timeout(),
                ..Default::default()
            })
            .await?;
            Ok(Arc::new(redis))
        }
    }
}
