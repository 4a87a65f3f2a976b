use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use prometheus::TextEncoder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    config::RateLimitConfig,
    limiter::{RateLimiter, Verdict},
    metrics::Metrics,
};

/// Body of `POST /check`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub resource_id: String,
    /// Caller identity, usually the client address
    #[serde(default)]
    pub identity: String,
    /// Privileged callers are never counted
    #[serde(default)]
    pub privileged: bool,
}

/// Body returned by `POST /check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub reason: Option<String>,
    pub outcome: String,
    pub count: Option<u64>,
    pub limit_remaining: Option<u64>,
}

impl From<Verdict> for CheckResponse {
    fn from(verdict: Verdict) -> Self {
        Self {
            allowed: verdict.allowed,
            reason: verdict.reason.map(str::to_string),
            outcome: verdict.outcome.as_str().to_string(),
            count: verdict.count,
            limit_remaining: verdict.limit_remaining,
        }
    }
}

/// HTTP-facing wrapper around the limiter
pub struct RateLimitService {
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    admin_token: Option<String>,
}

impl RateLimitService {
    /// Create a new rate limit service
    pub fn new(limiter: RateLimiter) -> Self {
        let metrics = limiter.metrics().clone();
        Self {
            limiter: Arc::new(limiter),
            metrics,
            admin_token: None,
        }
    }

    /// Token that callers of `PUT /config` must present as a bearer token.
    /// Without one, limits can only change through the service configuration.
    pub fn with_admin_token(mut self, admin_token: Option<String>) -> Self {
        self.admin_token = admin_token.filter(|token| !token.is_empty());
        self
    }

    /// Whether `headers` carry the admin bearer token
    pub fn authorize(&self, headers: &HeaderMap) -> std::result::Result<(), StatusCode> {
        let expected = self.admin_token.as_deref().ok_or(StatusCode::FORBIDDEN)?;
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(StatusCode::UNAUTHORIZED)?;

        // blake3::Hash compares in constant time
        if blake3::hash(presented.as_bytes()) == blake3::hash(expected.as_bytes()) {
            Ok(())
        } else {
            Err(StatusCode::UNAUTHORIZED)
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Evaluate one submission
    pub async fn check(&self, request: &CheckRequest) -> CheckResponse {
        let verdict = self
            .limiter
            .check(&request.resource_id, &request.identity, request.privileged)
            .await;
        debug!(
            resource_id = %request.resource_id,
            allowed = verdict.allowed,
            outcome = verdict.outcome.as_str(),
            "Check complete"
        );
        verdict.into()
    }

    pub async fn config(&self) -> RateLimitConfig {
        self.limiter.config().await
    }

    pub async fn update_config(&self, raw: &Value) -> RateLimitConfig {
        self.limiter.update_config(raw).await
    }

    /// Health check for the service
    pub async fn health_check(&self) -> crate::error::Result<()> {
        self.limiter.health_check().await
    }
}

/// Routes for checks, limit management, health and metrics
pub fn router(service: Arc<RateLimitService>) -> Router {
    Router::new()
        .route("/check", post(check_handler))
        .route("/config", get(get_config).put(put_config))
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(service)
}

async fn check_handler(
    State(service): State<Arc<RateLimitService>>,
    Json(request): Json<CheckRequest>,
) -> Json<CheckResponse> {
    Json(service.check(&request).await)
}

async fn get_config(State(service): State<Arc<RateLimitService>>) -> Json<RateLimitConfig> {
    Json(service.config().await)
}

async fn put_config(
    State(service): State<Arc<RateLimitService>>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Result<Json<RateLimitConfig>, StatusCode> {
    if let Err(status) = service.authorize(&headers) {
        warn!(%status, "Refused rate limit configuration update");
        service.metrics().record_config_update("refused");
        return Err(status);
    }
    Ok(Json(service.update_config(&raw).await))
}

async fn health_check(
    State(service): State<Arc<RateLimitService>>,
) -> Result<Json<Value>, StatusCode> {
    match service.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(
    State(service): State<Arc<RateLimitService>>,
) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = service.metrics().registry().gather();

    encoder
        .encode_to_string(&metric_families)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::MemoryCounterStore, limiter::LIMIT_EXCEEDED_REASON};
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request},
    };
    use tower::ServiceExt;

    fn create_test_service(config: RateLimitConfig) -> Arc<RateLimitService> {
        let store = Arc::new(MemoryCounterStore::new(1000));
        Arc::new(RateLimitService::new(RateLimiter::new(store, config)))
    }

    fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_check_endpoint() {
        let app = router(create_test_service(RateLimitConfig::new(1, 60)));
        let body = json!({"resource_id": "contact", "identity": "10.0.0.1"});

        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/check", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first: CheckResponse = read_json(response).await;
        assert!(first.allowed);
        assert_eq!(first.outcome, "counted");
        assert_eq!(first.count, Some(1));

        let response = app
            .oneshot(json_request(Method::POST, "/check", body))
            .await
            .unwrap();
        let second: CheckResponse = read_json(response).await;
        assert!(!second.allowed);
        assert_eq!(second.outcome, "limit_exceeded");
        assert_eq!(second.reason.as_deref(), Some(LIMIT_EXCEEDED_REASON));
    }

    #[tokio::test]
    async fn test_privileged_check_is_bypassed() {
        let app = router(create_test_service(RateLimitConfig::new(0, 60)));
        let body = json!({"resource_id": "contact", "identity": "10.0.0.1", "privileged": true});

        let response = app
            .oneshot(json_request(Method::POST, "/check", body))
            .await
            .unwrap();
        let verdict: CheckResponse = read_json(response).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.outcome, "bypassed");
        assert_eq!(verdict.count, None);
    }

    #[tokio::test]
    async fn test_config_endpoints() {
        let store = Arc::new(MemoryCounterStore::new(1000));
        let service = RateLimitService::new(RateLimiter::new(store, RateLimitConfig::default()))
            .with_admin_token(Some("s3cret".to_string()));
        let app = router(Arc::new(service));

        let mut request = json_request(
            Method::PUT,
            "/config",
            json!({"max_submissions": "5", "time_limit": -10}),
        );
        request
            .headers_mut()
            .insert(AUTHORIZATION, "Bearer s3cret".parse().unwrap());

        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let applied: RateLimitConfig = read_json(response).await;
        assert_eq!(applied, RateLimitConfig::new(5, 0));

        let response = app
            .oneshot(Request::get("/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let current: RateLimitConfig = read_json(response).await;
        assert_eq!(current, applied);
    }

    #[tokio::test]
    async fn test_config_update_requires_admin_token() {
        let store = Arc::new(MemoryCounterStore::new(1000));
        let service = Arc::new(
            RateLimitService::new(RateLimiter::new(store, RateLimitConfig::new(3, 3600)))
                .with_admin_token(Some("s3cret".to_string())),
        );
        let app = router(service.clone());
        let body = json!({"max_submissions": 1000000});

        let response = app
            .clone()
            .oneshot(json_request(Method::PUT, "/config", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut request = json_request(Method::PUT, "/config", body);
        request
            .headers_mut()
            .insert(AUTHORIZATION, "Bearer guess".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(service.config().await, RateLimitConfig::new(3, 3600));
    }

    #[tokio::test]
    async fn test_config_update_disabled_without_token() {
        let service = create_test_service(RateLimitConfig::new(3, 3600));
        let app = router(service.clone());

        let mut request = json_request(Method::PUT, "/config", json!({"max_submissions": 50}));
        request
            .headers_mut()
            .insert(AUTHORIZATION, "Bearer anything".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(service.config().await, RateLimitConfig::new(3, 3600));
    }

    #[tokio::test]
    async fn test_health_and_metrics_endpoints() {
        let service = create_test_service(RateLimitConfig::default());
        service
            .check(&CheckRequest {
                resource_id: "contact".to_string(),
                identity: "10.0.0.1".to_string(),
                privileged: false,
            })
            .await;
        let app = router(service);

        let response = app
            .clone()
            .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health: Value = read_json(response).await;
        assert_eq!(health["status"], "healthy");
        assert!(health["timestamp"].is_string());

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("form_ratelimit_checks_total"));
    }

    #[tokio::test]
    async fn test_missing_resource_id_is_rejected() {
        let app = router(create_test_service(RateLimitConfig::default()));

        let response = app
            .oneshot(json_request(Method::POST, "/check", json!({"identity": "ip"})))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
