use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::middleware::{idempotency_middleware, response_cache_middleware};
use super::upstream::UpstreamClient;
use crate::cache::ResponseCache;
use crate::config::{CacheSettings, IdempotencySettings};
use crate::idempotency::IdempotencyHandler;
use crate::observability::HealthChecker;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub idempotency: Arc<IdempotencyHandler>,
    pub cache: Arc<dyn ResponseCache>,
    pub idempotency_settings: Arc<IdempotencySettings>,
    pub cache_settings: Arc<CacheSettings>,
    pub upstream: Option<UpstreamClient>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub health_checker: Arc<HealthChecker>,
}

impl AppState {
    pub fn new(
        idempotency: Arc<IdempotencyHandler>,
        cache: Arc<dyn ResponseCache>,
        idempotency_settings: IdempotencySettings,
        cache_settings: CacheSettings,
    ) -> Self {
        Self {
            idempotency,
            cache,
            idempotency_settings: Arc::new(idempotency_settings),
            cache_settings: Arc::new(cache_settings),
            upstream: None,
            metrics_handle: None,
            health_checker: Arc::new(HealthChecker::new(None, None)),
        }
    }

    /// Adds the edge function that guarded requests are forwarded to.
    pub fn with_upstream(mut self, upstream: UpstreamClient) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Adds health checker to the state.
    pub fn with_health_checker(mut self, checker: Arc<HealthChecker>) -> Self {
        self.health_checker = checker;
        self
    }
}

/// Creates the main router: operations endpoints plus guarded forwarding of
/// everything else to the upstream edge function.
pub fn create_router(state: AppState) -> Router {
    let edge = Router::new().fallback(handlers::forward_upstream);
    build_router(state, edge)
}

/// Builds the router around caller-supplied edge routes.
///
/// `edge_routes` are wrapped in the idempotency guard and the response
/// cache; the health, metrics and idempotency operations endpoints are not.
pub fn build_router(state: AppState, edge_routes: Router<AppState>) -> Router {
    let guarded = edge_routes
        .layer(from_fn_with_state(state.clone(), idempotency_middleware))
        .layer(from_fn_with_state(state.clone(), response_cache_middleware));

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/health/detailed", get(handlers::detailed_health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoint
        .route("/metrics", get(handlers::metrics_endpoint))
        // Idempotency operations
        .route("/idempotency/stats", get(handlers::stats))
        .route("/idempotency/sweep", post(handlers::sweep_expired))
        .route(
            "/idempotency/records/*key",
            get(handlers::get_idempotency_record).delete(handlers::evict_idempotency_record),
        )
        .merge(guarded)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
