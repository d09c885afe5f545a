use axum::{
    body::to_bytes,
    extract::{Path, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::api::responses::{
    ApiResponse, CacheStatsResponse, EvictionResponse, HealthResponse, IdempotencyRecordResponse,
    StatsResponse, SweepResponse,
};
use crate::error::{AppError, Result};
use crate::idempotency::IdempotencyKey;
use crate::observability::AggregatedHealth;

use super::routes::AppState;

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let health = state.health_checker.check_all().await;

    let response = HealthResponse {
        status: health.status.as_str().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        idempotency_backend: state.idempotency.store().backend().to_string(),
    };

    Json(ApiResponse::success(response))
}

/// Detailed health check with per-dependency latency.
pub async fn detailed_health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<AggregatedHealth>>) {
    let health = state.health_checker.check_all().await;
    let status = if health.status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status, Json(ApiResponse::success(health)))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

// ============================================================================
// Idempotency Operations
// ============================================================================

/// Looks up the record for a full key (`tenant:operation:hash`).
pub async fn get_idempotency_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ApiResponse<IdempotencyRecordResponse>>> {
    let key = IdempotencyKey::parse(&key)?;

    match state.idempotency.find(&key).await? {
        Some(record) => Ok(Json(ApiResponse::success(IdempotencyRecordResponse::from(record)))),
        None => Err(AppError::NotFound(format!("Idempotency record {}", key))),
    }
}

/// Removes a record regardless of its state.
pub async fn evict_idempotency_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ApiResponse<EvictionResponse>>> {
    let key = IdempotencyKey::parse(&key)?;
    let evicted = state.idempotency.evict(&key).await?;

    if evicted {
        tracing::info!(tenant = key.tenant(), operation = key.operation(), "Evicted idempotency record");
    }

    Ok(Json(ApiResponse::success(EvictionResponse {
        key: key.to_string(),
        evicted,
    })))
}

/// Deletes expired records now instead of waiting for the background job.
pub async fn sweep_expired(State(state): State<AppState>) -> Result<Json<ApiResponse<SweepResponse>>> {
    let deleted = state.idempotency.cleanup_expired().await?;
    Ok(Json(ApiResponse::success(SweepResponse { deleted })))
}

/// Counters for the idempotency handler and response cache.
pub async fn stats(State(state): State<AppState>) -> Json<ApiResponse<StatsResponse>> {
    let cache_stats = state.cache.stats();

    Json(ApiResponse::success(StatsResponse {
        idempotency: state.idempotency.metrics().snapshot(),
        cache: CacheStatsResponse::from(cache_stats.as_ref()),
    }))
}

// ============================================================================
// Edge Forwarding
// ============================================================================

/// Fallback for guarded traffic: forwards to the configured edge function.
pub async fn forward_upstream(State(state): State<AppState>, request: Request) -> Result<Response> {
    let upstream = match &state.upstream {
        Some(upstream) => upstream.clone(),
        None => return Err(AppError::NotFound(format!("No route for {}", request.uri().path()))),
    };

    let (parts, body) = request.into_parts();
    let body = to_bytes(body, state.idempotency_settings.max_body_bytes)
        .await
        .map_err(|_| AppError::PayloadTooLarge(state.idempotency_settings.max_body_bytes))?;
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());

    upstream
        .forward(parts.method.as_str(), path, &parts.headers, body)
        .await
}
