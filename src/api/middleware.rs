use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::api::requests::EdgeHeaders;
use crate::api::responses::{ApiResponse, ErrorResponse, ValidationErrorDetail};
use crate::api::routes::AppState;
use crate::error::{AppError, Result};
use crate::idempotency::{BeginOutcome, RequestFingerprinter, RequestParts, StoredResponse};
use crate::observability::{get_metrics, mask_key, LatencyTimer};

/// Set on responses served from the idempotency store.
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// `HIT` or `MISS` on cacheable reads.
pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Response headers kept with a stored response.
const STORED_HEADERS: &[&str] = &[
    "content-type",
    "content-language",
    "content-location",
    "location",
    "etag",
    "last-modified",
];

/// Request headers that identify the caller; cached reads are partitioned by them.
const CREDENTIAL_HEADERS: &[&str] = &["authorization", "apikey", "cookie"];

fn is_guarded(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

/// Guards state-changing requests with the idempotency store.
///
/// The first request for a key runs; later ones with the same key get the
/// stored response back with `idempotent-replayed: true`. Server errors
/// release the key so the client can retry.
pub async fn idempotency_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !is_guarded(request.method()) {
        return next.run(request).await;
    }

    let method = request.method().to_string();
    let timer = LatencyTimer::new();
    let (response, replayed) = match guard(&state, request, next).await {
        Ok(outcome) => outcome,
        Err(e) => (e.into_response(), false),
    };

    get_metrics().record_http_request(&method, response.status().as_u16(), replayed, timer.elapsed_ms());
    response
}

async fn guard(state: &AppState, request: Request, next: Next) -> Result<(Response, bool)> {
    let settings = &state.idempotency_settings;
    let headers = EdgeHeaders::from_headers(request.headers(), settings);
    if let Err(errors) = headers.validate(settings) {
        return Ok((validation_failed(errors.into_iter().map(Into::into).collect()), false));
    }

    let (parts, body) = request.into_parts();
    let body = to_bytes(body, settings.max_body_bytes)
        .await
        .map_err(|_| AppError::PayloadTooLarge(settings.max_body_bytes))?;

    let method = parts.method.as_str();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());

    let fingerprint = state.idempotency.fingerprint(&RequestParts {
        tenant_id: headers.tenant_id.as_deref().unwrap_or_default(),
        product_code: headers.product_code.as_deref(),
        method,
        path,
        body: &body,
        client_key: headers.client_key.as_deref(),
    })?;

    let claim = match state
        .idempotency
        .begin(&fingerprint.key, &fingerprint.request_hash)
        .await?
    {
        BeginOutcome::Replay(stored) => {
            tracing::info!(key = %mask_key(&fingerprint.key), status = stored.status_code, "Replayed idempotent response");
            return Ok((replay(stored), true));
        }
        BeginOutcome::Proceed(claim) => claim,
    };

    let response = next.run(Request::from_parts(parts, Body::from(body))).await;
    let (response_parts, response_body) = response.into_parts();

    if response_parts.status.is_server_error() {
        if let Err(e) = state.idempotency.abort(&claim).await {
            tracing::error!(key = %mask_key(&claim.key), "Failed to release idempotency claim: {}", e);
        }
        return Ok((Response::from_parts(response_parts, response_body), false));
    }

    let bytes = match to_bytes(response_body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            if let Err(abort_err) = state.idempotency.abort(&claim).await {
                tracing::error!(key = %mask_key(&claim.key), "Failed to release idempotency claim: {}", abort_err);
            }
            return Err(AppError::Internal(anyhow::anyhow!("failed to read response body: {}", e)));
        }
    };

    let stored = StoredResponse {
        status_code: response_parts.status.as_u16(),
        headers: stored_headers(&response_parts.headers),
        body: bytes.to_vec(),
    };
    if let Err(e) = state.idempotency.complete(&claim, &stored).await {
        // The operation already ran; the pending marker lapses with its lease.
        tracing::error!(key = %mask_key(&claim.key), "Failed to store idempotent response: {}", e);
    }

    Ok((Response::from_parts(response_parts, Body::from(bytes)), false))
}

/// Serves safe reads for a tenant from the response cache.
///
/// Entries are keyed by tenant scope, caller credentials and path. Only
/// `200 OK` answers are cached, and never ones marked `private` or
/// `no-store`. `Cache-Control: no-cache` on the request skips the lookup but
/// still refreshes the entry.
pub async fn response_cache_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.cache_settings.enabled || request.method() != Method::GET {
        return next.run(request).await;
    }

    let headers = EdgeHeaders::from_headers(request.headers(), &state.idempotency_settings);
    let tenant = match headers.tenant_id.filter(|t| !t.is_empty()) {
        Some(tenant) => tenant,
        None => return next.run(request).await,
    };

    let scope = match RequestFingerprinter::tenant_scope(&tenant, headers.product_code.as_deref()) {
        Ok(scope) => scope,
        Err(_) => return next.run(request).await,
    };
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let key = cache_key(&scope, request.headers(), &path);

    if !bypasses_cache(request.headers()) {
        match state.cache.get(&key).await {
            Ok(Some(hit)) => {
                let mut response = into_response(hit);
                response
                    .headers_mut()
                    .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("HIT"));
                return response;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Response cache lookup failed: {}", e),
        }
    }

    let response = next.run(request).await;
    if response.status() != StatusCode::OK || forbids_shared_cache(response.headers()) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return AppError::Internal(anyhow::anyhow!("failed to read response body: {}", e))
                .into_response()
        }
    };

    let stored = StoredResponse {
        status_code: parts.status.as_u16(),
        headers: stored_headers(&parts.headers),
        body: bytes.to_vec(),
    };
    let ttl = Duration::from_secs(state.cache_settings.default_ttl_secs);
    if let Err(e) = state.cache.put(&key, stored, ttl).await {
        tracing::warn!("Response cache write failed: {}", e);
    }

    parts
        .headers
        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("MISS"));
    Response::from_parts(parts, Body::from(bytes))
}

/// `<scope>:<caller>:GET <path>` where caller is `public` or a SHA-256 of the
/// credential headers.
fn cache_key(scope: &str, headers: &HeaderMap, path: &str) -> String {
    let caller = credential_digest(headers).unwrap_or_else(|| "public".to_string());
    format!("{}:{}:GET {}", scope, caller, path)
}

fn credential_digest(headers: &HeaderMap) -> Option<String> {
    let mut hasher = Sha256::new();
    let mut present = false;
    for name in CREDENTIAL_HEADERS {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        for value in headers.get_all(*name) {
            present = true;
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b";");
    }
    present.then(|| hex::encode(hasher.finalize()))
}

fn has_directive(headers: &HeaderMap, directives: &[&str]) -> bool {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|d| d.trim().split('=').next().unwrap_or_default().trim())
        .any(|d| directives.iter().any(|wanted| d.eq_ignore_ascii_case(wanted)))
}

fn bypasses_cache(headers: &HeaderMap) -> bool {
    has_directive(headers, &["no-cache", "no-store"])
}

fn forbids_shared_cache(headers: &HeaderMap) -> bool {
    has_directive(headers, &["private", "no-store"])
}

fn stored_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    STORED_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

/// Rebuilds an HTTP response from a stored one.
pub fn into_response(stored: StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status_code).unwrap_or(StatusCode::OK);
    let mut response = Response::new(Body::from(stored.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &stored.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    response
}

fn replay(stored: StoredResponse) -> Response {
    let mut response = into_response(stored);
    response
        .headers_mut()
        .insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}

fn validation_failed(details: Vec<ValidationErrorDetail>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::<()>::error(
            ErrorResponse::new("VALIDATION_ERROR", "Request validation failed").with_details(details),
        )),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_methods() {
        assert!(is_guarded(&Method::POST));
        assert!(is_guarded(&Method::PUT));
        assert!(is_guarded(&Method::PATCH));
        assert!(is_guarded(&Method::DELETE));
        assert!(!is_guarded(&Method::GET));
        assert!(!is_guarded(&Method::HEAD));
    }

    #[test]
    fn test_cache_control_bypass() {
        let mut headers = HeaderMap::new();
        assert!(!bypasses_cache(&headers));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0, No-Cache"));
        assert!(bypasses_cache(&headers));
    }

    #[test]
    fn test_cache_key_partitions_callers() {
        let mut alice = HeaderMap::new();
        alice.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer alice"));
        let mut bob = HeaderMap::new();
        bob.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer bob"));
        let mut bob_apikey = HeaderMap::new();
        bob_apikey.insert("apikey", HeaderValue::from_static("Bearer bob"));

        let anonymous = cache_key("tenant1", &HeaderMap::new(), "/me");
        assert_eq!(anonymous, "tenant1:public:GET /me");
        assert_ne!(cache_key("tenant1", &alice, "/me"), cache_key("tenant1", &bob, "/me"));
        assert_ne!(cache_key("tenant1", &bob, "/me"), cache_key("tenant1", &bob_apikey, "/me"));
        assert_ne!(cache_key("tenant1", &alice, "/me"), anonymous);
        assert_eq!(cache_key("tenant1", &alice, "/me"), cache_key("tenant1", &alice, "/me"));
    }

    #[test]
    fn test_private_and_no_store_responses_are_not_shared() {
        let mut headers = HeaderMap::new();
        assert!(!forbids_shared_cache(&headers));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=60, public"));
        assert!(!forbids_shared_cache(&headers));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("Private, max-age=60"));
        assert!(forbids_shared_cache(&headers));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        assert!(forbids_shared_cache(&headers));

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private=\"set-cookie\""));
        assert!(forbids_shared_cache(&headers));
    }

    #[test]
    fn test_only_listed_headers_are_stored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::LOCATION, HeaderValue::from_static("/contracts/42"));
        headers.insert(header::SET_COOKIE, HeaderValue::from_static("session=abc"));

        let stored = stored_headers(&headers);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.get("location").map(String::as_str), Some("/contracts/42"));
        assert!(!stored.contains_key("set-cookie"));
    }

    #[test]
    fn test_replay_marks_response() {
        let stored = StoredResponse::new(201, "created").with_header("content-type", "text/plain");
        let response = replay(stored);

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get(REPLAYED_HEADER).unwrap(), "true");
        assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain");
    }
}
