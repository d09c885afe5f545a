use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use std::time::Duration;

use crate::config::UpstreamSettings;
use crate::error::{AppError, Result};
use crate::observability::{get_metrics, LatencyTimer};

/// Headers that belong to a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// HTTP client for the edge function behind the guard.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Upstream(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Returns `None` when no upstream is configured.
    pub fn from_settings(settings: &UpstreamSettings) -> Result<Option<Self>> {
        settings
            .base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(|url| Self::new(url, Duration::from_secs(settings.timeout_secs)))
            .transpose()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    /// Forwards a request and buffers the upstream response.
    pub async fn forward(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| AppError::Validation(format!("unsupported method: {}", e)))?;
        let timer = LatencyTimer::new();

        let mut request = self.client.request(method, self.url_for(path_and_query));
        for (name, value) in headers {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                request = request.header(name.as_str(), value);
            }
        }

        let upstream = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;

        let status = upstream.status().as_u16();
        let upstream_headers: Vec<(String, String)> = upstream
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let bytes = upstream
            .bytes()
            .await
            .map_err(|e| AppError::Upstream(e.to_string()))?;

        get_metrics().record_upstream_request(status, timer.elapsed_ms());
        tracing::debug!(status, path = %path_and_query, "Upstream responded");

        let mut response = Response::new(Body::from(bytes.to_vec()));
        *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        for (name, value) in upstream_headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                response.headers_mut().append(name, value);
            }
        }
        Ok(response)
    }
}
