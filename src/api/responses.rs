use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::idempotency::{IdempotencyRecord, IdempotencyStatus, MetricsSnapshot};

/// Standard API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ErrorResponse) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Error response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: Option<Vec<ValidationErrorDetail>>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Vec<ValidationErrorDetail>) -> Self {
        self.details = Some(details);
        self
    }
}

/// Validation error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorDetail {
    pub field: String,
    pub message: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub idempotency_backend: String,
}

/// Idempotency record as exposed on the operations endpoints.
/// The stored body is summarized, not returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecordResponse {
    pub key: String,
    pub tenant_id: String,
    pub operation: String,
    pub status: IdempotencyStatus,
    pub status_code: Option<i32>,
    pub response_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<IdempotencyRecord> for IdempotencyRecordResponse {
    fn from(record: IdempotencyRecord) -> Self {
        Self {
            response_bytes: record.response_body.as_ref().map_or(0, Vec::len),
            key: record.key,
            tenant_id: record.tenant_id,
            operation: record.operation,
            status: record.status,
            status_code: record.status_code,
            created_at: record.created_at,
            expires_at: record.expires_at,
            completed_at: record.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionResponse {
    pub key: String,
    pub evicted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResponse {
    pub deleted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatsResponse {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

impl From<&CacheStats> for CacheStatsResponse {
    fn from(stats: &CacheStats) -> Self {
        Self {
            hits: stats.get_hits(),
            misses: stats.get_misses(),
            writes: stats.get_writes(),
            errors: stats.get_errors(),
            hit_rate: stats.hit_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub idempotency: MetricsSnapshot,
    pub cache: CacheStatsResponse,
}
