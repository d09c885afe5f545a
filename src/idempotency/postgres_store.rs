use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::idempotency::key_generator::IdempotencyKey;
use crate::idempotency::storage::{
    expiry_after, BeginOutcome, Claim, Clock, IdempotencyRecord, IdempotencyStatus,
    IdempotencyStore, RecordState, StoredResponse, SystemClock,
};
use crate::observability::{get_metrics, LatencyTimer};

const RECORD_COLUMNS: &str = "key, tenant_id, operation, request_hash, status, epoch, status_code, response_headers, response_body, created_at, expires_at, completed_at";

/// Attempts before a claim race that keeps flipping under us is reported as a conflict.
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// PostgreSQL-based idempotency storage.
///
/// The claim is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE expired`
/// statement, so the unique index on `key` decides races: exactly one
/// writer gets a row back.
pub struct PostgresIdempotencyStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Inserts a pending marker, or takes over an expired row.
    /// Returns true if this call now owns the key.
    async fn try_claim(&self, record: &IdempotencyRecord) -> Result<bool> {
        let claimed: Option<(uuid::Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO idempotency_records (key, tenant_id, operation, request_hash, status, epoch, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (key) DO UPDATE
            SET tenant_id = EXCLUDED.tenant_id,
                operation = EXCLUDED.operation,
                request_hash = EXCLUDED.request_hash,
                status = EXCLUDED.status,
                epoch = EXCLUDED.epoch,
                status_code = NULL,
                response_headers = NULL,
                response_body = NULL,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at,
                completed_at = NULL
            WHERE idempotency_records.expires_at <= EXCLUDED.created_at
            RETURNING epoch
            "#,
        )
        .bind(&record.key)
        .bind(&record.tenant_id)
        .bind(&record.operation)
        .bind(&record.request_hash)
        .bind(record.status)
        .bind(record.epoch)
        .bind(record.created_at)
        .bind(record.expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(matches!(claimed, Some((epoch,)) if epoch == record.epoch))
    }

    async fn find_raw(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(&format!(
            "SELECT {} FROM idempotency_records WHERE key = $1",
            RECORD_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Counts live records by status.
    pub async fn count_by_status(&self, status: IdempotencyStatus) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM idempotency_records WHERE status = $1 AND expires_at > $2
            "#,
        )
        .bind(status)
        .bind(self.clock.now())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    fn observe<T>(&self, operation: &str, timer: LatencyTimer, result: &Result<T>) {
        let success = !matches!(result, Err(AppError::Database(_) | AppError::StoreUnavailable(_)));
        get_metrics().record_store_operation("postgres", operation, timer.elapsed_ms(), success);
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn begin(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        lease: Duration,
    ) -> Result<BeginOutcome> {
        let timer = LatencyTimer::new();
        let storage_key = key.to_string();

        let result = async {
            for _ in 0..MAX_CLAIM_ATTEMPTS {
                let now = self.clock.now();
                let record = IdempotencyRecord::pending(key, request_hash, now, lease);

                if self.try_claim(&record).await? {
                    return Ok(BeginOutcome::Proceed(Claim {
                        key: key.clone(),
                        epoch: record.epoch,
                    }));
                }

                // Lost the insert; the row may have expired or been evicted
                // between the two statements, in which case claim again.
                let Some(existing) = self.find_raw(&storage_key).await? else {
                    continue;
                };
                match existing.state_at(self.clock.now()) {
                    RecordState::Absent => continue,
                    _ if existing.request_hash != request_hash => {
                        return Err(AppError::KeyReuse(storage_key.clone()));
                    }
                    RecordState::Pending { .. } => {
                        return Err(AppError::Conflict(storage_key.clone()))
                    }
                    RecordState::Completed { response, .. } => {
                        return Ok(BeginOutcome::Replay(response))
                    }
                }
            }

            Err(AppError::Conflict(storage_key.clone()))
        }
        .await;

        self.observe("begin", timer, &result);
        result
    }

    async fn complete(
        &self,
        claim: &Claim,
        response: &StoredResponse,
        ttl: Duration,
    ) -> Result<IdempotencyRecord> {
        let timer = LatencyTimer::new();
        let now = self.clock.now();
        let headers = serde_json::to_value(&response.headers)?;

        let result = sqlx::query_as::<_, IdempotencyRecord>(&format!(
            r#"
            UPDATE idempotency_records
            SET status = 'COMPLETED', status_code = $3, response_headers = $4, response_body = $5,
                completed_at = $6, expires_at = $7
            WHERE key = $1 AND epoch = $2 AND status = 'PENDING'
            RETURNING {}
            "#,
            RECORD_COLUMNS
        ))
        .bind(claim.key.to_string())
        .bind(claim.epoch)
        .bind(i32::from(response.status_code))
        .bind(headers)
        .bind(&response.body)
        .bind(now)
        .bind(expiry_after(now, ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)
        .and_then(|record| record.ok_or_else(|| AppError::ClaimLost(claim.key.to_string())));

        self.observe("complete", timer, &result);
        result
    }

    async fn abort(&self, claim: &Claim) -> Result<bool> {
        let timer = LatencyTimer::new();
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE key = $1 AND epoch = $2 AND status = 'PENDING'
            "#,
        )
        .bind(claim.key.to_string())
        .bind(claim.epoch)
        .execute(&self.pool)
        .await
        .map(|done| done.rows_affected() > 0)
        .map_err(AppError::from);

        self.observe("abort", timer, &result);
        result
    }

    async fn find(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let now = self.clock.now();
        Ok(self
            .find_raw(&key.to_string())
            .await?
            .filter(|record| !record.is_expired_at(now)))
    }

    async fn evict(&self, key: &IdempotencyKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE key = $1
            "#,
        )
        .bind(key.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE expires_at <= $1
            "#,
        )
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
