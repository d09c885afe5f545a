use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::IdempotencySettings;
use crate::error::{AppError, Result};
use crate::idempotency::key_generator::{
    IdempotencyKey, KeyGeneratorConfig, RequestFingerprint, RequestFingerprinter, RequestParts,
};
use crate::idempotency::storage::{
    BeginOutcome, Claim, IdempotencyRecord, IdempotencyStore, StoredResponse,
};
use crate::observability::{get_metrics, mask_key};

/// Metrics for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub new_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub conflicts: AtomicU64,
    pub completed_requests: AtomicU64,
    pub aborted_requests: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new(&self) {
        self.new_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self) {
        self.replayed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aborted(&self) {
        self.aborted_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            aborted_requests: self.aborted_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub new_requests: u64,
    pub replayed_requests: u64,
    pub conflicts: u64,
    pub completed_requests: u64,
    pub aborted_requests: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Configuration for the idempotency handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyHandlerConfig {
    /// How long a completed response is replayed.
    pub ttl: Duration,
    /// How long a pending marker blocks the key before it is considered abandoned.
    pub pending_ttl: Duration,
    /// Extra `begin` attempts while another request holds the key.
    pub conflict_retry_attempts: u32,
    /// First backoff between attempts; doubles each time.
    pub conflict_retry_backoff: Duration,
    pub canonicalize_json: bool,
}

impl Default for IdempotencyHandlerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86400), // 24 hours
            pending_ttl: Duration::from_secs(60),
            conflict_retry_attempts: 0,
            conflict_retry_backoff: Duration::from_millis(50),
            canonicalize_json: true,
        }
    }
}

impl From<&IdempotencySettings> for IdempotencyHandlerConfig {
    fn from(settings: &IdempotencySettings) -> Self {
        Self {
            ttl: settings.ttl(),
            pending_ttl: settings.pending_ttl(),
            conflict_retry_attempts: settings.conflict_retry_attempts,
            conflict_retry_backoff: Duration::from_millis(settings.conflict_retry_backoff_ms),
            canonicalize_json: true,
        }
    }
}

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Result of running an operation through the handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub response: StoredResponse,
    /// True when the response came from the store rather than the operation.
    pub replayed: bool,
}

/// Handler for idempotent request processing.
pub struct IdempotencyHandler {
    store: Arc<dyn IdempotencyStore>,
    fingerprinter: RequestFingerprinter,
    metrics: Arc<IdempotencyMetrics>,
    config: IdempotencyHandlerConfig,
}

impl IdempotencyHandler {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyHandlerConfig) -> Self {
        let fingerprinter = RequestFingerprinter::new(KeyGeneratorConfig {
            canonicalize_json: config.canonicalize_json,
        });

        Self {
            store,
            fingerprinter,
            metrics: Arc::new(IdempotencyMetrics::new()),
            config,
        }
    }

    /// Gets the metrics for this handler.
    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn store(&self) -> Arc<dyn IdempotencyStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &IdempotencyHandlerConfig {
        &self.config
    }

    pub fn fingerprint(&self, parts: &RequestParts<'_>) -> Result<RequestFingerprint> {
        self.fingerprinter.fingerprint(parts)
    }

    /// Claims the key, retrying with exponential backoff while another
    /// request holds it. Exhausted retries surface as `Conflict`.
    pub async fn begin(&self, key: &IdempotencyKey, request_hash: &str) -> Result<BeginOutcome> {
        self.metrics.record_request();
        let backend = self.store.backend();
        let mut backoff = self.config.conflict_retry_backoff;
        let mut attempt = 0;

        loop {
            match self.store.begin(key, request_hash, self.config.pending_ttl).await {
                Ok(BeginOutcome::Proceed(claim)) => {
                    self.metrics.record_new();
                    get_metrics().record_begin_outcome(backend, "proceed");
                    return Ok(BeginOutcome::Proceed(claim));
                }
                Ok(BeginOutcome::Replay(response)) => {
                    self.metrics.record_replay();
                    get_metrics().record_begin_outcome(backend, "replay");
                    tracing::debug!(key = %mask_key(key), status = response.status_code, "Replaying stored response");
                    return Ok(BeginOutcome::Replay(response));
                }
                Err(AppError::Conflict(_)) if attempt < self.config.conflict_retry_attempts => {
                    attempt += 1;
                    tracing::debug!(key = %mask_key(key), attempt, "Key in flight, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(AppError::Conflict(k)) => {
                    self.metrics.record_conflict();
                    get_metrics().record_begin_outcome(backend, "conflict");
                    return Err(AppError::Conflict(k));
                }
                Err(e) => {
                    get_metrics().record_begin_outcome(backend, "error");
                    return Err(e);
                }
            }
        }
    }

    /// Stores the response for a claim.
    pub async fn complete(
        &self,
        claim: &Claim,
        response: &StoredResponse,
    ) -> Result<IdempotencyRecord> {
        let record = match self.store.complete(claim, response, self.config.ttl).await {
            Ok(record) => record,
            Err(AppError::ClaimLost(k)) => {
                get_metrics().record_claim_lost(self.store.backend());
                return Err(AppError::ClaimLost(k));
            }
            Err(e) => return Err(e),
        };
        self.metrics.record_completed();
        get_metrics().record_completion(self.store.backend(), response.status_code);
        Ok(record)
    }

    /// Releases a claim so the key can be retried.
    pub async fn abort(&self, claim: &Claim) -> Result<bool> {
        let removed = self.store.abort(claim).await?;
        self.metrics.record_aborted();
        get_metrics().record_abort(self.store.backend());
        Ok(removed)
    }

    /// Executes an operation with idempotency handling.
    ///
    /// The operation runs only for the request that wins the claim. A failed
    /// operation aborts the claim and its error is returned; a successful one
    /// is stored and replayed to duplicates until the TTL runs out.
    pub async fn execute<F, Fut>(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        operation: F,
    ) -> Result<Execution>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StoredResponse>>,
    {
        let claim = match self.begin(key, request_hash).await? {
            BeginOutcome::Replay(response) => {
                return Ok(Execution {
                    response,
                    replayed: true,
                })
            }
            BeginOutcome::Proceed(claim) => claim,
        };

        match operation().await {
            Ok(response) => {
                if let Err(e) = self.complete(&claim, &response).await {
                    // The side effect already happened; the marker lapses with its lease.
                    tracing::error!(key = %mask_key(key), "Failed to store idempotent response: {}", e);
                }
                Ok(Execution {
                    response,
                    replayed: false,
                })
            }
            Err(e) => {
                if let Err(abort_err) = self.abort(&claim).await {
                    tracing::error!(key = %mask_key(key), "Failed to release idempotency claim: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    pub async fn find(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        self.store.find(key).await
    }

    pub async fn evict(&self, key: &IdempotencyKey) -> Result<bool> {
        self.store.evict(key).await
    }

    /// Runs cleanup of expired idempotency records.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        self.store.cleanup_expired().await
    }
}

/// Background cleanup job for expired idempotency records.
pub struct IdempotencyCleanupJob {
    handler: Arc<IdempotencyHandler>,
    interval_seconds: u64,
}

impl IdempotencyCleanupJob {
    pub fn new(handler: Arc<IdempotencyHandler>, interval_seconds: u64) -> Self {
        Self {
            handler,
            interval_seconds,
        }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        self.handler.cleanup_expired().await
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(self.interval_seconds));

            loop {
                interval.tick().await;

                match self.handler.cleanup_expired().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency records", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to cleanup expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::storage::MockIdempotencyStore;
    use std::sync::atomic::AtomicBool;

    fn key() -> IdempotencyKey {
        IdempotencyKey::parse("tenant1:create-contract:hash123").unwrap()
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = IdempotencyMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_replay();
        metrics.record_new();
        metrics.record_completed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.replayed_requests, 1);
        assert_eq!(snapshot.new_requests, 1);
        assert_eq!(snapshot.completed_requests, 1);
        assert_eq!(snapshot.replay_rate(), 0.5);
    }

    #[test]
    fn test_default_config() {
        let config = IdempotencyHandlerConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(86400));
        assert_eq!(config.pending_ttl, Duration::from_secs(60));
        assert_eq!(config.conflict_retry_attempts, 0);
    }

    #[tokio::test]
    async fn test_store_unavailable_is_not_degraded_to_proceed() {
        let mut store = MockIdempotencyStore::new();
        store
            .expect_begin()
            .returning(|_, _, _| Err(AppError::StoreUnavailable("connection refused".into())));
        store.expect_backend().return_const("mock");

        let handler = IdempotencyHandler::new(Arc::new(store), IdempotencyHandlerConfig::default());
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let result = handler
            .execute(&key(), "hash123", || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(StoredResponse::new(201, "created"))
            })
            .await;

        assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_conflict_retries_then_gives_up() {
        let mut store = MockIdempotencyStore::new();
        store
            .expect_begin()
            .times(3)
            .returning(|key, _, _| Err(AppError::Conflict(key.to_string())));
        store.expect_backend().return_const("mock");

        let config = IdempotencyHandlerConfig {
            conflict_retry_attempts: 2,
            conflict_retry_backoff: Duration::from_millis(1),
            ..IdempotencyHandlerConfig::default()
        };
        let handler = IdempotencyHandler::new(Arc::new(store), config);

        let err = handler.begin(&key(), "hash123").await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(handler.metrics().snapshot().conflicts, 1);
    }

    #[tokio::test]
    async fn test_failed_complete_still_returns_response() {
        let mut store = MockIdempotencyStore::new();
        store.expect_begin().returning(|key, _, _| {
            Ok(BeginOutcome::Proceed(Claim {
                key: key.clone(),
                epoch: uuid::Uuid::new_v4(),
            }))
        });
        store
            .expect_complete()
            .returning(|claim, _, _| Err(AppError::ClaimLost(claim.key.to_string())));
        store.expect_backend().return_const("mock");

        let handler = IdempotencyHandler::new(Arc::new(store), IdempotencyHandlerConfig::default());
        let execution = handler
            .execute(&key(), "hash123", || async { Ok(StoredResponse::new(201, "created")) })
            .await
            .unwrap();

        assert!(!execution.replayed);
        assert_eq!(execution.response.status_code, 201);
    }
}
