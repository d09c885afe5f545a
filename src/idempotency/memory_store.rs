use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::idempotency::key_generator::IdempotencyKey;
use crate::idempotency::storage::{
    BeginOutcome, Claim, Clock, IdempotencyRecord, IdempotencyStore, RecordState,
    StoredResponse, SystemClock,
};

/// Process-local store for development and tests.
///
/// A single mutex guards the map, which gives the same claim atomicity the
/// durable backends get from their conditional writes. It does not survive
/// restarts and is not shared between instances.
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of records held, expired ones included.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        lease: Duration,
    ) -> Result<BeginOutcome> {
        let now = self.clock.now();
        let storage_key = key.to_string();
        let mut records = self.records.lock().await;

        if let Some(existing) = records.get(&storage_key) {
            match existing.state_at(now) {
                RecordState::Absent => {}
                _ if existing.request_hash != request_hash => {
                    return Err(AppError::KeyReuse(storage_key));
                }
                RecordState::Pending { .. } => return Err(AppError::Conflict(storage_key)),
                RecordState::Completed { response, .. } => {
                    return Ok(BeginOutcome::Replay(response))
                }
            }
        }

        let record = IdempotencyRecord::pending(key, request_hash, now, lease);
        let claim = Claim {
            key: key.clone(),
            epoch: record.epoch,
        };
        records.insert(storage_key, record);

        Ok(BeginOutcome::Proceed(claim))
    }

    async fn complete(
        &self,
        claim: &Claim,
        response: &StoredResponse,
        ttl: Duration,
    ) -> Result<IdempotencyRecord> {
        let now = self.clock.now();
        let storage_key = claim.key.to_string();
        let mut records = self.records.lock().await;

        match records.get_mut(&storage_key) {
            Some(record) if record.is_owned_by(claim) => {
                record.complete(response, now, ttl);
                Ok(record.clone())
            }
            _ => Err(AppError::ClaimLost(storage_key)),
        }
    }

    async fn abort(&self, claim: &Claim) -> Result<bool> {
        let storage_key = claim.key.to_string();
        let mut records = self.records.lock().await;

        match records.get(&storage_key) {
            Some(record) if record.is_owned_by(claim) => {
                records.remove(&storage_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let now = self.clock.now();
        let records = self.records.lock().await;

        Ok(records
            .get(&key.to_string())
            .filter(|record| !record.is_expired_at(now))
            .cloned())
    }

    async fn evict(&self, key: &IdempotencyKey) -> Result<bool> {
        Ok(self.records.lock().await.remove(&key.to_string()).is_some())
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired_at(now));

        Ok((before - records.len()) as u64)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
