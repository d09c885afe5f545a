use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::idempotency::key_generator::IdempotencyKey;
use crate::idempotency::storage::{
    BeginOutcome, Claim, Clock, IdempotencyRecord, IdempotencyStore, RecordState,
    StoredResponse, SystemClock,
};
use crate::observability::{get_metrics, LatencyTimer};

/// Replaces the record only if it is still pending under the given epoch.
const COMPLETE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
local record = cjson.decode(current)
if record['epoch'] ~= ARGV[1] or record['status'] ~= 'PENDING' then return 0 end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

/// Deletes the record only if it is still pending under the given epoch.
const ABORT_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
local record = cjson.decode(current)
if record['epoch'] ~= ARGV[1] or record['status'] ~= 'PENDING' then return 0 end
return redis.call('DEL', KEYS[1])
"#;

/// Replaces a stale record with a fresh pending one, only if it still carries
/// the epoch the caller judged stale.
const TAKEOVER_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
local record = cjson.decode(current)
if record['epoch'] ~= ARGV[1] then return 0 end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Redis-based idempotency storage.
///
/// Records are JSON values under `<prefix>:<key>` with a PX expiry equal to
/// the record's own `expires_at`. Claims use `SET NX PX`. Stale-record
/// takeover and every transition use Lua compare-and-set on the epoch.
pub struct RedisIdempotencyStore {
    client: redis::Client,
    key_prefix: String,
    clock: Arc<dyn Clock>,
}

impl RedisIdempotencyStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self::with_clock(client, key_prefix, Arc::new(SystemClock))
    }

    pub fn with_clock(
        client: redis::Client,
        key_prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            clock,
        }
    }

    fn make_key(&self, key: &IdempotencyKey) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    async fn read(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        redis_key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let raw: Option<String> = conn.get(redis_key).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn observe<T>(&self, operation: &str, timer: LatencyTimer, result: &Result<T>) {
        let success = !matches!(result, Err(AppError::Redis(_) | AppError::StoreUnavailable(_)));
        get_metrics().record_store_operation("redis", operation, timer.elapsed_ms(), success);
    }

    async fn begin_inner(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        lease: Duration,
    ) -> Result<BeginOutcome> {
        let mut conn = self.connection().await?;
        let redis_key = self.make_key(key);

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let now = self.clock.now();
            let record = IdempotencyRecord::pending(key, request_hash, now, lease);
            let payload = serde_json::to_string(&record)?;
            let proceed = || {
                BeginOutcome::Proceed(Claim {
                    key: key.clone(),
                    epoch: record.epoch,
                })
            };

            let set: Option<String> = conn
                .set_options(
                    &redis_key,
                    &payload,
                    redis::SetOptions::default()
                        .conditional_set(redis::ExistenceCheck::NX)
                        .with_expiration(redis::SetExpiry::PX(millis(lease))),
                )
                .await?;

            if set.is_some() {
                return Ok(proceed());
            }

            let Some(existing) = self.read(&mut conn, &redis_key).await? else {
                continue;
            };
            match existing.state_at(self.clock.now()) {
                RecordState::Absent => {
                    // Stale by its own expires_at while Redis still holds it.
                    let swapped: i64 = redis::Script::new(TAKEOVER_SCRIPT)
                        .key(&redis_key)
                        .arg(existing.epoch.to_string())
                        .arg(&payload)
                        .arg(millis(lease))
                        .invoke_async(&mut conn)
                        .await?;
                    if swapped == 1 {
                        return Ok(proceed());
                    }
                    continue;
                }
                _ if existing.request_hash != request_hash => {
                    return Err(AppError::KeyReuse(key.to_string()));
                }
                RecordState::Pending { .. } => return Err(AppError::Conflict(key.to_string())),
                RecordState::Completed { response, .. } => {
                    return Ok(BeginOutcome::Replay(response))
                }
            }
        }

        Err(AppError::Conflict(key.to_string()))
    }
}

fn millis(duration: Duration) -> usize {
    usize::try_from(duration.as_millis()).unwrap_or(usize::MAX).max(1)
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn begin(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        lease: Duration,
    ) -> Result<BeginOutcome> {
        let timer = LatencyTimer::new();
        let result = self.begin_inner(key, request_hash, lease).await;
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
        let result = async {
            let mut conn = self.connection().await?;
            let redis_key = self.make_key(&claim.key);

            let Some(mut record) = self.read(&mut conn, &redis_key).await? else {
                return Err(AppError::ClaimLost(claim.key.to_string()));
            };
            if !record.is_owned_by(claim) {
                return Err(AppError::ClaimLost(claim.key.to_string()));
            }
            record.complete(response, self.clock.now(), ttl);
            let payload = serde_json::to_string(&record)?;

            let swapped: i64 = redis::Script::new(COMPLETE_SCRIPT)
                .key(&redis_key)
                .arg(claim.epoch.to_string())
                .arg(payload)
                .arg(millis(ttl))
                .invoke_async(&mut conn)
                .await?;

            if swapped == 1 {
                Ok(record)
            } else {
                Err(AppError::ClaimLost(claim.key.to_string()))
            }
        }
        .await;

        self.observe("complete", timer, &result);
        result
    }

    async fn abort(&self, claim: &Claim) -> Result<bool> {
        let timer = LatencyTimer::new();
        let result = async {
            let mut conn = self.connection().await?;
            let deleted: i64 = redis::Script::new(ABORT_SCRIPT)
                .key(self.make_key(&claim.key))
                .arg(claim.epoch.to_string())
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, AppError>(deleted > 0)
        }
        .await;

        self.observe("abort", timer, &result);
        result
    }

    async fn find(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        let mut conn = self.connection().await?;
        let now = self.clock.now();
        Ok(self
            .read(&mut conn, &self.make_key(key))
            .await?
            .filter(|record| !record.is_expired_at(now)))
    }

    async fn evict(&self, key: &IdempotencyKey) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = conn.del(self.make_key(key)).await?;
        Ok(deleted > 0)
    }

    /// Redis expires keys on its own.
    async fn cleanup_expired(&self) -> Result<u64> {
        Ok(0)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_key() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let store = RedisIdempotencyStore::new(client, "idem");
        let key = IdempotencyKey::parse("tenant1:create-contract:hash123").unwrap();
        assert_eq!(store.make_key(&key), "idem:tenant1:create-contract:hash123");
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
