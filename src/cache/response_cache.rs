use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::idempotency::storage::{expiry_after, Clock, StoredResponse, SystemClock};
use crate::observability::{get_metrics, LatencyTimer};

/// Cache statistics for monitoring.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub errors: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn get_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn get_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn get_writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn get_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// A cached value with its expiry. Never served at or after `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: StoredResponse,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: StoredResponse, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            expires_at: expiry_after(now, ttl),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Read-through cache for idempotent GET-style responses.
///
/// No write-back, no invalidation cascades. Backend failures are the cache's
/// problem: implementations report them as misses.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredResponse>>;

    async fn put(&self, key: &str, value: StoredResponse, ttl: Duration) -> Result<()>;

    fn stats(&self) -> Arc<CacheStats>;
}

/// Returns the cached value or computes, stores and returns a fresh one.
/// Failed computations are not cached.
pub async fn read_through<F, Fut>(
    cache: &dyn ResponseCache,
    key: &str,
    ttl: Duration,
    compute: F,
) -> Result<(StoredResponse, bool)>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StoredResponse>>,
{
    if let Some(hit) = cache.get(key).await? {
        return Ok((hit, true));
    }

    let value = compute().await?;
    cache.put(key, value.clone(), ttl).await?;
    Ok((value, false))
}

/// Process-local response cache with lazy expiry.
pub struct InMemoryResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    stats: Arc<CacheStats>,
}

impl InMemoryResponseCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            stats: Arc::new(CacheStats::new()),
        }
    }

    async fn lookup(&self, key: &str, now: DateTime<Utc>) -> Option<StoredResponse> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired_at(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: drop it unless someone already replaced it.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_expired_at(now)) {
            entries.remove(key);
        }
        None
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for InMemoryResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn get(&self, key: &str) -> Result<Option<StoredResponse>> {
        let timer = LatencyTimer::new();
        let now = self.clock.now();
        let hit = self.lookup(key, now).await;

        get_metrics().record_cache_lookup("memory", hit.is_some(), timer.elapsed_ms());
        if hit.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        Ok(hit)
    }

    async fn put(&self, key: &str, value: StoredResponse, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(key, value, self.clock.now(), ttl);
        self.entries.write().await.insert(key.to_string(), entry);
        self.stats.record_write();
        Ok(())
    }

    fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::storage::ManualClock;

    #[test]
    fn test_cache_stats() {
        let stats = CacheStats::new();

        assert_eq!(stats.get_hits(), 0);
        assert_eq!(stats.get_misses(), 0);
        assert_eq!(stats.hit_rate(), 0.0);

        stats.record_hit();
        stats.record_hit();
        stats.record_miss();

        assert_eq!(stats.get_hits(), 2);
        assert_eq!(stats.get_misses(), 1);
        assert!((stats.hit_rate() - 0.666).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_entry_not_served_past_expiry() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = InMemoryResponseCache::with_clock(clock.clone());

        cache
            .put("k", StoredResponse::new(200, "v"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(10));
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_read_through_computes_once() {
        let cache = InMemoryResponseCache::new();
        let calls = AtomicU64::new(0);
        let counter = &calls;

        for _ in 0..3 {
            let (value, _) = read_through(&cache, "templates", Duration::from_secs(60), || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(StoredResponse::new(200, "catalog"))
            })
            .await
            .unwrap();
            assert_eq!(value.body, b"catalog");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().get_hits(), 2);
    }

    #[tokio::test]
    async fn test_read_through_does_not_cache_errors() {
        let cache = InMemoryResponseCache::new();
        let result = read_through(&cache, "k", Duration::from_secs(60), || async {
            Err(crate::error::AppError::Upstream("down".into()))
        })
        .await;

        assert!(result.is_err());
        assert!(cache.is_empty().await);
    }
}
