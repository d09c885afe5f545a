use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::response_cache::{CacheEntry, CacheStats, ResponseCache};
use crate::config::CacheSettings;
use crate::error::Result;
use crate::idempotency::storage::StoredResponse;
use crate::observability::{get_metrics, LatencyTimer};

/// Redis-based response cache.
///
/// Connection and command failures are logged and counted, then reported as
/// a miss (on read) or ignored (on write).
pub struct RedisResponseCache {
    client: redis::Client,
    settings: CacheSettings,
    stats: Arc<CacheStats>,
}

impl RedisResponseCache {
    pub fn new(client: redis::Client, settings: CacheSettings) -> Self {
        Self {
            client,
            settings,
            stats: Arc::new(CacheStats::new()),
        }
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}:{}", self.settings.key_prefix, key)
    }
}

#[async_trait]
impl ResponseCache for RedisResponseCache {
    async fn get(&self, key: &str) -> Result<Option<StoredResponse>> {
        if !self.settings.enabled {
            return Ok(None);
        }

        let redis_key = self.cache_key(key);
        let timer = LatencyTimer::new();

        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                self.stats.record_error();
                tracing::warn!("Redis connection error in cache get: {}", e);
                return Ok(None);
            }
        };

        let result: Option<String> = match conn.get(&redis_key).await {
            Ok(v) => v,
            Err(e) => {
                self.stats.record_error();
                tracing::warn!("Redis get error: {}", e);
                return Ok(None);
            }
        };

        let hit = match result {
            Some(json) => match serde_json::from_str::<CacheEntry>(&json) {
                Ok(entry) if !entry.is_expired_at(Utc::now()) => Some(entry.value),
                Ok(_) => None,
                Err(e) => {
                    self.stats.record_error();
                    tracing::warn!("Failed to deserialize cached response: {}", e);
                    if let Err(e) = conn.del::<_, ()>(&redis_key).await {
                        tracing::warn!("Redis del error for key {}: {}", redis_key, e);
                    }
                    None
                }
            },
            None => None,
        };

        get_metrics().record_cache_lookup("redis", hit.is_some(), timer.elapsed_ms());
        if hit.is_some() {
            self.stats.record_hit();
            tracing::debug!(key = %redis_key, "Cache hit");
        } else {
            self.stats.record_miss();
        }

        Ok(hit)
    }

    async fn put(&self, key: &str, value: StoredResponse, ttl: Duration) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }

        let redis_key = self.cache_key(key);
        let entry = CacheEntry::new(redis_key.clone(), value, Utc::now(), ttl);
        let json = serde_json::to_string(&entry)?;

        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                self.stats.record_error();
                tracing::warn!("Redis connection error in cache set: {}", e);
                return Ok(());
            }
        };

        let ttl_secs = ttl.as_secs().max(1);
        match conn.set_ex::<_, _, ()>(&redis_key, json, ttl_secs).await {
            Ok(_) => {
                self.stats.record_write();
                tracing::debug!(key = %redis_key, ttl_secs, "Cached response");
            }
            Err(e) => {
                self.stats.record_error();
                tracing::warn!("Redis set error: {}", e);
            }
        }

        Ok(())
    }

    fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheBackend;

    fn settings(enabled: bool) -> CacheSettings {
        CacheSettings {
            enabled,
            backend: CacheBackend::Redis,
            key_prefix: "test".to_string(),
            default_ttl_secs: 60,
        }
    }

    #[test]
    fn test_cache_key_format() {
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        let cache = RedisResponseCache::new(client, settings(true));

        assert_eq!(cache.cache_key("tenant1:GET /templates"), "test:tenant1:GET /templates");
    }

    #[tokio::test]
    async fn test_disabled_cache_is_a_noop() {
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        let cache = RedisResponseCache::new(client, settings(false));

        cache
            .put("k", StoredResponse::new(200, "v"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(cache.stats().get_writes(), 0);
    }
}
