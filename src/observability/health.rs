use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::{Duration, Instant};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const POSTGRES_SLOW_MS: f64 = 100.0;
const REDIS_SLOW_MS: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// What the edge service relies on a backing service for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyRole {
    /// Guarded writes are refused while it is down.
    IdempotencyStore,
    /// Reads bypass it while it is down.
    ResponseCache,
}

/// Probe result for one backing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    pub fn healthy(name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            latency_ms: None,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }

    /// Healthy, or degraded once a successful probe took longer than `slow_ms`.
    pub fn responded(name: impl Into<String>, latency_ms: f64, slow_ms: f64) -> Self {
        let mut health = Self::healthy(name, latency_ms);
        if latency_ms > slow_ms {
            health.status = HealthStatus::Degraded;
            health.message = Some(format!("slow response ({:.1}ms)", latency_ms));
        }
        health
    }

    /// A response cache outage only costs cache hits.
    fn for_role(mut self, role: DependencyRole) -> Self {
        if role == DependencyRole::ResponseCache && self.status.is_unhealthy() {
            self.status = HealthStatus::Degraded;
            self.message = self
                .message
                .map(|m| format!("response cache bypassed: {}", m));
        }
        self
    }
}

/// Worst dependency status, plus build and uptime info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = if dependencies.iter().any(|d| d.status.is_unhealthy()) {
            HealthStatus::Unhealthy
        } else if dependencies.iter().any(|d| d.status.is_degraded()) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }
}

/// Probes the Postgres pool and Redis client the service was started with.
///
/// Postgres only ever backs the idempotency store. Redis backs the store,
/// the response cache, or both; when it only backs the cache its outage
/// degrades the service instead of taking it out of rotation. A memory-only
/// deployment has nothing to probe and is always ready.
pub struct HealthChecker {
    pool: Option<PgPool>,
    redis_client: Option<redis::Client>,
    redis_role: DependencyRole,
    started: Instant,
}

impl HealthChecker {
    pub fn new(pool: Option<PgPool>, redis_client: Option<redis::Client>) -> Self {
        Self {
            pool,
            redis_client,
            redis_role: DependencyRole::IdempotencyStore,
            started: Instant::now(),
        }
    }

    pub fn with_redis_role(mut self, role: DependencyRole) -> Self {
        self.redis_role = role;
        self
    }

    pub async fn check_all(&self) -> AggregatedHealth {
        let mut dependencies = Vec::new();

        if let Some(pool) = &self.pool {
            dependencies.push(Self::check_postgres(pool).await);
        }
        if let Some(client) = &self.redis_client {
            dependencies.push(Self::check_redis(client).await.for_role(self.redis_role));
        }

        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.uptime_seconds(),
            dependencies,
        )
    }

    pub async fn check_postgres(pool: &PgPool) -> DependencyHealth {
        let start = Instant::now();

        match tokio::time::timeout(PROBE_TIMEOUT, sqlx::query("SELECT 1").fetch_one(pool)).await {
            Ok(Ok(_)) => DependencyHealth::responded("postgres", elapsed_ms(start), POSTGRES_SLOW_MS),
            Ok(Err(e)) => DependencyHealth::unhealthy("postgres", format!("query failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy("postgres", "query timed out"),
        }
    }

    pub async fn check_redis(client: &redis::Client) -> DependencyHealth {
        let start = Instant::now();

        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => return DependencyHealth::unhealthy("redis", format!("connection failed: {}", e)),
        };
        let mut ping_cmd = redis::cmd("PING");
        let ping = ping_cmd.query_async::<_, ()>(&mut conn);
        match tokio::time::timeout(PROBE_TIMEOUT, ping).await {
            Ok(Ok(())) => DependencyHealth::responded("redis", elapsed_ms(start), REDIS_SLOW_MS),
            Ok(Err(e)) => DependencyHealth::unhealthy("redis", format!("PING failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy("redis", "PING timed out"),
        }
    }

    pub fn is_alive(&self) -> bool {
        true
    }

    /// Ready unless a dependency the idempotency store needs is down.
    pub async fn is_ready(&self) -> bool {
        !self.check_all().await.status.is_unhealthy()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
