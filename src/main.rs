use edge_idempotency::api::{create_router, AppState, UpstreamClient};
use edge_idempotency::cache::{InMemoryResponseCache, RedisResponseCache, ResponseCache};
use edge_idempotency::config::{CacheBackend, Settings, StoreBackend};
use edge_idempotency::idempotency::{
    IdempotencyCleanupJob, IdempotencyHandler, IdempotencyHandlerConfig, IdempotencyStore,
    InMemoryIdempotencyStore, PostgresIdempotencyStore, RedisIdempotencyStore,
};
use edge_idempotency::observability::{
    init_logging, init_metrics, DependencyRole, HealthChecker, LogConfig,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    // Initialize logging
    init_logging(&LogConfig::from_settings(&settings.application));
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    let needs_redis = settings.idempotency.backend == StoreBackend::Redis
        || (settings.cache.enabled && settings.cache.backend == CacheBackend::Redis);

    // Connect to PostgreSQL
    let pool = if settings.idempotency.backend == StoreBackend::Postgres {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(settings.database.pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&settings.database.url)
            .await?;
        info!("Database connection established");

        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations applied successfully");
        Some(pool)
    } else {
        None
    };

    // Connect to Redis
    let redis_client = if needs_redis {
        info!("Connecting to Redis...");
        let client = redis::Client::open(settings.redis.url.as_str())?;
        let mut con = client.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("PING").query_async(&mut con).await?;
        info!("Redis connection established");
        Some(client)
    } else {
        None
    };

    let store: Arc<dyn IdempotencyStore> = match (settings.idempotency.backend, &pool, &redis_client) {
        (StoreBackend::Postgres, Some(pool), _) => Arc::new(PostgresIdempotencyStore::new(pool.clone())),
        (StoreBackend::Redis, _, Some(client)) => Arc::new(RedisIdempotencyStore::new(
            client.clone(),
            settings.idempotency.key_prefix.clone(),
        )),
        _ => {
            warn!("Using in-memory idempotency store; records are lost on restart and not shared between instances");
            Arc::new(InMemoryIdempotencyStore::new())
        }
    };
    info!(backend = store.backend(), "Idempotency store ready");
    let redis_role = if store.backend() == "redis" {
        DependencyRole::IdempotencyStore
    } else {
        DependencyRole::ResponseCache
    };

    let cache: Arc<dyn ResponseCache> = match (&settings.cache.backend, &redis_client) {
        (CacheBackend::Redis, Some(client)) if settings.cache.enabled => {
            Arc::new(RedisResponseCache::new(client.clone(), settings.cache.clone()))
        }
        _ => Arc::new(InMemoryResponseCache::new()),
    };

    let handler = Arc::new(IdempotencyHandler::new(
        store,
        IdempotencyHandlerConfig::from(&settings.idempotency),
    ));

    if settings.idempotency.sweep_interval_secs > 0 {
        IdempotencyCleanupJob::new(Arc::clone(&handler), settings.idempotency.sweep_interval_secs).start();
        info!(interval_secs = settings.idempotency.sweep_interval_secs, "Idempotency sweep scheduled");
    }

    let health_checker = Arc::new(HealthChecker::new(pool, redis_client).with_redis_role(redis_role));
    let mut state = AppState::new(
        handler,
        cache,
        settings.idempotency.clone(),
        settings.cache.clone(),
    )
    .with_metrics(metrics_handle)
    .with_health_checker(health_checker);

    match UpstreamClient::from_settings(&settings.upstream)? {
        Some(upstream) => {
            info!(base_url = upstream.base_url(), "Forwarding guarded requests upstream");
            state = state.with_upstream(upstream);
        }
        None => warn!("No upstream configured; guarded routes will return 404"),
    }

    let app = create_router(state);
    let addr = format!("{}:{}", settings.application.host, settings.application.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
