use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use edge_idempotency::cache::{CacheStats, InMemoryResponseCache, ResponseCache};
use edge_idempotency::idempotency::{
    BeginOutcome, IdempotencyKey, IdempotencyStore, InMemoryIdempotencyStore,
    RequestFingerprinter, RequestParts, StoredResponse,
};
use edge_idempotency::observability::LatencyTimer;

fn contract_body(fields: usize) -> String {
    let entries: Vec<String> = (0..fields)
        .map(|i| format!("\"field_{}\":\"value {}\"", i, i))
        .collect();
    format!("{{{}}}", entries.join(","))
}

fn benchmark_fingerprinting(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    let fingerprinter = RequestFingerprinter::with_default_config();

    for fields in [4, 64, 1024].iter() {
        let body = contract_body(*fields);
        group.bench_with_input(BenchmarkId::new("canonical_json", fields), &body, |b, body| {
            b.iter(|| {
                let fingerprint = fingerprinter.fingerprint(&RequestParts {
                    tenant_id: black_box("tenant1"),
                    product_code: Some("contractnest"),
                    method: "POST",
                    path: "/contracts",
                    body: body.as_bytes(),
                    client_key: None,
                });
                black_box(fingerprint)
            });
        });
    }

    group.bench_function("client_key", |b| {
        b.iter(|| black_box(RequestFingerprinter::hash_client_key(black_box("order-42"))));
    });

    group.bench_function("key_parse", |b| {
        b.iter(|| black_box(IdempotencyKey::parse(black_box("tenant1:POST /contracts:5f2c9a"))));
    });

    group.finish();
}

fn benchmark_memory_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_store");
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let ttl = Duration::from_secs(3600);
    let lease = Duration::from_secs(30);

    group.bench_function("begin_complete", |b| {
        let store = &InMemoryIdempotencyStore::new();
        let counter = &AtomicU64::new(0);
        let response = &StoredResponse::new(201, "created");

        b.to_async(&runtime).iter(move || {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            async move {
                let key = IdempotencyKey::new("tenant1", "POST /contracts", format!("{:x}", n)).unwrap();
                if let Ok(BeginOutcome::Proceed(claim)) = store.begin(&key, "h", lease).await {
                    black_box(store.complete(&claim, response, ttl).await.ok());
                }
            }
        });
    });

    group.bench_function("replay", |b| {
        let store = InMemoryIdempotencyStore::new();
        let key = IdempotencyKey::new("tenant1", "POST /contracts", "5f2c9a").unwrap();
        runtime.block_on(async {
            if let Ok(BeginOutcome::Proceed(claim)) = store.begin(&key, "h", lease).await {
                store.complete(&claim, &StoredResponse::new(201, "created"), ttl).await.ok();
            }
        });

        let (store, key) = (&store, &key);
        b.to_async(&runtime).iter(move || async move {
            black_box(store.begin(key, "h", lease).await.ok());
        });
    });

    group.finish();
}

fn benchmark_response_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_cache");
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");

    group.bench_function("memory_hit", |b| {
        let cache = InMemoryResponseCache::new();
        runtime.block_on(async {
            cache
                .put("tenant1:GET /templates", StoredResponse::new(200, "catalog"), Duration::from_secs(60))
                .await
                .ok();
        });

        let cache = &cache;
        b.to_async(&runtime).iter(move || async move {
            black_box(cache.get("tenant1:GET /templates").await.ok());
        });
    });

    group.bench_function("stats_hit_rate", |b| {
        let stats = CacheStats::new();
        for _ in 0..1000 {
            stats.record_hit();
        }
        for _ in 0..100 {
            stats.record_miss();
        }

        b.iter(|| black_box(stats.hit_rate()));
    });

    group.finish();
}

fn benchmark_latency_timer(c: &mut Criterion) {
    let mut group = c.benchmark_group("latency_timer");

    group.bench_function("create_and_elapsed", |b| {
        b.iter(|| {
            let timer = LatencyTimer::new();
            let elapsed = timer.elapsed_ms();
            black_box(elapsed)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_fingerprinting,
    benchmark_memory_store,
    benchmark_response_cache,
    benchmark_latency_timer,
);

criterion_main!(benches);
