pub mod handler;
pub mod key_generator;
pub mod memory_store;
pub mod postgres_store;
pub mod redis_store;
pub mod storage;

pub use handler::{
    Execution, IdempotencyCleanupJob, IdempotencyHandler, IdempotencyHandlerConfig,
    IdempotencyMetrics, MetricsSnapshot,
};
pub use key_generator::{
    IdempotencyKey, KeyGeneratorConfig, RequestFingerprint, RequestFingerprinter, RequestParts,
};
pub use memory_store::InMemoryIdempotencyStore;
pub use postgres_store::PostgresIdempotencyStore;
pub use redis_store::RedisIdempotencyStore;
pub use storage::{
    BeginOutcome, Claim, Clock, IdempotencyRecord, IdempotencyStatus, IdempotencyStore,
    ManualClock, RecordState, StoredResponse, SystemClock,
};
