pub mod redis_cache;
pub mod response_cache;

pub use redis_cache::RedisResponseCache;
pub use response_cache::{read_through, CacheEntry, CacheStats, InMemoryResponseCache, ResponseCache};
