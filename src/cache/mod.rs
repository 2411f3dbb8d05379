//! Cache Module
//!
//! Keyed JSON cache with TTL expiration, batch operations and self-healing
//! reads. The in-memory backend adds LRU eviction; the Redis backend is
//! available behind the `redis` feature.

mod backend;
mod entry;
mod keys;
mod lru;
mod memory;
mod stats;
mod store;

#[cfg(feature = "redis")]
mod redis;


// Re-export public types
pub use backend::CacheBackend;
pub use entry::CacheEntry;
pub use keys::{cache_key, parse_id, CachePurpose};
pub use lru::LruTracker;
pub use memory::MemoryBackend;
pub use stats::CacheStats;
pub use store::CacheStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;
