//! Cache Backend Module
//!
//! The raw string-keyed, string-valued storage the typed [`CacheStore`]
//! sits on. Backends own their own locking: callers never synchronize.
//!
//! [`CacheStore`]: crate::cache::CacheStore

use std::time::Duration;

use async_trait::async_trait;

use crate::cache::CacheStats;
use crate::error::CacheError;

/// Raw storage operations.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Short name used in log fields.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Reads many keys in one round trip. The result is positional: entry `i`
    /// belongs to `keys[i]`.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>)
        -> Result<(), CacheError>;

    /// Writes every entry, then applies `ttl` to each written key.
    ///
    /// Applying the TTL may be a separate step from the write. Keys whose TTL
    /// could not be applied stay stored without expiry and are returned so
    /// the caller can account for them.
    async fn set_many(
        &self,
        entries: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> Result<Vec<String>, CacheError>;

    /// Removes a key, returning whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, CacheError>;

    async fn stats(&self) -> CacheStats;
}
