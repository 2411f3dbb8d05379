//! Cache Store Module
//!
//! Typed JSON layer over a [`CacheBackend`]. Values that no longer decode are
//! evicted on read and reported as misses, so a corrupt entry never surfaces
//! as an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{CacheBackend, CacheStats, MemoryBackend};
use crate::error::CacheError;

// == Cache Store ==
/// Shared, cloneable handle to the cache.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    counters: Arc<StoreCounters>,
}

#[derive(Debug, Default)]
struct StoreCounters {
    self_healed: AtomicU64,
    ttl_failures: AtomicU64,
}

impl CacheStore {
    // == Constructor ==
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            counters: Arc::new(StoreCounters::default()),
        }
    }

    /// Creates a store over a fresh in-memory backend, returning both so the
    /// caller can run the expiry sweep.
    pub fn in_memory(max_entries: usize) -> (Self, Arc<MemoryBackend>) {
        let memory = Arc::new(MemoryBackend::new(max_entries));
        (Self::new(memory.clone()), memory)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    // == Get ==
    /// Reads and decodes one value. A payload that fails to decode is removed
    /// and reported as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.backend.get(key).await? {
            Some(raw) => Ok(self.decode_or_heal(key, &raw).await),
            None => Ok(None),
        }
    }

    // == Set ==
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let raw = encode(value)?;
        self.backend.set(key, raw, Some(ttl)).await
    }

    // == Remove ==
    /// Removes a key, returning whether it existed.
    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        self.backend.remove(key).await
    }

    // == Get Many ==
    /// Reads many keys in one round trip. Only hits appear in the result;
    /// duplicate keys collapse.
    pub async fn get_many<T: DeserializeOwned>(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, T>, CacheError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let raw_values = self.backend.get_many(keys).await?;
        let mut hits = HashMap::with_capacity(keys.len());
        for (key, raw) in keys.iter().zip(raw_values) {
            let Some(raw) = raw else { continue };
            if let Some(value) = self.decode_or_heal(key, &raw).await {
                hits.insert(key.clone(), value);
            }
        }
        Ok(hits)
    }

    // == Set Many ==
    /// Writes every entry in one round trip with a shared TTL.
    ///
    /// Keys whose TTL could not be applied remain stored without expiry; they
    /// are logged and counted in `ttl_failures`, not reported as an error.
    pub async fn set_many<T: Serialize>(
        &self,
        entries: &HashMap<String, T>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }

        let encoded = entries
            .iter()
            .map(|(key, value)| Ok((key.clone(), encode(value)?)))
            .collect::<Result<Vec<_>, CacheError>>()?;

        let ttl_failed = self.backend.set_many(encoded, Some(ttl)).await?;
        if !ttl_failed.is_empty() {
            tracing::warn!(
                backend = self.backend.name(),
                count = ttl_failed.len(),
                keys = ?ttl_failed,
                "TTL could not be applied; keys stored without expiry"
            );
            self.counters
                .ttl_failures
                .fetch_add(ttl_failed.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    // == Stats ==
    pub async fn stats(&self) -> CacheStats {
        let mut stats = self.backend.stats().await;
        stats.self_healed = self.counters.self_healed.load(Ordering::Relaxed);
        stats.ttl_failures = self.counters.ttl_failures.load(Ordering::Relaxed);
        stats
    }

    async fn decode_or_heal<T: DeserializeOwned>(&self, key: &str, raw: &str) -> Option<T> {
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Evicting cache entry that failed to decode");
                self.counters.self_healed.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self.backend.remove(key).await {
                    tracing::warn!(key = %key, error = %err, "Failed to evict corrupt cache entry");
                }
                None
            }
        }
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, CacheError> {
    serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))
}
