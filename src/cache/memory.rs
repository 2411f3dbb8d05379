//! Memory Backend Module
//!
//! In-process cache engine combining HashMap storage with LRU tracking and
//! TTL expiration. All state sits behind one async lock so batch operations
//! are atomic with respect to each other.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cache::{CacheBackend, CacheEntry, CacheStats, LruTracker, MAX_KEY_LENGTH};
use crate::error::CacheError;

// == Memory Engine ==
/// Unsynchronized engine state.
#[derive(Debug)]
struct MemoryEngine {
    entries: HashMap<String, CacheEntry>,
    lru: LruTracker,
    stats: CacheStats,
    max_entries: usize,
}

impl MemoryEngine {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruTracker::new(),
            stats: CacheStats::new(),
            max_entries,
        }
    }

    fn validate_key(key: &str) -> Result<(), CacheError> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(CacheError::KeyTooLong(MAX_KEY_LENGTH));
        }
        Ok(())
    }

    /// Stores a value, evicting the least recently used entry when full.
    fn set(&mut self, key: String, value: String, ttl: Option<Duration>) {
        let is_overwrite = self.entries.contains_key(&key);

        if !is_overwrite && self.entries.len() >= self.max_entries {
            if let Some(evicted_key) = self.lru.evict_oldest() {
                self.entries.remove(&evicted_key);
                self.stats.record_eviction();
            }
        }

        self.lru.touch(&key);
        self.entries.insert(key, CacheEntry::new(value, ttl));
        self.stats.set_total_entries(self.entries.len());
    }

    /// Returns the live value, dropping the entry if it has expired.
    fn get(&mut self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => {
                let value = entry.value.clone();
                self.stats.record_hit();
                self.lru.touch(key);
                return Some(value);
            }
            None => false,
        };

        if expired {
            self.entries.remove(key);
            self.lru.remove(key);
            self.stats.record_expirations(1);
            self.stats.set_total_entries(self.entries.len());
        }
        self.stats.record_miss();
        None
    }

    fn remove(&mut self, key: &str) -> bool {
        let existed = self.entries.remove(key).is_some();
        if existed {
            self.lru.remove(key);
            self.stats.set_total_entries(self.entries.len());
        }
        existed
    }

    fn cleanup_expired(&mut self) -> usize {
        let expired_keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired_keys {
            self.entries.remove(key);
            self.lru.remove(key);
        }

        self.stats.record_expirations(expired_keys.len());
        self.stats.set_total_entries(self.entries.len());
        expired_keys.len()
    }
}

// == Memory Backend ==
/// In-process backend with LRU eviction and TTL support.
#[derive(Debug)]
pub struct MemoryBackend {
    engine: RwLock<MemoryEngine>,
}

impl MemoryBackend {
    // == Constructor ==
    /// Creates a backend holding at most `max_entries` entries.
    pub fn new(max_entries: usize) -> Self {
        Self {
            engine: RwLock::new(MemoryEngine::new(max_entries.max(1))),
        }
    }

    // == Cleanup Expired ==
    /// Removes all expired entries, returning how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        self.engine.write().await.cleanup_expired()
    }

    // == Length ==
    /// Number of stored entries, including expired ones not yet swept.
    pub async fn len(&self) -> usize {
        self.engine.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns true if the key is stored, regardless of expiry.
    pub async fn contains(&self, key: &str) -> bool {
        self.engine.read().await.entries.contains_key(key)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        // Write lock: reads touch the LRU order and the counters
        Ok(self.engine.write().await.get(key))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let mut engine = self.engine.write().await;
        Ok(keys.iter().map(|key| engine.get(key)).collect())
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        MemoryEngine::validate_key(key)?;
        self.engine.write().await.set(key.to_string(), value, ttl);
        Ok(())
    }

    async fn set_many(
        &self,
        entries: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> Result<Vec<String>, CacheError> {
        for (key, _) in &entries {
            MemoryEngine::validate_key(key)?;
        }

        let mut engine = self.engine.write().await;
        let written: Vec<String> = entries
            .into_iter()
            .map(|(key, value)| {
                engine.set(key.clone(), value, None);
                key
            })
            .collect();

        if let Some(ttl) = ttl {
            for key in &written {
                if let Some(entry) = engine.entries.get_mut(key) {
                    entry.expire_in(ttl);
                }
            }
        }
        Ok(Vec::new())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.engine.write().await.remove(key))
    }

    async fn stats(&self) -> CacheStats {
        let engine = self.engine.read().await;
        let mut stats = engine.stats.clone();
        stats.set_total_entries(engine.entries.len());
        stats
    }
}
