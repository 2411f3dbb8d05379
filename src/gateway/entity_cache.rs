//! Entity Cache Module
//!
//! Typed view of the cache for one entity type. The request path and the
//! invalidation handlers both go through it, so keys and TTLs stay in one
//! place.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

use uuid::Uuid;

use crate::cache::{cache_key, parse_id, CachePurpose, CacheStore};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::models::EntityInfo;

pub struct EntityCache<I> {
    store: CacheStore,
    existence_ttl: Duration,
    info_ttl: Duration,
    _info: PhantomData<fn() -> I>,
}

impl<I> Clone for EntityCache<I> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            existence_ttl: self.existence_ttl,
            info_ttl: self.info_ttl,
            _info: PhantomData,
        }
    }
}

impl<I: EntityInfo> EntityCache<I> {
    // == Constructor ==
    pub fn new(store: CacheStore, config: &CacheConfig) -> Self {
        Self::with_ttls(store, config.existence_ttl, config.info_ttl)
    }

    pub fn with_ttls(store: CacheStore, existence_ttl: Duration, info_ttl: Duration) -> Self {
        Self {
            store,
            existence_ttl,
            info_ttl,
            _info: PhantomData,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn existence_key(id: &Uuid) -> String {
        cache_key(CachePurpose::Existence, I::ENTITY, id)
    }

    pub fn info_key(id: &Uuid) -> String {
        cache_key(CachePurpose::Info, I::ENTITY, id)
    }

    // == Existence ==
    /// Cached existence flags for the ids that have one.
    pub async fn existence_many(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, bool>, CacheError> {
        let keys: Vec<String> = ids.iter().map(Self::existence_key).collect();
        let hits = self.store.get_many::<bool>(&keys).await?;
        Ok(by_id(hits))
    }

    pub async fn store_existence_many(&self, flags: &HashMap<Uuid, bool>) -> Result<(), CacheError> {
        let entries: HashMap<String, bool> = flags
            .iter()
            .map(|(id, exists)| (Self::existence_key(id), *exists))
            .collect();
        self.store.set_many(&entries, self.existence_ttl).await
    }

    pub async fn store_existence(&self, id: Uuid, exists: bool) -> Result<(), CacheError> {
        self.store
            .set(&Self::existence_key(&id), &exists, self.existence_ttl)
            .await
    }

    // == Info ==
    /// Cached info records for the ids that have one.
    pub async fn info_many(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, I>, CacheError> {
        let keys: Vec<String> = ids.iter().map(Self::info_key).collect();
        let hits = self.store.get_many::<I>(&keys).await?;
        Ok(by_id(hits))
    }

    pub async fn info(&self, id: Uuid) -> Result<Option<I>, CacheError> {
        self.store.get(&Self::info_key(&id)).await
    }

    /// Caches real records; placeholders are skipped.
    pub async fn store_info_many(&self, records: &[I]) -> Result<(), CacheError> {
        let entries: HashMap<String, &I> = records
            .iter()
            .filter(|record| !record.is_placeholder())
            .map(|record| (Self::info_key(&record.id()), record))
            .collect();
        self.store.set_many(&entries, self.info_ttl).await
    }

    /// Caches one real record; a placeholder is skipped.
    pub async fn store_info(&self, record: &I) -> Result<(), CacheError> {
        if record.is_placeholder() {
            return Ok(());
        }
        self.store
            .set(&Self::info_key(&record.id()), record, self.info_ttl)
            .await
    }

    pub async fn remove_info(&self, id: Uuid) -> Result<bool, CacheError> {
        self.store.remove(&Self::info_key(&id)).await
    }

    // == Mark Deleted ==
    /// Drops the info record and caches an explicit "does not exist" flag.
    pub async fn mark_deleted(&self, id: Uuid) -> Result<(), CacheError> {
        self.remove_info(id).await?;
        self.store_existence(id, false).await
    }
}

fn by_id<T>(hits: HashMap<String, T>) -> HashMap<Uuid, T> {
    hits.into_iter()
        .filter_map(|(key, value)| parse_id(&key).map(|id| (id, value)))
        .collect()
}
