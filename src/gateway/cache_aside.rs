//! Cache-Aside Gateway Module
//!
//! Resolves a batch of ids from the cache first and asks the downstream only
//! for the misses, in a single call per batch. Fresh answers are written
//! back and merged with the hits.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::downstream::{DownstreamClient, ProductsClient, UsersClient};
use crate::error::Result;
use crate::gateway::EntityCache;
use crate::models::{EntityInfo, MissingInfoPolicy};

// == Cache-Aside Gateway ==
pub struct CacheAsideGateway<C: DownstreamClient> {
    client: C,
    cache: EntityCache<C::Info>,
}

pub type UsersGateway = CacheAsideGateway<UsersClient>;
pub type ProductsGateway = CacheAsideGateway<ProductsClient>;

impl<C: DownstreamClient> CacheAsideGateway<C> {
    // == Constructor ==
    pub fn new(client: C, cache: EntityCache<C::Info>) -> Self {
        Self { client, cache }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn cache(&self) -> &EntityCache<C::Info> {
        &self.cache
    }

    // == Check Exist ==
    /// Existence flag for every distinct requested id.
    ///
    /// Fails with `DownstreamUnavailable` when misses exist and the
    /// downstream cannot answer. An id the downstream leaves out of its
    /// answer reads as `false` and is not cached.
    pub async fn check_exist(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, bool>> {
        let requested = distinct(ids);
        if requested.is_empty() {
            return Ok(HashMap::new());
        }

        let cached = self
            .cache
            .existence_many(&requested)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(client = self.client.service(), error = %e, "Existence cache read failed, treating as miss");
                HashMap::new()
            });

        let misses: Vec<Uuid> = requested
            .iter()
            .filter(|id| !cached.contains_key(id))
            .copied()
            .collect();
        if misses.is_empty() {
            tracing::debug!(client = self.client.service(), count = cached.len(), "All existence flags loaded from cache");
            return Ok(cached);
        }

        tracing::info!(client = self.client.service(), count = misses.len(), "Cache miss for existence checks");
        let fresh = self.client.check_exist(&misses).await?;

        let to_cache: HashMap<Uuid, bool> = misses
            .iter()
            .filter_map(|id| fresh.get(id).map(|exists| (*id, *exists)))
            .collect();
        if let Err(e) = self.cache.store_existence_many(&to_cache).await {
            tracing::warn!(client = self.client.service(), error = %e, "Failed to cache existence flags");
        }

        Ok(requested
            .into_iter()
            .map(|id| {
                let exists = cached.get(&id).or_else(|| fresh.get(&id)).copied();
                let exists = exists.unwrap_or_else(|| {
                    tracing::warn!(client = self.client.service(), id = %id, "Id missing from fresh existence results");
                    false
                });
                (id, exists)
            })
            .collect())
    }

    /// Existence of a single id, with the same rules as [`Self::check_exist`].
    pub async fn exists(&self, id: Uuid) -> Result<bool> {
        let flags = self.check_exist(&[id]).await?;
        Ok(flags.get(&id).copied().unwrap_or(false))
    }

    // == Fetch Info ==
    /// Info record for each distinct requested id.
    ///
    /// Never fails: unavailable ids carry placeholder records, and ids nobody
    /// resolved follow the entity's [`MissingInfoPolicy`].
    pub async fn fetch_info(&self, ids: &[Uuid]) -> HashMap<Uuid, C::Info> {
        let requested = distinct(ids);
        if requested.is_empty() {
            return HashMap::new();
        }

        let mut cached = self.cache.info_many(&requested).await.unwrap_or_else(|e| {
            tracing::warn!(client = self.client.service(), error = %e, "Info cache read failed, treating as miss");
            HashMap::new()
        });

        let misses: Vec<Uuid> = requested
            .iter()
            .filter(|id| !cached.contains_key(id))
            .copied()
            .collect();
        if misses.is_empty() {
            tracing::debug!(client = self.client.service(), count = cached.len(), "All info records loaded from cache");
            return cached;
        }

        tracing::info!(client = self.client.service(), count = misses.len(), "Cache miss for info records");
        let wanted: HashSet<Uuid> = misses.iter().copied().collect();
        let mut fresh: HashMap<Uuid, C::Info> = HashMap::with_capacity(misses.len());
        for record in self.client.fetch_info(&misses).await {
            if wanted.contains(&record.id()) {
                fresh.entry(record.id()).or_insert(record);
            }
        }

        let records: Vec<C::Info> = fresh.values().cloned().collect();
        if let Err(e) = self.cache.store_info_many(&records).await {
            tracing::warn!(client = self.client.service(), error = %e, "Failed to cache info records");
        }

        requested
            .into_iter()
            .filter_map(|id| {
                let record = cached
                    .remove(&id)
                    .or_else(|| fresh.remove(&id))
                    .or_else(|| self.missing(id))?;
                Some((id, record))
            })
            .collect()
    }

    /// Info record for a single id through the single-record endpoint.
    pub async fn info(&self, id: Uuid) -> Option<C::Info> {
        match self.cache.info(id).await {
            Ok(Some(record)) => return Some(record),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(client = self.client.service(), error = %e, "Info cache read failed, treating as miss");
            }
        }

        match self.client.fetch_one(id).await {
            Some(record) => {
                if let Err(e) = self.cache.store_info(&record).await {
                    tracing::warn!(client = self.client.service(), error = %e, "Failed to cache info record");
                }
                Some(record)
            }
            None => self.missing(id),
        }
    }

    fn missing(&self, id: Uuid) -> Option<C::Info> {
        tracing::warn!(client = self.client.service(), id = %id, "No info found for id");
        match <C::Info as EntityInfo>::MISSING_POLICY {
            MissingInfoPolicy::Substitute => Some(<C::Info as EntityInfo>::no_info(id)),
            MissingInfoPolicy::Omit => None,
        }
    }
}

/// Drops duplicate ids, keeping first-seen order.
fn distinct(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBackend, CacheStats, CacheStore};
    use crate::downstream::unavailable_placeholders;
    use crate::error::{CacheError, GatewayError};
    use crate::models::{ProductInfo, UserInfo};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::marker::PhantomData;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // == Test Doubles ==
    /// Downstream double that answers from fixed tables and records calls.
    struct FakeClient<I> {
        existence: HashMap<Uuid, bool>,
        infos: HashMap<Uuid, I>,
        unavailable: bool,
        calls: Arc<AtomicU32>,
        requested: Arc<Mutex<Vec<Vec<Uuid>>>>,
        _info: PhantomData<fn() -> I>,
    }

    impl<I> FakeClient<I> {
        fn new() -> Self {
            Self {
                existence: HashMap::new(),
                infos: HashMap::new(),
                unavailable: false,
                calls: Arc::new(AtomicU32::new(0)),
                requested: Arc::new(Mutex::new(Vec::new())),
                _info: PhantomData,
            }
        }

        fn record(&self, ids: &[Uuid]) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().push(ids.to_vec());
        }
    }

    #[async_trait]
    impl<I: EntityInfo> DownstreamClient for FakeClient<I> {
        type Info = I;

        fn service(&self) -> &'static str {
            "fake"
        }

        async fn check_exist(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, bool>> {
            self.record(ids);
            if self.unavailable {
                return Err(GatewayError::unavailable("fake", "circuit breaker is open"));
            }
            Ok(ids
                .iter()
                .filter_map(|id| self.existence.get(id).map(|e| (*id, *e)))
                .collect())
        }

        async fn fetch_info(&self, ids: &[Uuid]) -> Vec<I> {
            self.record(ids);
            if self.unavailable {
                return unavailable_placeholders(ids);
            }
            ids.iter().filter_map(|id| self.infos.get(id).cloned()).collect()
        }

        async fn fetch_one(&self, id: Uuid) -> Option<I> {
            self.record(&[id]);
            if self.unavailable {
                return Some(I::unavailable(id));
            }
            self.infos.get(&id).cloned()
        }
    }

    /// Backend whose every operation fails.
    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn get(&self, _: &str) -> std::result::Result<Option<String>, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn get_many(&self, _: &[String]) -> std::result::Result<Vec<Option<String>>, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn set(&self, _: &str, _: String, _: Option<Duration>) -> std::result::Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn set_many(
            &self,
            _: Vec<(String, String)>,
            _: Option<Duration>,
        ) -> std::result::Result<Vec<String>, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn remove(&self, _: &str) -> std::result::Result<bool, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn stats(&self) -> CacheStats {
            CacheStats::new()
        }
    }

    fn entity_cache<I: EntityInfo>() -> EntityCache<I> {
        let (store, _) = CacheStore::in_memory(1000);
        EntityCache::with_ttls(store, Duration::from_secs(60), Duration::from_secs(300))
    }

    fn product(id: Uuid, name: &str) -> ProductInfo {
        ProductInfo {
            id,
            name: name.to_string(),
            category: "Office".to_string(),
            unit_price: 3.0,
            quantity_in_stock: 10,
        }
    }

    fn user(id: Uuid) -> UserInfo {
        UserInfo {
            user_id: id,
            email: "grace@example.com".to_string(),
            person_name: "Grace".to_string(),
            gender: "Female".to_string(),
        }
    }

    // == Existence ==
    #[tokio::test]
    async fn test_partial_hits_fetch_only_misses() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let cache = entity_cache::<ProductInfo>();
        cache
            .store_existence_many(&HashMap::from([(a, true), (b, false)]))
            .await
            .unwrap();
        let mut client = FakeClient::new();
        client.existence.insert(c, true);
        let requested = client.requested.clone();
        let gateway = CacheAsideGateway::new(client, cache.clone());

        let result = gateway.check_exist(&[a, b, c]).await.unwrap();

        assert_eq!(result, HashMap::from([(a, true), (b, false), (c, true)]));
        assert_eq!(*requested.lock().unwrap(), vec![vec![c]]);
        assert_eq!(cache.existence_many(&[c]).await.unwrap().get(&c), Some(&true));
    }

    #[tokio::test]
    async fn test_fully_cached_batch_makes_no_downstream_call() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let cache = entity_cache::<UserInfo>();
        cache
            .store_existence_many(&HashMap::from([(a, true), (b, true)]))
            .await
            .unwrap();
        let client = FakeClient::new();
        let calls = client.calls.clone();
        let gateway = CacheAsideGateway::new(client, cache);

        let result = gateway.check_exist(&[a, b, a]).await.unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unresolved_id_defaults_false_and_is_not_cached() {
        let id = Uuid::new_v4();
        let cache = entity_cache::<ProductInfo>();
        let gateway = CacheAsideGateway::new(FakeClient::new(), cache.clone());

        assert!(!gateway.exists(id).await.unwrap());
        assert!(cache.existence_many(&[id]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_false_is_cached() {
        let id = Uuid::new_v4();
        let cache = entity_cache::<ProductInfo>();
        let mut client = FakeClient::new();
        client.existence.insert(id, false);
        let gateway = CacheAsideGateway::new(client, cache.clone());

        assert!(!gateway.exists(id).await.unwrap());
        assert_eq!(cache.existence_many(&[id]).await.unwrap().get(&id), Some(&false));
    }

    #[tokio::test]
    async fn test_unavailable_downstream_fails_existence() {
        let id = Uuid::new_v4();
        let cache = entity_cache::<UserInfo>();
        let mut client = FakeClient::new();
        client.unavailable = true;
        let gateway = CacheAsideGateway::new(client, cache.clone());

        let err = gateway.check_exist(&[id]).await.unwrap_err();

        assert!(err.is_unavailable());
        assert!(cache.existence_many(&[id]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_failure_degrades_to_downstream() {
        let id = Uuid::new_v4();
        let store = CacheStore::new(Arc::new(BrokenBackend));
        let cache = EntityCache::<ProductInfo>::with_ttls(store, Duration::from_secs(60), Duration::from_secs(300));
        let mut client = FakeClient::new();
        client.existence.insert(id, true);
        client.infos.insert(id, product(id, "Chair"));
        let gateway = CacheAsideGateway::new(client, cache);

        assert!(gateway.exists(id).await.unwrap());
        assert_eq!(gateway.fetch_info(&[id]).await[&id].name, "Chair");
        assert_eq!(gateway.info(id).await.unwrap().name, "Chair");
    }

    #[tokio::test]
    async fn test_empty_request_is_empty_result() {
        let client = FakeClient::<UserInfo>::new();
        let calls = client.calls.clone();
        let gateway = CacheAsideGateway::new(client, entity_cache());

        assert!(gateway.check_exist(&[]).await.unwrap().is_empty());
        assert!(gateway.fetch_info(&[]).await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    // == Info ==
    #[tokio::test]
    async fn test_info_merges_hits_and_fresh_records() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let cache = entity_cache::<ProductInfo>();
        cache.store_info(&product(a, "Cached")).await.unwrap();
        let mut client = FakeClient::new();
        client.infos.insert(b, product(b, "Fresh"));
        let requested = client.requested.clone();
        let gateway = CacheAsideGateway::new(client, cache.clone());

        let result = gateway.fetch_info(&[a, b]).await;

        assert_eq!(result[&a].name, "Cached");
        assert_eq!(result[&b].name, "Fresh");
        assert_eq!(*requested.lock().unwrap(), vec![vec![b]]);
        assert!(cache.info(b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_info_placeholders_returned_but_not_cached() {
        let id = Uuid::new_v4();
        let cache = entity_cache::<ProductInfo>();
        let mut client = FakeClient::new();
        client.unavailable = true;
        let gateway = CacheAsideGateway::new(client, cache.clone());

        let result = gateway.fetch_info(&[id]).await;

        assert!(result[&id].is_placeholder());
        assert_eq!(cache.info(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_product_gets_no_info_record() {
        let id = Uuid::new_v4();
        let gateway = CacheAsideGateway::new(FakeClient::<ProductInfo>::new(), entity_cache());

        let result = gateway.fetch_info(&[id]).await;

        assert_eq!(result[&id], ProductInfo::no_info(id));
        assert_eq!(gateway.info(id).await, Some(ProductInfo::no_info(id)));
    }

    #[tokio::test]
    async fn test_missing_user_is_omitted() {
        let (known, unknown) = (Uuid::new_v4(), Uuid::new_v4());
        let mut client = FakeClient::new();
        client.infos.insert(known, user(known));
        let gateway = CacheAsideGateway::new(client, entity_cache());

        let result = gateway.fetch_info(&[known, unknown]).await;

        assert_eq!(result.len(), 1);
        assert!(result.contains_key(&known));
        assert_eq!(gateway.info(unknown).await, None);
    }

    #[tokio::test]
    async fn test_single_info_caches_real_record() {
        let id = Uuid::new_v4();
        let cache = entity_cache::<UserInfo>();
        let mut client = FakeClient::new();
        client.infos.insert(id, user(id));
        let calls = client.calls.clone();
        let gateway = CacheAsideGateway::new(client, cache);

        assert!(gateway.info(id).await.is_some());
        assert!(gateway.info(id).await.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // == Properties ==
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        // **Property: Existence Result Key Set**
        // Whatever mix of cached, known and unknown ids is requested, the
        // result has exactly one entry per distinct requested id, and at most
        // one downstream call is made.
        #[test]
        fn prop_existence_keys_equal_request(
            cached in prop::collection::vec(any::<bool>(), 0..10),
            known in prop::collection::vec(any::<bool>(), 0..10),
            unknown in 0usize..10,
            duplicate in any::<bool>()
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let cache = entity_cache::<ProductInfo>();
                let mut client = FakeClient::new();
                let mut ids = Vec::new();

                let cached_flags: HashMap<Uuid, bool> =
                    cached.iter().map(|e| (Uuid::new_v4(), *e)).collect();
                cache.store_existence_many(&cached_flags).await.unwrap();
                ids.extend(cached_flags.keys().copied());

                for exists in &known {
                    let id = Uuid::new_v4();
                    client.existence.insert(id, *exists);
                    ids.push(id);
                }
                ids.extend((0..unknown).map(|_| Uuid::new_v4()));
                if duplicate && !ids.is_empty() {
                    ids.push(ids[0]);
                }

                let calls = client.calls.clone();
                let gateway = CacheAsideGateway::new(client, cache);
                let result = gateway.check_exist(&ids).await.unwrap();

                let expected: HashSet<Uuid> = ids.iter().copied().collect();
                let actual: HashSet<Uuid> = result.keys().copied().collect();
                prop_assert_eq!(actual, expected);
                prop_assert!(calls.load(Ordering::SeqCst) <= 1);
                for (id, exists) in &cached_flags {
                    prop_assert_eq!(result[id], *exists);
                }
                Ok(())
            })?;
        }
    }
}
