//! API Handlers
//!
//! HTTP request handlers for the lookup endpoints and the operational ones.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{extract::State, Json};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::config::Config;
use crate::downstream::{DownstreamClient, ProductsClient, UsersClient};
use crate::error::{GatewayError, Result};
use crate::gateway::{CacheAsideGateway, EntityCache, ProductsGateway, UsersGateway};
use crate::messaging::BrokerConnectionManager;
use crate::models::{
    ExistsResponse, HealthResponse, IdsRequest, InfoResponse, ProductInfo, StatsResponse,
    UserInfo,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<UsersGateway>,
    pub products: Arc<ProductsGateway>,
    pub cache: CacheStore,
    pub broker: Arc<BrokerConnectionManager>,
}

impl AppState {
    pub fn new(
        users: UsersGateway,
        products: ProductsGateway,
        cache: CacheStore,
        broker: Arc<BrokerConnectionManager>,
    ) -> Self {
        Self {
            users: Arc::new(users),
            products: Arc::new(products),
            cache,
            broker,
        }
    }

    /// Builds both gateways over `cache` with the configured clients.
    pub fn from_config(
        config: &Config,
        cache: CacheStore,
        broker: Arc<BrokerConnectionManager>,
    ) -> Result<Self> {
        let users = CacheAsideGateway::new(
            UsersClient::users(&config.users)?,
            EntityCache::new(cache.clone(), &config.cache),
        );
        let products = CacheAsideGateway::new(
            ProductsClient::products(&config.products)?,
            EntityCache::new(cache.clone(), &config.cache),
        );
        Ok(Self::new(users, products, cache, broker))
    }

    /// The product cache view shared with the invalidation consumers.
    pub fn product_cache(&self) -> EntityCache<ProductInfo> {
        self.products.cache().clone()
    }
}

fn validated(req: &IdsRequest) -> Result<()> {
    match req.validate() {
        Some(message) => Err(GatewayError::InvalidRequest(message)),
        None => Ok(()),
    }
}

/// Records in request order, one per distinct id that resolved.
fn in_request_order<I>(ids: &[Uuid], mut found: HashMap<Uuid, I>) -> Vec<I> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .filter(|id| seen.insert(**id))
        .filter_map(|id| found.remove(id))
        .collect()
}

async fn exists<C: DownstreamClient>(
    gateway: &CacheAsideGateway<C>,
    req: IdsRequest,
) -> Result<Json<ExistsResponse>> {
    validated(&req)?;
    let exists = gateway.check_exist(&req.ids).await?;
    Ok(Json(ExistsResponse { exists }))
}

async fn by_ids<C: DownstreamClient>(
    gateway: &CacheAsideGateway<C>,
    req: IdsRequest,
) -> Result<Json<InfoResponse<C::Info>>> {
    validated(&req)?;
    let found = gateway.fetch_info(&req.ids).await;
    Ok(Json(InfoResponse::new(in_request_order(&req.ids, found))))
}

/// Handler for POST /lookups/users/exists
pub async fn users_exists_handler(
    State(state): State<AppState>,
    Json(req): Json<IdsRequest>,
) -> Result<Json<ExistsResponse>> {
    exists(&state.users, req).await
}

/// Handler for POST /lookups/users/by-ids
///
/// Users nobody could resolve are left out of the response.
pub async fn users_by_ids_handler(
    State(state): State<AppState>,
    Json(req): Json<IdsRequest>,
) -> Result<Json<InfoResponse<UserInfo>>> {
    by_ids(&state.users, req).await
}

/// Handler for POST /lookups/products/exists
pub async fn products_exists_handler(
    State(state): State<AppState>,
    Json(req): Json<IdsRequest>,
) -> Result<Json<ExistsResponse>> {
    exists(&state.products, req).await
}

/// Handler for POST /lookups/products/by-ids
///
/// Every requested product gets a record; unresolved ones carry "No Info".
pub async fn products_by_ids_handler(
    State(state): State<AppState>,
    Json(req): Json<IdsRequest>,
) -> Result<Json<InfoResponse<ProductInfo>>> {
    by_ids(&state.products, req).await
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.cache.stats().await;
    Json(StatsResponse::new(state.cache.backend_name(), &stats))
}

/// Handler for GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let broker = state.broker.check().await;
    Json(HealthResponse::from_broker_state(broker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_request_order_dedupes_and_skips_missing() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let found = HashMap::from([(a, "a"), (c, "c")]);

        let ordered = in_request_order(&[c, b, a, c], found);
        assert_eq!(ordered, vec!["c", "a"]);
    }

    #[test]
    fn test_validated_rejects_empty_ids() {
        let err = validated(&IdsRequest { ids: vec![] }).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }
}
