//! Downstream Module
//!
//! Network calls to the users and products services, made through each
//! service's policy pipeline.
//!
//! Existence checks fail hard when the service is unavailable; info lookups
//! never fail and fall back to placeholder records instead.

mod http;

pub use http::HttpDownstreamClient;

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{EntityInfo, ProductInfo, UserInfo};

/// Raw lookups against one downstream service.
#[async_trait]
pub trait DownstreamClient: Send + Sync + 'static {
    type Info: EntityInfo;

    /// Service name used in errors and log fields.
    fn service(&self) -> &'static str;

    /// Batched existence check. Returns `DownstreamUnavailable` when the
    /// service cannot give an answer.
    async fn check_exist(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, bool>>;

    /// Batched info lookup. On unavailability every requested id gets an
    /// "unavailable" placeholder record.
    async fn fetch_info(&self, ids: &[Uuid]) -> Vec<Self::Info>;

    /// Single info lookup. `None` when the service reports the id unknown.
    async fn fetch_one(&self, id: Uuid) -> Option<Self::Info>;
}

pub type UsersClient = HttpDownstreamClient<UserInfo>;
pub type ProductsClient = HttpDownstreamClient<ProductInfo>;

/// Placeholder records for ids whose downstream could not answer.
pub fn unavailable_placeholders<I: EntityInfo>(ids: &[Uuid]) -> Vec<I> {
    ids.iter().copied().map(I::unavailable).collect()
}
