//! Gateway Module
//!
//! Batched cache-aside lookups of users and products.

mod cache_aside;
mod entity_cache;

pub use cache_aside::{CacheAsideGateway, ProductsGateway, UsersGateway};
pub use entity_cache::EntityCache;
