//! Cache invalidation handlers for product events.

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

use super::consumer::MessageHandler;
use super::messages::{ProductDeleted, ProductNameUpdated, ProductUpdated};
use crate::gateway::EntityCache;
use crate::models::ProductInfo;

/// Overwrites the cached product info. Existence flags are left alone.
pub struct ProductUpdatedHandler {
    cache: EntityCache<ProductInfo>,
}

impl ProductUpdatedHandler {
    pub fn new(cache: EntityCache<ProductInfo>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl MessageHandler<ProductUpdated> for ProductUpdatedHandler {
    async fn handle(&self, message: ProductUpdated) -> anyhow::Result<()> {
        let product = ProductInfo::from(message);
        self.cache
            .store_info(&product)
            .await
            .with_context(|| format!("caching updated product {}", product.id))?;
        info!(product_id = %product.id, "Product info refreshed from event");
        Ok(())
    }
}

/// Drops the cached info and records the product as not existing.
pub struct ProductDeletedHandler {
    cache: EntityCache<ProductInfo>,
}

impl ProductDeletedHandler {
    pub fn new(cache: EntityCache<ProductInfo>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl MessageHandler<ProductDeleted> for ProductDeletedHandler {
    async fn handle(&self, message: ProductDeleted) -> anyhow::Result<()> {
        self.cache
            .mark_deleted(message.product_id)
            .await
            .with_context(|| format!("invalidating deleted product {}", message.product_id))?;
        info!(product_id = %message.product_id, "Product marked deleted in cache");
        Ok(())
    }
}

/// Renames a cached product in place; uncached products are ignored.
pub struct ProductNameUpdatedHandler {
    cache: EntityCache<ProductInfo>,
}

impl ProductNameUpdatedHandler {
    pub fn new(cache: EntityCache<ProductInfo>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl MessageHandler<ProductNameUpdated> for ProductNameUpdatedHandler {
    async fn handle(&self, message: ProductNameUpdated) -> anyhow::Result<()> {
        let cached = self
            .cache
            .info(message.product_id)
            .await
            .context("reading cached product")?;

        let Some(mut product) = cached else {
            debug!(product_id = %message.product_id, "Renamed product not cached, nothing to do");
            return Ok(());
        };

        product.name = message.new_name;
        self.cache
            .store_info(&product)
            .await
            .with_context(|| format!("caching renamed product {}", product.id))?;
        info!(product_id = %product.id, name = %product.name, "Cached product renamed");
        Ok(())
    }
}
