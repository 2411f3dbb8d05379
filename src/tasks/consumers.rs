//! Invalidation Consumers
//!
//! Starts the three product-event consumers together and stops them together.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::gateway::EntityCache;
use crate::messaging::{
    BrokerConnectionManager, ConsumerHandle, EventConsumer, ProductDeleted,
    ProductDeletedHandler, ProductNameUpdated, ProductNameUpdatedHandler, ProductUpdated,
    ProductUpdatedHandler,
};
use crate::models::ProductInfo;

pub struct ConsumerSet {
    handles: Vec<ConsumerHandle>,
}

impl ConsumerSet {
    /// Starts one consumer per product event. If any fails to start, the
    /// ones already running are stopped and the error is returned.
    pub async fn start(
        connection: Arc<BrokerConnectionManager>,
        products: EntityCache<ProductInfo>,
        config: &BrokerConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self, BrokerError> {
        let mut set = Self {
            handles: Vec::with_capacity(3),
        };

        let updated = EventConsumer::<ProductUpdated, _>::new(
            Arc::clone(&connection),
            Arc::new(ProductUpdatedHandler::new(products.clone())),
            config,
        )
        .start(shutdown)
        .await;
        set.push_or_unwind(updated, config.shutdown_grace).await?;

        let deleted = EventConsumer::<ProductDeleted, _>::new(
            Arc::clone(&connection),
            Arc::new(ProductDeletedHandler::new(products.clone())),
            config,
        )
        .start(shutdown)
        .await;
        set.push_or_unwind(deleted, config.shutdown_grace).await?;

        let renamed = EventConsumer::<ProductNameUpdated, _>::new(
            connection,
            Arc::new(ProductNameUpdatedHandler::new(products)),
            config,
        )
        .start(shutdown)
        .await;
        set.push_or_unwind(renamed, config.shutdown_grace).await?;

        info!(count = set.len(), "Invalidation consumers running");
        Ok(set)
    }

    async fn push_or_unwind(
        &mut self,
        started: Result<ConsumerHandle, BrokerError>,
        grace: Duration,
    ) -> Result<(), BrokerError> {
        match started {
            Ok(handle) => {
                self.handles.push(handle);
                Ok(())
            }
            Err(e) => {
                let running = std::mem::take(&mut self.handles);
                Self { handles: running }.stop_all(grace).await;
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn queues(&self) -> Vec<&'static str> {
        self.handles.iter().map(ConsumerHandle::queue).collect()
    }

    /// Stops every consumer concurrently, each with the same grace period.
    pub async fn stop_all(self, grace: Duration) {
        let mut stopping = JoinSet::new();
        for handle in self.handles {
            stopping.spawn(handle.stop(grace));
        }
        while stopping.join_next().await.is_some() {}
        info!("Invalidation consumers stopped");
    }
}
