//! TTL Cleanup Task
//!
//! Background task that periodically sweeps expired entries out of the
//! in-memory cache backend. Redis expires keys on its own and needs no sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::MemoryBackend;

/// Spawns the sweep. It runs every `interval` until `shutdown` is cancelled.
pub fn spawn_cleanup_task(
    backend: Arc<MemoryBackend>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(?interval, "Starting TTL cleanup task");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let removed = backend.cleanup_expired().await;
            if removed > 0 {
                info!(removed, "TTL cleanup removed expired entries");
            } else {
                debug!("TTL cleanup: no expired entries found");
            }
        }

        debug!("TTL cleanup task stopped");
    })
}
