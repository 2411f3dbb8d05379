//! Lookup Gateway - cached, resilient lookups of users and products
//!
//! Serves batched existence and info lookups over HTTP and keeps the product
//! cache fresh from broker events.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lookup_gateway::cache::{CacheStore, MemoryBackend};
use lookup_gateway::config::{BrokerTransport, CacheBackendKind, CacheConfig};
use lookup_gateway::error::BrokerError;
use lookup_gateway::messaging::{connector_from_config, BrokerConnectionManager};
use lookup_gateway::{create_router, spawn_cleanup_task, AppState, Config, ConsumerSet};

/// Main entry point for the lookup gateway.
///
/// # Startup Sequence
/// 1. Initialize tracing and load configuration
/// 2. Build the cache store and, for the in-memory backend, its TTL sweep
/// 3. Connect to the broker (fatal once the startup retry is exhausted)
/// 4. Build the downstream clients and gateways
/// 5. Start the invalidation consumers
/// 6. Serve HTTP until SIGINT/SIGTERM, then drain consumers and close the broker
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to info for this crate and tower_http, overridable with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lookup_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting lookup gateway");

    let config = Config::from_env();
    config.validate()?;
    info!(
        port = config.server_port,
        cache_backend = ?config.cache.backend,
        broker_transport = ?config.broker.transport,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let (cache, memory) = build_cache(&config.cache).await?;
    let cleanup_handle = memory.map(|backend| {
        spawn_cleanup_task(backend, config.cache.cleanup_interval, shutdown.clone())
    });
    info!(backend = cache.backend_name(), "Cache store initialized");

    if config.broker.transport == BrokerTransport::Memory {
        warn!("Using the in-memory broker; product events from other services will not arrive");
    }
    let connector = connector_from_config(&config.broker)?;
    let broker = Arc::new(BrokerConnectionManager::from_config(connector, &config.broker));
    match broker.initialize(&shutdown).await {
        Ok(()) => {}
        Err(BrokerError::Cancelled) => {
            info!("Shutdown requested during startup");
            return Ok(());
        }
        Err(e) => {
            error!(error = %e, "Broker connection failed, aborting startup");
            return Err(e).context("broker startup failed");
        }
    }

    let state = AppState::from_config(&config, cache, Arc::clone(&broker))?;
    let consumers = ConsumerSet::start(
        Arc::clone(&broker),
        state.product_cache(),
        &config.broker,
        &shutdown,
    )
    .await
    .context("starting invalidation consumers")?;

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Server listening on http://{}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    consumers.stop_all(config.broker.shutdown_grace).await;
    broker.shutdown().await;
    if let Some(handle) = cleanup_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Cleanup task failed");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn build_cache(
    config: &CacheConfig,
) -> anyhow::Result<(CacheStore, Option<Arc<MemoryBackend>>)> {
    match config.backend {
        CacheBackendKind::Memory => {
            let (store, backend) = CacheStore::in_memory(config.max_entries);
            Ok((store, Some(backend)))
        }
        #[cfg(feature = "redis")]
        CacheBackendKind::Redis => {
            let backend = lookup_gateway::cache::RedisBackend::connect(&config.redis_url)
                .await
                .context("connecting to redis")?;
            Ok((CacheStore::new(Arc::new(backend)), None))
        }
        #[cfg(not(feature = "redis"))]
        CacheBackendKind::Redis => {
            anyhow::bail!("the redis cache backend requires the `redis` feature")
        }
    }
}

/// Waits for Ctrl+C or SIGTERM and cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
        _ = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}
