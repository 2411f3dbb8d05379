//! Broker Connection Manager
//!
//! Owns the single broker connection of the process. Startup connects with a
//! bounded retry; afterwards channels are handed out on demand and a dropped
//! connection is re-established lazily on the next request.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{BrokerChannel, BrokerConnection, BrokerConnector};
use super::memory::InMemoryBroker;
use crate::config::{BrokerConfig, BrokerTransport};
use crate::error::{BrokerError, GatewayError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner {
    connection: Option<Arc<dyn BrokerConnection>>,
    shut_down: bool,
}

pub struct BrokerConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    retries: u32,
    retry_delay: Duration,
    inner: Mutex<Inner>,
    state: watch::Sender<ConnectionState>,
}

impl BrokerConnectionManager {
    // == Constructor ==
    /// `retries` counts attempts after the first one.
    pub fn new(connector: Arc<dyn BrokerConnector>, retries: u32, retry_delay: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            retries,
            retry_delay,
            inner: Mutex::new(Inner {
                connection: None,
                shut_down: false,
            }),
            state,
        }
    }

    pub fn from_config(connector: Arc<dyn BrokerConnector>, config: &BrokerConfig) -> Self {
        Self::new(connector, config.connect_retries, config.connect_retry_delay)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    // == Initialize ==
    /// Connects, retrying connection failures up to the configured count with
    /// a fixed delay. Other errors and cancellation end the loop at once.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            return Err(BrokerError::ShutDown);
        }
        if inner.connection.as_ref().is_some_and(|c| c.is_open()) {
            return Ok(());
        }

        let attempts = self.retries.saturating_add(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return Err(BrokerError::Cancelled);
            }

            self.set_state(ConnectionState::Connecting);
            match self.connector.connect().await {
                Ok(connection) => {
                    inner.connection = Some(connection);
                    self.set_state(ConnectionState::Connected);
                    info!(broker = %self.connector.describe(), attempt, "Broker connected");
                    return Ok(());
                }
                Err(e) if e.is_connection_failure() => {
                    self.set_state(ConnectionState::Disconnected);
                    warn!(attempt, attempts, error = %e, "Broker connection attempt failed");
                    last = e.to_string();
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        error!(attempts, "Broker unreachable, giving up");
        Err(BrokerError::StartupExhausted { attempts, last })
    }

    // == Create Channel ==
    /// Opens a channel, reconnecting first if the connection is gone.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            return Err(BrokerError::ShutDown);
        }

        let connection = match inner.connection.as_ref().filter(|c| c.is_open()) {
            Some(connection) => Arc::clone(connection),
            None => {
                info!(broker = %self.connector.describe(), "Broker connection lost, reconnecting");
                inner.connection = None;
                self.set_state(ConnectionState::Connecting);
                match self.connector.connect().await {
                    Ok(connection) => {
                        inner.connection = Some(Arc::clone(&connection));
                        self.set_state(ConnectionState::Connected);
                        connection
                    }
                    Err(e) => {
                        self.set_state(ConnectionState::Disconnected);
                        return Err(e);
                    }
                }
            }
        };

        match connection.create_channel().await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                if e.is_connection_failure() {
                    inner.connection = None;
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// Re-reads the connection and updates the state if it dropped.
    ///
    /// Returns the last known state while a connect is in progress.
    pub async fn check(&self) -> ConnectionState {
        let Ok(inner) = self.inner.try_lock() else {
            return self.state();
        };
        let connected = inner.connection.as_ref().is_some_and(|c| c.is_open());
        if !connected && self.state() == ConnectionState::Connected {
            warn!("Broker connection dropped");
            self.set_state(ConnectionState::Disconnected);
        }
        self.state()
    }

    // == Shutdown ==
    /// Closes the connection. Safe to call more than once; no channels are
    /// issued afterwards.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            return;
        }
        inner.shut_down = true;

        if let Some(connection) = inner.connection.take() {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "Broker connection did not close cleanly");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Broker connection closed");
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Broker connection state changed");
        }
    }
}

/// Builds the connector for the configured transport.
pub fn connector_from_config(
    config: &BrokerConfig,
) -> Result<Arc<dyn BrokerConnector>, GatewayError> {
    match config.transport {
        BrokerTransport::Memory => Ok(Arc::new(InMemoryBroker::new())),
        #[cfg(feature = "amqp")]
        BrokerTransport::Amqp => Ok(Arc::new(super::amqp::AmqpConnector::new(
            config.url.clone(),
        ))),
        #[cfg(not(feature = "amqp"))]
        BrokerTransport::Amqp => Err(GatewayError::Config(
            "the amqp broker transport requires the `amqp` feature".to_string(),
        )),
    }
}
