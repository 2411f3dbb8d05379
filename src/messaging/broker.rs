//! Broker Transport Module
//!
//! The slice of AMQP 0-9-1 the consumers need: exchanges, queues, bindings
//! and manual-ack consumption. Each transport implements these traits; the
//! rest of the crate only sees trait objects.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared and kept when the last consumer leaves.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Rejects the delivery; with `requeue` it goes back to the queue.
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

// == Delivery ==
/// One message handed to a consumer. It stays unacknowledged until `ack` or
/// `nack` is called or its channel closes.
pub struct Delivery {
    pub tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        tag: u64,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            tag,
            routing_key: routing_key.into(),
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("routing_key", &self.routing_key)
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

// == Transport Traits ==
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares a direct exchange: a message reaches every queue bound with
    /// exactly its routing key.
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Registers a manual-ack consumer on `queue`. Deliveries arrive on the
    /// returned receiver until the channel closes.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>, BrokerError>;

    /// Closes the channel; its unacknowledged deliveries return to their
    /// queues.
    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}

/// Opens connections to one broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;

    /// Where the connector points, without credentials.
    fn describe(&self) -> String;
}
