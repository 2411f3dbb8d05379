//! Messaging Module
//!
//! Broker transports, the connection manager, and the consumers that keep
//! the product cache in step with catalog events.

#[cfg(feature = "amqp")]
mod amqp;
mod broker;
mod connection;
mod consumer;
mod handlers;
mod memory;
mod messages;

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use broker::{
    Acknowledge, BrokerChannel, BrokerConnection, BrokerConnector, Delivery, QueueOptions,
};
pub use connection::{connector_from_config, BrokerConnectionManager, ConnectionState};
pub use consumer::{ConsumerHandle, EventConsumer, MessageHandler};
pub use handlers::{ProductDeletedHandler, ProductNameUpdatedHandler, ProductUpdatedHandler};
pub use memory::{InMemoryBroker, MemoryBrokerStats};
pub use messages::{
    decode_case_insensitive, BrokerMessage, ProductDeleted, ProductNameUpdated, ProductUpdated,
};
