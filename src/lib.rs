//! Lookup Gateway - cached, resilient lookups of users and products
//!
//! Batched cache-aside access to the users and products services behind
//! retry, circuit breaker, timeout and bulkhead policies, with the product
//! cache kept fresh by broker events.

pub mod api;
pub mod cache;
pub mod config;
pub mod downstream;
pub mod error;
pub mod gateway;
pub mod messaging;
pub mod models;
pub mod policy;
pub mod tasks;

pub use api::{create_router, AppState};
pub use config::Config;
pub use error::{GatewayError, Result};
pub use tasks::{spawn_cleanup_task, ConsumerSet};
