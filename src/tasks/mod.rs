//! Background Tasks Module
//!
//! Long-lived tasks started at boot and stopped at shutdown.
//!
//! # Tasks
//! - TTL Cleanup: sweeps expired entries out of the in-memory cache
//! - Invalidation consumers: apply product events to the cache

mod cleanup;
mod consumers;

pub use cleanup::spawn_cleanup_task;
pub use consumers::ConsumerSet;
