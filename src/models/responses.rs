//! Response DTOs for the lookup API
//!
//! Defines the structure of outgoing HTTP response bodies.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::cache::CacheStats;
use crate::messaging::ConnectionState;

/// Response body for existence lookups.
///
/// Holds exactly one entry per distinct requested id.
#[derive(Debug, Clone, Serialize)]
pub struct ExistsResponse {
    pub exists: HashMap<Uuid, bool>,
}

/// Response body for info lookups.
#[derive(Debug, Clone, Serialize)]
pub struct InfoResponse<I> {
    /// Number of records returned
    pub count: usize,
    pub items: Vec<I>,
}

impl<I> InfoResponse<I> {
    pub fn new(items: Vec<I>) -> Self {
        Self {
            count: items.len(),
            items,
        }
    }
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Name of the active cache backend
    pub backend: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub self_healed: u64,
    pub ttl_failures: u64,
    pub total_entries: usize,
    /// Hit rate (hits / (hits + misses))
    pub hit_rate: f64,
}

impl StatsResponse {
    pub fn new(backend: &'static str, stats: &CacheStats) -> Self {
        Self {
            backend,
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            expirations: stats.expirations,
            self_healed: stats.self_healed,
            ttl_failures: stats.ttl_failures,
            total_entries: stats.total_entries,
            hit_rate: stats.hit_rate(),
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// "healthy" while the broker is connected, "degraded" otherwise
    pub status: String,
    pub broker: ConnectionState,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    pub fn from_broker_state(broker: ConnectionState) -> Self {
        let status = match broker {
            ConnectionState::Connected => "healthy",
            _ => "degraded",
        };
        Self {
            status: status.to_string(),
            broker,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
