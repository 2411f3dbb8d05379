//! Cache Entry Module
//!
//! Defines the structure for individual in-memory cache entries with TTL support.

use std::time::Duration;

use tokio::time::Instant;

// == Cache Entry ==
/// A serialized value held by the in-memory backend, with its expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The stored JSON payload
    pub value: String,
    /// When the entry was written
    pub created_at: Instant,
    /// When the entry stops being readable, None = no expiration
    pub expires_at: Option<Instant>,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new cache entry with optional TTL.
    pub fn new(value: String, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once the current time reaches its expiration time,
    /// so a fully elapsed TTL never reads as live.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => Instant::now() >= expires,
            None => false,
        }
    }

    // == Expire ==
    /// Sets or replaces the expiry, counted from now.
    pub fn expire_in(&mut self, ttl: Duration) {
        self.expires_at = Some(Instant::now() + ttl);
    }

    // == Time To Live ==
    /// Returns the remaining TTL, or None if no expiration is set.
    ///
    /// Returns `Some(Duration::ZERO)` once the entry has expired.
    pub fn ttl_remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires| expires.saturating_duration_since(Instant::now()))
    }
}
