//! Redis Backend Module
//!
//! Cache backend over a shared Redis instance. Values are stored as JSON
//! strings; batch reads use `MGET` and batch writes use `MSET` followed by a
//! pipelined `EXPIRE` per key.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::cache::{CacheBackend, CacheStats, MAX_KEY_LENGTH};
use crate::error::CacheError;

/// Redis-backed cache storage.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connects to `url`. The connection manager reconnects on its own after
    /// the initial connection succeeds.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(backend_error)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(backend_error)?;
        tracing::info!(url = %url, "Connected to Redis cache");
        Ok(Self { conn })
    }
}

fn backend_error(err: redis::RedisError) -> CacheError {
    CacheError::Backend(err.to_string())
}

/// Redis rejects `EX 0`; sub-second TTLs round up to one second.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(backend_error)?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;
        Ok(values)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(CacheError::KeyTooLong(MAX_KEY_LENGTH));
        }
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl_secs(ttl))
                .await
                .map_err(backend_error),
            None => conn.set::<_, _, ()>(key, value).await.map_err(backend_error),
        }
    }

    async fn set_many(
        &self,
        entries: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> Result<Vec<String>, CacheError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();

        let mut mset = redis::cmd("MSET");
        for (key, value) in &entries {
            mset.arg(key).arg(value);
        }
        let _: () = mset.query_async(&mut conn).await.map_err(backend_error)?;

        let Some(ttl) = ttl else {
            return Ok(Vec::new());
        };

        let mut pipe = redis::pipe();
        for (key, _) in &entries {
            pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(ttl));
        }
        let applied: Result<Vec<i64>, _> = pipe.query_async(&mut conn).await;

        let keys = entries.into_iter().map(|(key, _)| key);
        match applied {
            Ok(flags) => Ok(keys
                .zip(flags)
                .filter(|(_, applied)| *applied != 1)
                .map(|(key, _)| key)
                .collect()),
            Err(err) => {
                tracing::warn!(error = %err, "EXPIRE pipeline failed");
                Ok(keys.collect())
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(backend_error)?;
        Ok(removed > 0)
    }

    /// Redis keeps its own counters; only the store-level ones are reported.
    async fn stats(&self) -> CacheStats {
        CacheStats::new()
    }
}
