//! Cache Key Module
//!
//! Key layout shared by the request path and the invalidation path:
//! `{purpose}:{entity}:{id}`.

use std::fmt;

use uuid::Uuid;

/// What a cache entry holds for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachePurpose {
    /// A boolean existence flag
    Existence,
    /// A full info record
    Info,
}

impl CachePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachePurpose::Existence => "existence",
            CachePurpose::Info => "info",
        }
    }
}

impl fmt::Display for CachePurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the cache key for one entity id.
pub fn cache_key(purpose: CachePurpose, entity: &str, id: &Uuid) -> String {
    format!("{}:{}:{}", purpose, entity, id)
}

/// Recovers the entity id from a key built by [`cache_key`].
pub fn parse_id(key: &str) -> Option<Uuid> {
    key.rsplit(':').next().and_then(|id| Uuid::parse_str(id).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_layout() {
        let id = Uuid::nil();
        assert_eq!(
            cache_key(CachePurpose::Existence, "product", &id),
            "existence:product:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            cache_key(CachePurpose::Info, "user", &id),
            "info:user:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_parse_id_roundtrip() {
        let id = Uuid::new_v4();
        let key = cache_key(CachePurpose::Info, "product", &id);
        assert_eq!(parse_id(&key), Some(id));
        assert_eq!(parse_id("info:product:not-a-uuid"), None);
    }
}
