//! LRU Tracker Module
//!
//! Implements Least Recently Used tracking for in-memory cache eviction.

use std::collections::{BTreeMap, HashMap};

// == LRU Tracker ==
/// Tracks access order for the LRU eviction strategy.
///
/// Every touch stamps the key with a monotonically increasing tick. The
/// smallest tick in `order` is the least recently used key, so touch, remove
/// and evict are all logarithmic.
#[derive(Debug, Default)]
pub struct LruTracker {
    /// key -> tick of its last access
    ticks: HashMap<String, u64>,
    /// tick -> key, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
}

impl LruTracker {
    // == Constructor ==
    /// Creates a new empty LRU tracker.
    pub fn new() -> Self {
        Self::default()
    }

    // == Touch ==
    /// Marks a key as most recently used, tracking it if it is new.
    pub fn touch(&mut self, key: &str) {
        let tick = self.next_tick;
        self.next_tick += 1;

        if let Some(previous) = self.ticks.insert(key.to_string(), tick) {
            self.order.remove(&previous);
        }
        self.order.insert(tick, key.to_string());
    }

    // == Remove ==
    /// Stops tracking a key. Unknown keys are ignored.
    pub fn remove(&mut self, key: &str) {
        if let Some(tick) = self.ticks.remove(key) {
            self.order.remove(&tick);
        }
    }

    // == Evict Oldest ==
    /// Returns and removes the least recently used key.
    pub fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.ticks.remove(&key);
        Some(key)
    }

    /// Returns the least recently used key without removing it.
    pub fn peek_oldest(&self) -> Option<&String> {
        self.order.first_key_value().map(|(_, key)| key)
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.ticks.contains_key(key)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_new() {
        let lru = LruTracker::new();
        assert!(lru.is_empty());
        assert_eq!(lru.peek_oldest(), None);
    }

    #[test]
    fn test_lru_touch_existing_key_moves_it_last() {
        let mut lru = LruTracker::new();
        lru.touch("existence:product:a");
        lru.touch("existence:product:b");
        lru.touch("existence:product:c");

        lru.touch("existence:product:a");

        assert_eq!(lru.len(), 3);
        assert_eq!(lru.peek_oldest(), Some(&"existence:product:b".to_string()));
    }

    #[test]
    fn test_lru_evict_order_after_touches() {
        let mut lru = LruTracker::new();
        lru.touch("a");
        lru.touch("b");
        lru.touch("c");
        lru.touch("a");
        lru.touch("c");
        lru.touch("b");

        assert_eq!(lru.evict_oldest(), Some("a".to_string()));
        assert_eq!(lru.evict_oldest(), Some("c".to_string()));
        assert_eq!(lru.evict_oldest(), Some("b".to_string()));
        assert_eq!(lru.evict_oldest(), None);
    }

    #[test]
    fn test_lru_remove() {
        let mut lru = LruTracker::new();
        lru.touch("key1");
        lru.touch("key2");

        lru.remove("key1");
        lru.remove("nonexistent");

        assert_eq!(lru.len(), 1);
        assert!(!lru.contains("key1"));
        assert_eq!(lru.evict_oldest(), Some("key2".to_string()));
    }

    #[test]
    fn test_lru_touch_same_key_multiple_times() {
        let mut lru = LruTracker::new();
        lru.touch("key1");
        lru.touch("key1");
        lru.touch("key1");

        assert_eq!(lru.len(), 1);
        assert_eq!(lru.evict_oldest(), Some("key1".to_string()));
        assert!(lru.is_empty());
    }
}
