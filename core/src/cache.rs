//! Thread-safe LRU caches with configured capacity.
//!
//! Used for schemas, stored ABIs, smart-contract records and resolved
//! verifiers. Entries are only inserted from post-commit hooks so a rolled
//! back database write can never pollute a cache.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Capacity knob for a single cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries retained. Oldest-accessed entries are
    /// evicted first.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 1_000 }
    }
}

/// A mutex-wrapped LRU map.
///
/// The lock is held only for the duration of a get/set, and values are
/// cloned out, so contention stays negligible for the cache-sized values
/// we store (Arc-wrapped records).
pub struct Cache<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, V>>,
    capacity: usize,
}

impl<K: Hash + Eq, V: Clone> Cache<K, V> {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity clamped to >= 1"),
            )),
            capacity,
        }
    }

    /// Returns a clone of the cached value, promoting it to most-recent.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Inserts or replaces the value for `key`.
    pub fn set(&self, key: K, value: V) {
        self.inner.lock().put(key, value);
    }

    /// Removes an entry, returning it if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key)
    }

    /// The configured maximum entry count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_remove() {
        let cache: Cache<String, u64> = Cache::new(CacheConfig { capacity: 10 });
        assert!(cache.get(&"a".to_string()).is_none());

        cache.set("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        cache.set("a".to_string(), 2);
        assert_eq!(cache.get(&"a".to_string()), Some(2));

        assert_eq!(cache.remove(&"a".to_string()), Some(2));
        assert!(cache.get(&"a".to_string()).is_none());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache: Cache<u32, u32> = Cache::new(CacheConfig { capacity: 2 });
        cache.set(1, 10);
        cache.set(2, 20);

        // Touch 1 so that 2 becomes the eviction candidate.
        assert_eq!(cache.get(&1), Some(10));
        cache.set(3, 30);

        assert_eq!(cache.get(&1), Some(10));
        assert!(cache.get(&2).is_none());
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cache: Cache<u32, u32> = Cache::new(CacheConfig { capacity: 0 });
        assert_eq!(cache.capacity(), 1);
        cache.set(1, 1);
        assert_eq!(cache.get(&1), Some(1));
    }
}
