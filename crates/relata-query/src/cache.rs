//! Result caching for resolved reads.
//!
//! Caches read results keyed by a hash of the resolved operation so repeated
//! reads avoid a backend round trip. The cache is never partially
//! invalidated: writers call [`ResultCache::clear`].

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// A cached read result.
#[derive(Debug, Clone)]
pub struct CachedResult<V> {
    pub value: V,
    /// Access tick of the most recent hit or insert.
    pub last_used: u64,
    /// Number of times this entry has been served.
    pub hit_count: u64,
}

/// LRU cache for resolved read results.
///
/// Keyed by a `u64` hash that callers compute with [`cache_key`]. When the
/// cache is full, the least-recently-used entry is evicted.
///
/// # Example
///
/// ```
/// use relata_query::cache::{ResultCache, cache_key};
///
/// let mut cache = ResultCache::new(100);
/// let key = cache_key(&("find", "Person", "{\"name\":\"ann\"}"));
/// assert!(cache.get(key).is_none());
///
/// cache.insert(key, vec![1, 2, 3]);
/// assert_eq!(cache.get(key), Some(vec![1, 2, 3]));
///
/// cache.clear();
/// assert!(cache.is_empty());
/// ```
#[derive(Debug)]
pub struct ResultCache<V> {
    entries: HashMap<u64, CachedResult<V>>,
    max_size: usize,
    tick: u64,
}

impl<V: Clone> ResultCache<V> {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(max_size.min(256)),
            max_size,
            tick: 0,
        }
    }

    /// Return a clone of the cached value, marking it as recently used.
    pub fn get(&mut self, key: u64) -> Option<V> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(&key).map(|entry| {
            entry.last_used = tick;
            entry.hit_count += 1;
            entry.value.clone()
        })
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: u64, value: V) {
        if self.max_size == 0 {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            self.evict_lru();
        }
        self.tick += 1;
        self.entries.insert(
            key,
            CachedResult {
                value,
                last_used: self.tick,
                hit_count: 0,
            },
        );
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_lru(&mut self) {
        if let Some((&lru_key, _)) = self.entries.iter().min_by_key(|(_, entry)| entry.last_used) {
            self.entries.remove(&lru_key);
        }
    }
}

/// Compute a cache key from any hashable value.
pub fn cache_key(value: &impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit() {
        let mut cache = ResultCache::new(10);
        cache.insert(1, "a".to_string());
        assert_eq!(cache.get(1).as_deref(), Some("a"));
        assert_eq!(cache.entries[&1].hit_count, 1);
    }

    #[test]
    fn test_cache_miss() {
        let mut cache: ResultCache<String> = ResultCache::new(10);
        assert!(cache.get(7).is_none());
        assert!(!cache.contains(7));
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = ResultCache::new(2);
        cache.insert(1, 10);
        cache.insert(2, 20);
        // Touch 1 so 2 becomes the eviction candidate
        assert_eq!(cache.get(1), Some(10));
        cache.insert(3, 30);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn test_zero_capacity_caches_nothing() {
        let mut cache = ResultCache::new(0);
        cache.insert(1, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut cache = ResultCache::new(10);
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_key_deterministic() {
        let a = cache_key(&("find", "Person", Some(3_usize)));
        let b = cache_key(&("find", "Person", Some(3_usize)));
        let c = cache_key(&("count", "Person", Some(3_usize)));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
