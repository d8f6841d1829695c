//! Bounded time-keyed cache
//!
//! Entries expire `ttl` seconds after insertion. Expiry is checked on read;
//! there is no background eviction task. When the cache is full, expired
//! entries are purged first and then the oldest entry is dropped.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::clock::Clock;

struct Entry<V> {
    value: V,
    inserted_at: i64,
}

pub struct TtlCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    ttl: i64,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl_secs: u64, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
            capacity: capacity.max(1),
            clock,
        }
    }

    /// Get a live entry. Expired entries are removed and reported as missing.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) => now - entry.inserted_at >= self.ttl,
            None => return None,
        };

        if expired {
            self.entries.remove(key);
            return None;
        }

        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        // ttl of zero disables caching entirely
        if self.ttl <= 0 {
            return;
        }

        let now = self.clock.now();
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.purge_expired(now);
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }

        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
    }

    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge_expired(&mut self, now: i64) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now - entry.inserted_at < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache(ttl: u64, capacity: usize) -> (ManualClock, TtlCache<String, u32>) {
        let clock = ManualClock::new(1_000);
        let cache = TtlCache::new(ttl, capacity, Arc::new(clock.clone()));
        (clock, cache)
    }

    #[test]
    fn test_entry_visible_before_ttl() {
        let (clock, mut cache) = cache(30, 8);
        cache.insert("a".into(), 1);
        clock.advance(29);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn test_entry_evicted_on_read_after_ttl() {
        let (clock, mut cache) = cache(30, 8);
        cache.insert("a".into(), 1);
        clock.advance(30);
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let (clock, mut cache) = cache(300, 2);
        cache.insert("a".into(), 1);
        clock.advance(1);
        cache.insert("b".into(), 2);
        clock.advance(1);
        cache.insert("c".into(), 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.get(&"b".to_string()), Some(2));
        assert_eq!(cache.get(&"c".to_string()), Some(3));
    }

    #[test]
    fn test_full_cache_purges_expired_before_dropping_live() {
        let (clock, mut cache) = cache(10, 2);
        cache.insert("old".into(), 1);
        clock.advance(5);
        cache.insert("live".into(), 2);
        clock.advance(6);
        cache.insert("new".into(), 3);

        assert_eq!(cache.get(&"live".to_string()), Some(2));
        assert_eq!(cache.get(&"new".to_string()), Some(3));
    }

    #[test]
    fn test_zero_ttl_disables_cache() {
        let (_clock, mut cache) = cache(0, 8);
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn test_invalidate() {
        let (_clock, mut cache) = cache(30, 8);
        cache.insert("a".into(), 1);
        cache.invalidate(&"a".to_string());
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn test_huge_ttl_does_not_wrap() {
        let (clock, mut cache) = cache(u64::MAX, 8);
        cache.insert("a".into(), 1);
        clock.advance(1_000_000);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn test_clear() {
        let (_clock, mut cache) = cache(30, 8);
        cache.insert("a".into(), 1);
        cache.insert("b".into(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
