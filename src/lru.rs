//! Bounded LRU map used by the block cache, the sequential-access detector,
//! and the inode reader's offset/readahead caches.
//!
//! Promotion and eviction are O(log n) via an access-stamp index.  Eviction
//! invokes an optional prune hook (the block cache uses it for statistics).

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

pub struct LruMap<K, V> {
    capacity: usize,
    next_stamp: u64,
    map: HashMap<K, (u64, V)>,
    order: BTreeMap<u64, K>,
}

impl<K: Eq + Hash + Clone, V> LruMap<K, V> {
    /// `capacity` of zero is clamped to one; a cache that can hold nothing
    /// cannot make forward progress.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_stamp: 0,
            map: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Look up without promoting.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.map.get(key).map(|(_, v)| v)
    }

    /// Look up and promote to most-recently-used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.map.contains_key(key) {
            self.promote(key);
        }
        self.map.get(key).map(|(_, v)| v)
    }

    fn promote(&mut self, key: &K) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        if let Some((old, _)) = self.map.get(key) {
            let old = *old;
            self.order.remove(&old);
            self.order.insert(stamp, key.clone());
            self.map.get_mut(key).unwrap().0 = stamp;
        }
    }

    /// Insert or update `key`, promoting it.  Returns the evicted entry if
    /// the map was at capacity.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some((stamp, _)) = self.map.get(&key) {
            let stamp = *stamp;
            self.order.remove(&stamp);
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.order.insert(stamp, key.clone());
        self.map.insert(key, (stamp, value));

        if self.map.len() > self.capacity {
            self.pop_lru()
        } else {
            None
        }
    }

    /// Remove and return the least-recently-used entry.
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        let (&stamp, _) = self.order.iter().next()?;
        let key = self.order.remove(&stamp)?;
        let (_, value) = self.map.remove(&key)?;
        Some((key, value))
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (stamp, value) = self.map.remove(key)?;
        self.order.remove(&stamp);
        Some(value)
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    /// Iterate entries in unspecified order, without promoting.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter().map(|(k, (_, v))| (k, v))
    }

    /// Remove every entry for which `pred` returns true; returns how many
    /// were removed.  Used by the cache tidy pass.
    pub fn retain_or_count<F: FnMut(&K, &V) -> bool>(&mut self, mut pred: F) -> usize {
        let doomed: Vec<K> = self
            .map
            .iter()
            .filter(|(k, (_, v))| pred(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            self.remove(k);
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut lru = LruMap::new(2);
        assert!(lru.insert(1, "a").is_none());
        assert!(lru.insert(2, "b").is_none());
        // touch 1 so 2 becomes LRU
        assert_eq!(lru.get(&1), Some(&"a"));
        let evicted = lru.insert(3, "c").unwrap();
        assert_eq!(evicted.0, 2);
        assert!(lru.contains(&1));
        assert!(lru.contains(&3));
    }

    #[test]
    fn capacity_one_still_works() {
        let mut lru = LruMap::new(0); // clamped to 1
        assert_eq!(lru.capacity(), 1);
        lru.insert(1, ());
        let evicted = lru.insert(2, ()).unwrap();
        assert_eq!(evicted.0, 1);
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn reinsert_updates_value_and_order() {
        let mut lru = LruMap::new(2);
        lru.insert(1, "a");
        lru.insert(2, "b");
        lru.insert(1, "a2");
        let evicted = lru.insert(3, "c").unwrap();
        assert_eq!(evicted.0, 2);
        assert_eq!(lru.peek(&1), Some(&"a2"));
    }

    #[test]
    fn retain_or_count_removes_matches() {
        let mut lru = LruMap::new(8);
        for i in 0..6 {
            lru.insert(i, i * 10);
        }
        let removed = lru.retain_or_count(|_, v| *v >= 30);
        assert_eq!(removed, 3);
        assert_eq!(lru.len(), 3);
    }
}
