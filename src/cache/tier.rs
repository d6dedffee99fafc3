//! Size-bounded LRU store backing L1 and L2

use std::hash::Hash;

use lru::LruCache;

/// Anything that can be charged against a byte budget
pub trait Weighted {
    fn weight(&self) -> usize;
}

impl<T: Weighted> Weighted for std::sync::Arc<T> {
    fn weight(&self) -> usize {
        (**self).weight()
    }
}

/// LRU bounded by entry count and, optionally, by total bytes.
///
/// Both bounds hold after every mutation; whatever had to go is handed back
/// to the caller, least recently used first.
pub struct SizedLru<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    max_entries: usize,
    max_bytes: Option<usize>,
    bytes: usize,
}

impl<K: Hash + Eq + Clone, V: Weighted> SizedLru<K, V> {
    #[must_use]
    pub fn new(max_entries: usize, max_bytes: Option<usize>) -> Self {
        Self {
            entries: LruCache::unbounded(),
            max_entries,
            max_bytes,
            bytes: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    #[must_use]
    pub fn max_bytes(&self) -> Option<usize> {
        self.max_bytes
    }

    /// Fill level in `[0, 1]`, the larger of the two bounds
    #[must_use]
    pub fn utilization(&self) -> f64 {
        let by_count = if self.max_entries == 0 {
            1.0
        } else {
            self.entries.len() as f64 / self.max_entries as f64
        };
        let by_bytes = match self.max_bytes {
            Some(0) => 1.0,
            Some(max) => self.bytes as f64 / max as f64,
            None => 0.0,
        };
        by_count.max(by_bytes)
    }

    /// Looks up and marks as most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Looks up without touching recency.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.peek(key)
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Inserts as most recently used and returns whatever was evicted to
    /// stay within bounds. A replaced value for the same key is not
    /// reported as evicted.
    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        self.bytes += value.weight();
        if let Some(old) = self.entries.put(key.clone(), value) {
            self.bytes -= old.weight();
        }
        self.enforce()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.pop(key)?;
        self.bytes -= value.weight();
        Some(value)
    }

    /// Removes every entry whose key fails `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) -> Vec<(K, V)> {
        let doomed: Vec<K> = self
            .entries
            .iter()
            .filter(|(k, v)| !keep(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|k| self.remove(&k).map(|v| (k, v)))
            .collect()
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    /// Changes the bounds, evicting down to them immediately.
    pub fn set_limits(&mut self, max_entries: usize, max_bytes: Option<usize>) -> Vec<(K, V)> {
        self.max_entries = max_entries;
        self.max_bytes = max_bytes;
        self.enforce()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.bytes = 0;
        count
    }

    fn over_limit(&self) -> bool {
        self.entries.len() > self.max_entries
            || self.max_bytes.is_some_and(|max| self.bytes > max)
    }

    fn enforce(&mut self) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        while self.over_limit() {
            let Some((key, value)) = self.entries.pop_lru() else {
                break;
            };
            self.bytes -= value.weight();
            evicted.push((key, value));
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Blob(usize);

    impl Weighted for Blob {
        fn weight(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn entry_bound_evicts_lru() {
        let mut lru = SizedLru::new(2, None);
        assert!(lru.insert(1, Blob(1)).is_empty());
        assert!(lru.insert(2, Blob(1)).is_empty());
        lru.get(&1);
        let evicted = lru.insert(3, Blob(1));
        assert_eq!(evicted.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec![2]);
        assert!(lru.contains(&1) && lru.contains(&3));
    }

    #[test]
    fn byte_bound_evicts_until_fits() {
        let mut lru = SizedLru::new(10, Some(100));
        lru.insert(1, Blob(40));
        lru.insert(2, Blob(40));
        let evicted = lru.insert(3, Blob(50));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, 1);
        assert_eq!(lru.bytes(), 90);
        assert!(lru.bytes() <= 100);
    }

    #[test]
    fn replace_adjusts_bytes() {
        let mut lru = SizedLru::new(4, Some(100));
        lru.insert(1, Blob(30));
        assert!(lru.insert(1, Blob(10)).is_empty());
        assert_eq!(lru.bytes(), 10);
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn shrinking_limits_evicts() {
        let mut lru = SizedLru::new(4, None);
        for k in 0..4 {
            lru.insert(k, Blob(1));
        }
        let evicted = lru.set_limits(1, None);
        assert_eq!(evicted.len(), 3);
        assert!(lru.contains(&3));
    }

    #[test]
    fn retain_and_peek() {
        let mut lru = SizedLru::new(8, None);
        for k in 0..6 {
            lru.insert(k, Blob(k));
        }
        let removed = lru.retain(|k, _| k % 2 == 0);
        assert_eq!(removed.len(), 3);
        assert_eq!(lru.bytes(), 6);
        assert!(lru.peek(&4).is_some());
        assert!((lru.utilization() - 3.0 / 8.0).abs() < 1e-9);
    }
}
