//! Fixed-capacity LRU cache for estimated moments.
//!
//! Entries live in a preallocated arena of slots; an index maps keys to
//! slots and a monotonically increasing tick records recency. When full,
//! the least recently used slot is overwritten in place.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::estimate::Moments;
use crate::fingerprint::Fingerprint;

/// Default number of cached `(window, fingerprint)` entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 32;

/// Cache key: rolling-window size plus the fingerprint of the data used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub window: usize,
    pub fingerprint: Fingerprint,
}

/// Hit/miss/eviction counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct Slot {
    key: CacheKey,
    value: Arc<Moments>,
    last_used: u64,
}

/// Bounded least-recently-used map from [`CacheKey`] to [`Moments`].
#[derive(Debug)]
pub struct CovarianceCache {
    capacity: usize,
    slots: Vec<Slot>,
    index: FxHashMap<CacheKey, usize>,
    tick: u64,
    stats: CacheStats,
}

impl CovarianceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            slots: Vec::with_capacity(capacity),
            index: FxHashMap::default(),
            tick: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains_key(key)
    }

    /// Look up `key`, marking it most recently used on a hit.
    pub fn get(&mut self, key: &CacheKey) -> Option<Arc<Moments>> {
        self.tick += 1;
        match self.index.get(key) {
            Some(&i) => {
                self.stats.hits += 1;
                let slot = &mut self.slots[i];
                slot.last_used = self.tick;
                Some(Arc::clone(&slot.value))
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Insert (or replace) `key`, evicting the least recently used entry if full.
    pub fn insert(&mut self, key: CacheKey, value: Moments) -> Arc<Moments> {
        self.tick += 1;
        let value = Arc::new(value);

        if let Some(&i) = self.index.get(&key) {
            let slot = &mut self.slots[i];
            slot.value = Arc::clone(&value);
            slot.last_used = self.tick;
            return value;
        }

        let slot = Slot {
            key,
            value: Arc::clone(&value),
            last_used: self.tick,
        };

        if self.slots.len() < self.capacity {
            self.index.insert(key, self.slots.len());
            self.slots.push(slot);
            return value;
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.last_used)
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.index.remove(&self.slots[victim].key);
        self.index.insert(key, victim);
        self.slots[victim] = slot;
        self.stats.evictions += 1;
        value
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }
}

impl Default for CovarianceCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
