pub mod settings;

use std::hash::Hash;

use indexmap::{IndexMap, IndexSet};

/// Number of entries kept after a compaction, never zero and never above capacity.
fn retained_len(capacity: usize, retain_ratio: f64) -> usize {
    let ratio = if retain_ratio.is_finite() {
        retain_ratio.clamp(0.0, 1.0)
    } else {
        1.0
    };
    ((capacity as f64 * ratio).floor() as usize).clamp(1, capacity)
}

/// Append-only membership set with FIFO compaction.
///
/// Once an insert pushes the size past `capacity`, only the most recently
/// inserted `capacity * retain_ratio` keys survive.
#[derive(Debug, Clone)]
pub struct BoundedSet<K> {
    entries: IndexSet<K>,
    capacity: usize,
    retain: usize,
}

impl<K: Hash + Eq> BoundedSet<K> {
    pub fn new(capacity: usize, retain_ratio: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: IndexSet::new(),
            capacity,
            retain: retained_len(capacity, retain_ratio),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Insert `key`, returning `false` if it was already present.
    pub fn insert(&mut self, key: K) -> bool {
        if !self.entries.insert(key) {
            return false;
        }
        if self.entries.len() > self.capacity {
            self.compact();
        }
        true
    }

    /// Forget `key`; used to roll back an insert whose side effect failed.
    pub fn remove(&mut self, key: &K) -> bool {
        self.entries.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn compact(&mut self) {
        let excess = self.entries.len().saturating_sub(self.retain);
        self.entries.drain(..excess);
    }
}

/// Insertion-ordered map with the same FIFO compaction as [`BoundedSet`].
///
/// Re-inserting an existing key replaces the value but keeps its original
/// position, so age is measured from first insertion.
#[derive(Debug, Clone)]
pub struct BoundedMap<K, V> {
    entries: IndexMap<K, V>,
    capacity: usize,
    retain: usize,
}

impl<K: Hash + Eq, V> BoundedMap<K, V> {
    pub fn new(capacity: usize, retain_ratio: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: IndexMap::new(),
            capacity,
            retain: retained_len(capacity, retain_ratio),
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.entries.insert(key, value);
        if self.entries.len() > self.capacity {
            let excess = self.entries.len().saturating_sub(self.retain);
            self.entries.drain(..excess);
        }
        previous
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    #[cfg(test)]
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.shift_remove(key)
    }

    /// Drop every entry for which `keep` returns false; returns how many went.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, v| keep(k, v));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
