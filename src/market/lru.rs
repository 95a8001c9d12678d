use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

pub const DEFAULT_CAPACITY: usize = 10;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    stamp: u64,
}

/// Least-recently-used store bounded by entry count.
///
/// Access order is tracked with a monotonically increasing stamp per entry;
/// the smallest stamp is the eviction victim.
#[derive(Debug)]
pub struct BoundedCache<K, V> {
    capacity: usize,
    next_stamp: u64,
    slots: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_stamp: 0,
            slots: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn has(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let stamp = self.bump_stamp();
        let slot = self.slots.get_mut(key)?;
        self.order.remove(&slot.stamp);
        slot.stamp = stamp;
        self.order.insert(stamp, key.clone());
        Some(&slot.value)
    }

    /// Reads without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.slots.get(key).map(|slot| &slot.value)
    }

    /// Inserts or replaces `key`, promoting it to most recently used. Returns
    /// the entry evicted to make room, if any.
    pub fn set(&mut self, key: K, value: V) -> Option<(K, V)> {
        let stamp = self.bump_stamp();

        if let Some(slot) = self.slots.get_mut(&key) {
            self.order.remove(&slot.stamp);
            slot.stamp = stamp;
            slot.value = value;
            self.order.insert(stamp, key);
            return None;
        }

        let evicted = if self.slots.len() >= self.capacity {
            self.evict_lru()
        } else {
            None
        };

        self.order.insert(stamp, key.clone());
        self.slots.insert(key, Slot { value, stamp });
        evicted
    }

    pub fn delete(&mut self, key: &K) -> Option<V> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.stamp);
        Some(slot.value)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.values()
    }

    fn evict_lru(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.slots.remove(&key)?;
        Some((key, slot.value))
    }

    fn bump_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp = self.next_stamp.wrapping_add(1);
        stamp
    }
}

impl<K, V> Default for BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
