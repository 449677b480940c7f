use core::hash::{Hash as StdHash, Hasher};
use std::collections::hash_map::DefaultHasher;

/// Fixed-capacity keyed slot table with linear probing.
///
/// Every routing table in the core is one of these: the capacity is chosen
/// at construction, storage is allocated once, and insertion into a full
/// table either refuses or evicts the oldest entry as the caller decides.
/// Probes start at the key's hash and wrap; removal leaves no tombstones
/// because lookups scan at most `capacity` slots.
pub struct FixedTable<K, V> {
    slots: Vec<Option<(K, V)>>,
    used: usize,
}

impl<K: Copy + Eq + StdHash, V> FixedTable<K, V> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, used: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used >= self.slots.len()
    }

    fn probe_start(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.slots.len().max(1)
    }

    fn position(&self, key: &K) -> Option<usize> {
        let capacity = self.slots.len();
        if capacity == 0 {
            return None;
        }
        let start = self.probe_start(key);
        for offset in 0..capacity {
            let index = (start + offset) % capacity;
            if let Some((slot_key, _)) = &self.slots[index] {
                if slot_key == key {
                    return Some(index);
                }
            }
        }
        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.position(key).is_some()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.position(key).and_then(|index| self.slots[index].as_ref()).map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.position(key)?;
        self.slots[index].as_mut().map(|(_, value)| value)
    }

    /// Insert or replace. Refuses when the table is full and the key is
    /// new; eviction policy stays with the caller.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), (K, V)> {
        if let Some(index) = self.position(&key) {
            self.slots[index] = Some((key, value));
            return Ok(());
        }
        if self.is_full() {
            return Err((key, value));
        }

        let capacity = self.slots.len();
        let start = self.probe_start(&key);
        for offset in 0..capacity {
            let index = (start + offset) % capacity;
            if self.slots[index].is_none() {
                self.slots[index] = Some((key, value));
                self.used += 1;
                return Ok(());
            }
        }
        unreachable!("non-full table has a free slot");
    }

    /// Insert, evicting the entry with the smallest `age_of` value when
    /// the table is full.
    pub fn insert_or_evict_oldest<F>(&mut self, key: K, value: V, age_of: F) -> Option<(K, V)>
    where
        F: Fn(&V) -> f64,
    {
        match self.insert(key, value) {
            Ok(()) => None,
            Err((key, value)) => {
                let oldest = self.oldest_key(&age_of)?;
                let evicted = self.remove(&oldest).map(|old_value| (oldest, old_value));
                let _ = self.insert(key, value);
                evicted
            }
        }
    }

    pub fn oldest_key<F>(&self, age_of: F) -> Option<K>
    where
        F: Fn(&V) -> f64,
    {
        self.slots
            .iter()
            .flatten()
            .min_by(|(_, lhs), (_, rhs)| {
                age_of(lhs).partial_cmp(&age_of(rhs)).unwrap_or(core::cmp::Ordering::Equal)
            })
            .map(|(key, _)| *key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.position(key)?;
        let (_, value) = self.slots[index].take()?;
        self.used -= 1;
        Some(value)
    }

    /// Keep only the entries the predicate accepts; the sweep-time removal
    /// pattern every periodic job uses.
    pub fn retain<F>(&mut self, mut predicate: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        for slot in self.slots.iter_mut() {
            if let Some((key, value)) = slot {
                if !predicate(key, value) {
                    *slot = None;
                    self.used -= 1;
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().flatten().map(|(key, value)| (key, value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.slots.iter_mut().flatten().map(|(key, value)| (&*key, value))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.slots.iter().flatten().map(|(_, value)| value)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.slots.iter_mut().flatten().map(|(_, value)| value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.slots.iter().flatten().map(|(key, _)| key)
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::FixedTable;

    #[test]
    fn insert_refuses_when_full() {
        let mut table: FixedTable<u32, &str> = FixedTable::new(2);
        table.insert(1, "one").expect("insert");
        table.insert(2, "two").expect("insert");
        assert!(table.insert(3, "three").is_err());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn replace_does_not_grow() {
        let mut table: FixedTable<u32, &str> = FixedTable::new(2);
        table.insert(1, "one").expect("insert");
        table.insert(1, "uno").expect("replace");
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&1), Some(&"uno"));
    }

    #[test]
    fn evict_oldest_picks_smallest_timestamp() {
        let mut table: FixedTable<u32, f64> = FixedTable::new(2);
        table.insert(1, 100.0).expect("insert");
        table.insert(2, 50.0).expect("insert");

        let evicted = table.insert_or_evict_oldest(3, 200.0, |stamp| *stamp);
        assert_eq!(evicted, Some((2, 50.0)));
        assert!(table.contains_key(&1));
        assert!(table.contains_key(&3));
    }

    #[test]
    fn remove_keeps_other_entries_reachable() {
        let mut table: FixedTable<u32, u32> = FixedTable::new(8);
        for key in 0..8 {
            table.insert(key, key * 10).expect("insert");
        }
        table.remove(&3);
        for key in (0..8).filter(|key| *key != 3) {
            assert_eq!(table.get(&key), Some(&(key * 10)), "key {} lost", key);
        }
    }

    #[test]
    fn retain_sweeps_in_place() {
        let mut table: FixedTable<u32, u32> = FixedTable::new(8);
        for key in 0..8 {
            table.insert(key, key).expect("insert");
        }
        table.retain(|_, value| *value % 2 == 0);
        assert_eq!(table.len(), 4);
        assert!(table.contains_key(&0));
        assert!(!table.contains_key(&1));
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        let mut table: FixedTable<u32, f64> = FixedTable::new(4);
        for key in 0..64u32 {
            table.insert_or_evict_oldest(key, key as f64, |stamp| *stamp);
            assert!(table.len() <= table.capacity());
        }
        assert_eq!(table.len(), 4);
    }
}
