use rns_core::hash::Hash;

/// Circular record of recently seen packet hashes.
///
/// Duplicate suppression only needs to hold the hostile-replay window of
/// the device, so the list is a ring: the newest insert overwrites the
/// oldest entry and membership is a linear scan. Outside the window a
/// duplicate passes again, which routing converges over.
pub struct PacketHashlist {
    ring: Vec<Option<Hash>>,
    next: usize,
}

impl PacketHashlist {
    pub fn new(capacity: usize) -> Self {
        let mut ring = Vec::with_capacity(capacity);
        ring.resize_with(capacity, || None);
        Self { ring, next: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    pub fn len(&self) -> usize {
        self.ring.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.ring.iter().flatten().any(|seen| seen == hash)
    }

    /// Record a hash; returns false when it was already present.
    pub fn insert(&mut self, hash: Hash) -> bool {
        if self.contains(&hash) {
            return false;
        }
        if self.ring.is_empty() {
            return true;
        }
        self.ring[self.next] = Some(hash);
        self.next = (self.next + 1) % self.ring.len();
        true
    }

    /// Drop the oldest entries until at most `keep` remain. Used by the
    /// low-memory sweep.
    pub fn trim_to(&mut self, keep: usize) {
        let held = self.len();
        if held <= keep {
            return;
        }
        let mut to_clear = held - keep;
        let capacity = self.ring.len();
        // `next` points at the oldest slot.
        let mut index = self.next;
        while to_clear > 0 {
            if self.ring[index].take().is_some() {
                to_clear -= 1;
            }
            index = (index + 1) % capacity;
        }
    }

    /// Oldest-to-newest snapshot for persistence.
    pub fn snapshot(&self) -> Vec<Hash> {
        let capacity = self.ring.len();
        let mut out = Vec::with_capacity(self.len());
        for offset in 0..capacity {
            if let Some(hash) = self.ring[(self.next + offset) % capacity] {
                out.push(hash);
            }
        }
        out
    }

    pub fn restore(&mut self, hashes: &[Hash]) {
        for hash in hashes {
            self.insert(*hash);
        }
    }
}
