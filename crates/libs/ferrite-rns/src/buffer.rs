//! Pooled, reference-counted byte buffers.
//!
//! Payloads in this stack cluster between a few tens of bytes (hashes,
//! keepalives) and one kilobyte (announces, resource parts), so backing
//! storage comes from four pre-reserved capacity tiers. Acquisition picks
//! the smallest tier that fits; an exhausted tier falls back to the heap
//! and bumps a counter rather than borrowing from a larger tier. Release
//! returns storage to its tier, cleared but with capacity intact.
//!
//! A [`ByteBuf`] is a window over shared storage. Reads and sub-slices are
//! cheap; any write first ensures exclusive ownership, copying when the
//! storage is shared or windowed. The pool itself sits behind a mutex so
//! interface drivers on other threads can fill buffers, while everything
//! else in the core stays single-threaded.

use core::cmp::Ordering;
use core::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::RnsError;

pub const POOL_TIER_CAPACITIES: [usize; 4] = [64, 256, 512, 1024];
pub const POOL_TIER_SLOTS: [usize; 4] = [48, 24, 16, 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Tier64 = 0,
    Tier256 = 1,
    Tier512 = 2,
    Tier1024 = 3,
    /// Heap fallback; release is a no-op.
    None = 4,
}

impl Tier {
    fn fitting(len: usize) -> Option<Tier> {
        match len {
            0..=64 => Some(Tier::Tier64),
            65..=256 => Some(Tier::Tier256),
            257..=512 => Some(Tier::Tier512),
            513..=1024 => Some(Tier::Tier1024),
            _ => None,
        }
    }

    fn index(self) -> Option<usize> {
        match self {
            Tier::None => None,
            tier => Some(tier as usize),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub available: [usize; 4],
    pub fallbacks: u64,
    pub leaks: u64,
}

struct BufferPool {
    tiers: [Vec<Vec<u8>>; 4],
    fallbacks: u64,
    leaks: u64,
}

impl BufferPool {
    fn new() -> Self {
        let mut tiers: [Vec<Vec<u8>>; 4] = [Vec::new(), Vec::new(), Vec::new(), Vec::new()];
        for (index, stack) in tiers.iter_mut().enumerate() {
            stack.reserve(POOL_TIER_SLOTS[index]);
            for _ in 0..POOL_TIER_SLOTS[index] {
                stack.push(Vec::with_capacity(POOL_TIER_CAPACITIES[index]));
            }
        }
        Self { tiers, fallbacks: 0, leaks: 0 }
    }

    fn acquire(&mut self, len: usize) -> Option<(Vec<u8>, Tier)> {
        if let Some(tier) = Tier::fitting(len) {
            let index = tier as usize;
            // LIFO keeps recently-released storage cache-warm.
            if let Some(storage) = self.tiers[index].pop() {
                return Some((storage, tier));
            }
            self.fallbacks += 1;
            log::debug!("buffer: tier {} exhausted, heap fallback for {}B", index, len);
        }

        let mut storage = Vec::new();
        if storage.try_reserve(len).is_err() {
            log::warn!("buffer: heap allocation of {}B failed", len);
            return None;
        }
        Some((storage, Tier::None))
    }

    fn release(&mut self, mut storage: Vec<u8>, tier: Tier) {
        let Some(index) = tier.index() else {
            return;
        };
        if self.tiers[index].len() >= POOL_TIER_SLOTS[index] {
            // Returning to a full stack means acquire/release got unbalanced.
            self.leaks += 1;
            log::warn!("buffer: release to full tier {}", index);
            return;
        }
        storage.clear();
        self.tiers[index].push(storage);
    }

    fn stats(&self) -> PoolStats {
        let mut available = [0usize; 4];
        for (index, stack) in self.tiers.iter().enumerate() {
            available[index] = stack.len();
        }
        PoolStats { available, fallbacks: self.fallbacks, leaks: self.leaks }
    }
}

fn pool() -> &'static Mutex<BufferPool> {
    static POOL: OnceLock<Mutex<BufferPool>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(BufferPool::new()))
}

pub fn pool_stats() -> PoolStats {
    pool().lock().map(|pool| pool.stats()).unwrap_or_default()
}

/// Backing storage; the drop handler carries the tier so release is O(1).
struct Storage {
    data: Vec<u8>,
    tier: Tier,
}

impl Drop for Storage {
    fn drop(&mut self) {
        if self.tier != Tier::None {
            if let Ok(mut pool) = pool().lock() {
                pool.release(core::mem::take(&mut self.data), self.tier);
            }
        }
    }
}

/// Shared byte sequence with copy-on-write mutation.
///
/// An empty buffer is valid and distinct from the invalid sentinel returned
/// when the heap fallback itself fails; callers check [`ByteBuf::is_valid`]
/// after constructing from untrusted sizes.
pub struct ByteBuf {
    inner: Option<Arc<Storage>>,
    start: usize,
    end: usize,
    valid: bool,
}

impl ByteBuf {
    pub const fn new() -> Self {
        Self { inner: None, start: 0, end: 0, valid: true }
    }

    pub fn invalid() -> Self {
        Self { inner: None, start: 0, end: 0, valid: false }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        if data.is_empty() {
            return Self::new();
        }
        let Ok(mut guard) = pool().lock() else {
            return Self::invalid();
        };
        let Some((mut storage, tier)) = guard.acquire(data.len()) else {
            return Self::invalid();
        };
        drop(guard);
        storage.extend_from_slice(data);
        Self {
            inner: Some(Arc::new(Storage { data: storage, tier })),
            start: 0,
            end: data.len(),
            valid: true,
        }
    }

    pub fn from_hex(hex_string: &str) -> Result<Self, RnsError> {
        let decoded = hex::decode(hex_string).map_err(|_| RnsError::InvalidArgument)?;
        let buffer = Self::from_slice(&decoded);
        if buffer.is_valid() {
            Ok(buffer)
        } else {
            Err(RnsError::OutOfMemory)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.inner {
            Some(storage) => &storage.data[self.start..self.end],
            None => &[],
        }
    }

    pub fn byte_at(&self, index: usize) -> Option<u8> {
        self.as_slice().get(index).copied()
    }

    /// Cheap sub-slice sharing the backing storage.
    pub fn mid(&self, position: usize, len: usize) -> Self {
        let available = self.len();
        let position = position.min(available);
        let len = len.min(available - position);
        Self {
            inner: self.inner.clone(),
            start: self.start + position,
            end: self.start + position + len,
            valid: self.valid,
        }
    }

    pub fn left(&self, len: usize) -> Self {
        self.mid(0, len)
    }

    pub fn right(&self, len: usize) -> Self {
        let len = len.min(self.len());
        self.mid(self.len() - len, len)
    }

    pub fn push(&mut self, byte: u8) {
        self.append(&[byte]);
    }

    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if !self.ensure_exclusive(self.len() + data.len()) {
            return;
        }
        if let Some(storage) = self.inner.as_mut().and_then(Arc::get_mut) {
            storage.data.extend_from_slice(data);
            self.end = storage.data.len();
        }
    }

    pub fn clear(&mut self) {
        self.inner = None;
        self.start = 0;
        self.end = 0;
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_slice())
    }

    /// Make the storage exclusively owned with room for `needed` bytes and
    /// the window aligned to it. Copies when shared, windowed, or absent.
    fn ensure_exclusive(&mut self, needed: usize) -> bool {
        let window_is_whole = match &self.inner {
            Some(storage) => self.start == 0 && self.end == storage.data.len(),
            None => true,
        };
        let exclusive = match &self.inner {
            Some(storage) => Arc::strong_count(storage) == 1,
            None => false,
        };
        let fits = match &self.inner {
            Some(storage) => storage.data.capacity() >= needed,
            None => false,
        };

        if exclusive && window_is_whole && fits {
            return true;
        }

        let Ok(mut guard) = pool().lock() else {
            self.valid = false;
            return false;
        };
        let Some((mut storage, tier)) = guard.acquire(needed) else {
            self.valid = false;
            return false;
        };
        drop(guard);

        storage.extend_from_slice(self.as_slice());
        let len = storage.len();
        self.inner = Some(Arc::new(Storage { data: storage, tier }));
        self.start = 0;
        self.end = len;
        true
    }
}

impl Default for ByteBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ByteBuf {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), start: self.start, end: self.end, valid: self.valid }
    }
}

impl PartialEq for ByteBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ByteBuf {}

impl PartialOrd for ByteBuf {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByteBuf {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteBuf[{}B 0x{}]", self.len(), self.to_hex())
    }
}
