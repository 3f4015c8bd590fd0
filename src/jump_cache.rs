//! Original to translated address cache.
//!
//! The indirect jump and return resolvers consult it before asking the translator. Each slot
//! packs the original address (low half) and the translated address (high half) into one
//! atomic word, so readers never see a torn entry. Entries are never invalidated: a lookup only
//! hits if the stored original address matches, a colliding address is a miss.

#[cfg(not(feature = "shuttle-test"))]
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "shuttle-test")]
use shuttle::sync::atomic::{AtomicU64, Ordering};

/// Number of cache slots
pub const JMP_CACHE_SIZE: usize = 0x10000;
/// Size of the cache in the thread context, two dwords per slot
pub const JMP_CACHE_BYTES: u32 = (JMP_CACHE_SIZE * 8) as u32;

/// Slot of an original address
pub fn hash_index(addr: u32) -> usize {
    (((addr >> 2).wrapping_mul(0x9E37_79B1) >> 16) as usize) & (JMP_CACHE_SIZE - 1)
}

fn pack(addr: u32, jit_addr: u32) -> u64 {
    (jit_addr as u64) << 32 | addr as u64
}

fn unpack(entry: u64) -> (u32, u32) {
    (entry as u32, (entry >> 32) as u32)
}

/// Lock free direct mapped cache
pub struct JumpCache {
    entries: Box<[AtomicU64]>,
}

impl Default for JumpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JumpCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let used = (0..JMP_CACHE_SIZE)
            .filter(|index| self.slot(*index).is_some())
            .count();
        f.debug_struct("JumpCache").field("used", &used).finish()
    }
}

impl JumpCache {
    /// An empty cache
    pub fn new() -> Self {
        Self {
            entries: (0..JMP_CACHE_SIZE).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Translated address of `addr`, if cached
    pub fn lookup(&self, addr: u32) -> Option<u32> {
        let (cached, jit_addr) = unpack(self.entries[hash_index(addr)].load(Ordering::Acquire));
        (jit_addr != 0 && cached == addr).then_some(jit_addr)
    }

    /// Caches a translation, replacing whatever occupied the slot
    pub fn insert(&self, addr: u32, jit_addr: u32) {
        self.entries[hash_index(addr)].store(pack(addr, jit_addr), Ordering::Release);
    }

    /// Contents of a slot as `(original, translated)`
    pub fn slot(&self, index: usize) -> Option<(u32, u32)> {
        let (addr, jit_addr) = unpack(self.entries[index].load(Ordering::Acquire));
        (jit_addr != 0).then_some((addr, jit_addr))
    }
}
