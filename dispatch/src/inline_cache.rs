//! Host-side fast path in front of `grr_cache::Index`.
//!
//! The original keeps this table inline in translated code: every indirect
//! branch checks a small number of probes itself before falling back to a
//! full index lookup. This translator's blocks always return control to the
//! dispatcher on every exit (see `grr_translate::abi_emit::dispatcher_return`
//! and the design note in `DESIGN.md`'s `grr-dispatch` entry), so there is no
//! JIT'd code left to inline the check into; the dispatcher's lookup loop
//! consults this structure itself before it goes to the index hashmap,
//! caching a block's packed `CacheValue` rather than the bare offset.
//!
//! Slot selection still follows the spec's indirect-branch-site predictor:
//! the table is hashed by the PC of the instruction that branched *into* a
//! lookup (`last_branch_pc mod N`), not by the target being looked up, since
//! that's what `N`/`P` are sized to bound collisions on. A slot's probes are
//! then searched for the matching target `CacheKey`.

use grr_core::{Addr32, CacheKey, CacheValue};

/// Number of hash slots.
pub const N: usize = 2048;
/// Probes per slot.
pub const P: usize = 4;

#[derive(Clone, Copy, Default)]
struct Entry {
    key: CacheKey,
    value: CacheValue,
}

pub struct InlineCache {
    slots: Vec<[Entry; P]>,
    next_probe: Vec<u8>,
}

impl InlineCache {
    pub fn new() -> Self {
        InlineCache {
            slots: vec![[Entry::default(); P]; N],
            next_probe: vec![0; N],
        }
    }

    fn hash(last_branch_pc: Addr32) -> usize {
        (last_branch_pc as usize) % N
    }

    pub fn lookup(&self, last_branch_pc: Addr32, key: CacheKey) -> Option<CacheValue> {
        self.slots[Self::hash(last_branch_pc)]
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value)
    }

    /// Inserts `key -> value` into the slot `last_branch_pc` hashes to,
    /// overwriting the slot's oldest entry (tracked by a rotating per-slot
    /// counter rather than real LRU, the same cheap policy the original
    /// uses).
    pub fn insert(&mut self, last_branch_pc: Addr32, key: CacheKey, value: CacheValue) {
        let idx = Self::hash(last_branch_pc);
        let probe = self.next_probe[idx] as usize % P;
        self.slots[idx][probe] = Entry { key, value };
        self.next_probe[idx] = self.next_probe[idx].wrapping_add(1);
    }

    pub fn remove(&mut self, last_branch_pc: Addr32, key: CacheKey) {
        let idx = Self::hash(last_branch_pc);
        for e in self.slots[idx].iter_mut() {
            if e.key == key {
                *e = Entry::default();
            }
        }
    }

    /// Invalidates every entry. Called whenever a patch is applied, a
    /// trace is finalized, or a fault rewrites an `Index` entry — any
    /// event that can make a cached value stale.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = [Entry::default(); P];
        }
        for p in self.next_probe.iter_mut() {
            *p = 0;
        }
    }
}

impl Default for InlineCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(cache_offset: u32) -> CacheValue {
        CacheValue { cache_offset, ..Default::default() }
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let mut ic = InlineCache::new();
        let key = CacheKey::new(0x1000, 1, 0);
        ic.insert(0x400, key, value(64));
        assert_eq!(ic.lookup(0x400, key), Some(value(64)));
    }

    #[test]
    fn miss_on_unknown_key() {
        let ic = InlineCache::new();
        assert_eq!(ic.lookup(0x400, CacheKey::new(0x2000, 1, 0)), None);
    }

    #[test]
    fn miss_when_branch_site_hashes_elsewhere() {
        let mut ic = InlineCache::new();
        let key = CacheKey::new(0x1000, 1, 0);
        ic.insert(0x400, key, value(64));
        assert_eq!(ic.lookup(0x400 + N as u32, key), None);
    }

    #[test]
    fn fifth_insert_into_same_slot_evicts_oldest() {
        let mut ic = InlineCache::new();
        // Four branch sites all hashing to slot 0 (a multiple of N), a
        // fifth wraps the rotating probe counter back onto the first.
        let sites: Vec<Addr32> = (0..5u32).map(|i| i * N as u32).collect();
        let keys: Vec<CacheKey> = (0..5u32).map(|i| CacheKey::new(0x1000 + i, 1, i)).collect();
        for (site, key) in sites[..4].iter().zip(&keys[..4]) {
            ic.insert(*site, *key, value(1));
        }
        ic.insert(sites[4], keys[4], value(2));
        assert_eq!(ic.lookup(sites[0], keys[0]), None);
        assert_eq!(ic.lookup(sites[4], keys[4]), Some(value(2)));
        assert_eq!(ic.lookup(sites[1], keys[1]), Some(value(1)));
    }

    #[test]
    fn clear_empties_every_slot() {
        let mut ic = InlineCache::new();
        let key = CacheKey::new(0x3000, 1, 0);
        ic.insert(0x400, key, value(8));
        ic.clear();
        assert_eq!(ic.lookup(0x400, key), None);
    }
}
