use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use grr_core::{CacheKey, CacheOffset};

use crate::code_cache::CodeCache;
use crate::index::Index;

/// A queued chain patch: `patch_offset` names the `rel32` field
/// immediately following a block's exit `JMP` opcode, waiting for
/// `target` to appear in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PatchPoint {
    patch_offset: CacheOffset,
    target: CacheKey,
}

/// Sweep the queue after every this-many additions, or on shutdown.
pub const PATCH_INTERVAL: usize = 64;

/// Maintains the bounded queue of pending chain patches and applies them
/// once their target block has been translated and indexed.
pub struct Patcher {
    queue: Vec<PatchPoint>,
    capacity: usize,
    persist_path: Option<PathBuf>,
    disabled: bool,
}

impl Patcher {
    pub fn new(capacity: usize) -> Self {
        Patcher {
            queue: Vec::with_capacity(capacity),
            capacity,
            persist_path: None,
            disabled: false,
        }
    }

    pub fn disabled() -> Self {
        let mut p = Self::new(0);
        p.disabled = true;
        p
    }

    pub fn load_persistent(path: &Path, capacity: usize) -> io::Result<Self> {
        let mut queue = Vec::new();
        if path.exists() {
            let mut file = File::open(path)?;
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            for chunk in bytes.chunks_exact(12) {
                let patch_offset = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
                let key = u64::from_le_bytes(chunk[4..12].try_into().unwrap());
                if key != 0 {
                    queue.push(PatchPoint { patch_offset, target: CacheKey::unpack(key) });
                }
            }
        }
        Ok(Patcher { queue, capacity, persist_path: Some(path.to_path_buf()), disabled: false })
    }

    /// Registers a new patch point, sweeping the queue every
    /// [`PATCH_INTERVAL`] additions.
    pub fn add_patch_point(&mut self, patch_offset: CacheOffset, target: CacheKey, index: &Index, cache: &mut CodeCache) -> bool {
        if self.disabled {
            return false;
        }

        let mut cleared_inline_cache = false;
        if !self.queue.is_empty() && self.queue.len() % PATCH_INTERVAL == 0 {
            cleared_inline_cache |= self.sweep(index, cache);
            if self.queue.len() >= self.capacity {
                self.queue.clear();
            }
        }

        self.queue.push(PatchPoint { patch_offset, target });
        cleared_inline_cache
    }

    /// Sweeps the queue: any patch whose target now resolves in the index
    /// is applied and dropped; the rest compact toward the front.
    /// Returns `true` if at least one patch was applied (the caller must
    /// then clear the inline cache).
    pub fn sweep(&mut self, index: &Index, cache: &mut CodeCache) -> bool {
        let mut kept = Vec::with_capacity(self.queue.len());
        let mut patched = false;

        for patch in self.queue.drain(..) {
            if let Some(value) = index.find(patch.target) {
                apply_patch(cache, patch.patch_offset, value.cache_offset);
                patched = true;
            } else {
                kept.push(patch);
            }
        }

        self.queue = kept;
        patched
    }

    pub fn shutdown(&mut self, index: &Index, cache: &mut CodeCache) -> io::Result<()> {
        self.sweep(index, cache);
        if let Some(path) = &self.persist_path {
            let mut file = File::create(path)?;
            for patch in &self.queue {
                file.write_all(&patch.patch_offset.to_le_bytes())?;
                file.write_all(&patch.target.pack().to_le_bytes())?;
            }
        }
        Ok(())
    }
}

/// Atomically writes `target_offset - (patch_offset + 4)` into the
/// `rel32` field at `patch_offset`. Only called once per patch point by
/// construction (the patch is removed from the queue immediately after).
fn apply_patch(cache: &mut CodeCache, patch_offset: CacheOffset, target_offset: CacheOffset) {
    let rel32 = (target_offset as i64 - (patch_offset as i64 + 4)) as i32;
    cache.commit(patch_offset, &rel32.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use grr_core::CacheValue;

    #[test]
    fn patch_applies_once_target_is_indexed() {
        let mut cache = CodeCache::new().unwrap();
        let jmp_off = cache.reserve(5).unwrap(); // JMP rel32 opcode + placeholder
        cache.commit(jmp_off, &[0xE9, 0, 0, 0, 0]);
        let rel32_off = jmp_off + 1;

        let mut index = Index::new();
        let mut patcher = Patcher::new(128);

        let target_key = CacheKey::new(0x5000, 1, 0);
        let cleared = patcher.add_patch_point(rel32_off, target_key, &index, &mut cache);
        assert!(!cleared);

        let target_block_off = cache.reserve(8).unwrap();
        index.insert(target_key, CacheValue { cache_offset: target_block_off, ..Default::default() });

        assert!(patcher.sweep(&index, &mut cache));

        let written = unsafe { std::slice::from_raw_parts(cache.offset_to_ptr(rel32_off), 4) };
        let rel32 = i32::from_le_bytes(written.try_into().unwrap());
        assert_eq!(rel32, target_block_off as i64 as i32 - (rel32_off as i64 + 4) as i32);
    }
}
