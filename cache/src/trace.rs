use grr_core::{CacheKey, CacheValue};

use crate::code_cache::CodeCache;
use crate::index::Index;

/// Longest chain of single-successor blocks a trace will coalesce.
pub const MAX_TRACE_ENTRIES: usize = 32;

#[derive(Clone, Copy)]
struct TraceEntry {
    key: CacheKey,
    value: CacheValue,
}

/// Accumulates the sequence of blocks actually dispatched, looking for a
/// run of single-successor blocks worth inlining into one superblock of
/// `CALL`/`JMP` stubs.
pub struct TraceRecorder {
    entries: Vec<TraceEntry>,
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceRecorder {
    pub fn new() -> Self {
        TraceRecorder { entries: Vec::with_capacity(MAX_TRACE_ENTRIES) }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records one dispatched block. Returns `true` when this entry ends
    /// the trace (the caller should then call [`Self::build`]).
    pub fn block_ends_trace(&mut self, key: CacheKey, value: CacheValue) -> bool {
        self.entries.push(TraceEntry { key, value });

        value.ends_with_syscall
            || value.ends_with_error
            || !value.has_one_successor
            || value.is_trace_block
            || self.entries.len() == MAX_TRACE_ENTRIES
    }

    /// Allocates a `trace_length * 5`-byte run of `CALL rel32`/`JMP rel32`
    /// stubs chaining every recorded block, rewrites the intermediate
    /// entries' `Index` values to point into the run, and clears the
    /// recorder for the next trace. Does nothing (and returns `false`) if
    /// fewer than two blocks were recorded, since a single-block trace has
    /// nothing to inline.
    pub fn build(&mut self, cache: &mut CodeCache, index: &mut Index) -> bool {
        let entries = std::mem::take(&mut self.entries);
        if entries.len() < 2 {
            return false;
        }

        let run_len = entries.len() * 5;
        let run_offset = match cache.reserve(run_len) {
            Ok(offset) => offset,
            Err(_) => return false,
        };

        let final_value = entries.last().unwrap().value;

        for (i, entry) in entries.iter().enumerate() {
            let stub_offset = run_offset + (i as u32) * 5;
            let target_offset = entry.value.cache_offset;
            let rel32 = target_offset as i64 - (stub_offset as i64 + 5);

            let opcode: u8 = if i + 1 == entries.len() { 0xE9 } else { 0xE8 };
            let mut bytes = [0u8; 5];
            bytes[0] = opcode;
            bytes[1..5].copy_from_slice(&(rel32 as i32).to_le_bytes());
            cache.commit(stub_offset, &bytes);
        }

        for (i, entry) in entries.iter().enumerate() {
            if i + 1 == entries.len() {
                continue;
            }
            let rewritten = CacheValue {
                block_pc32: final_value.block_pc32,
                cache_offset: run_offset + (i as u32) * 5,
                is_trace_head: i == 0,
                is_trace_block: true,
                has_one_successor: final_value.has_one_successor,
                ends_with_syscall: final_value.ends_with_syscall,
                ends_with_error: final_value.ends_with_error,
            };
            index.insert(entry.key, rewritten);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(cache_offset: u32, has_one_successor: bool) -> CacheValue {
        CacheValue {
            block_pc32: 0x1000,
            cache_offset,
            has_one_successor,
            ..Default::default()
        }
    }

    #[test]
    fn single_successor_chain_ends_and_inlines() {
        let mut cache = CodeCache::new().unwrap();
        let mut index = Index::new();
        let mut recorder = TraceRecorder::new();

        let offsets: Vec<u32> = (0..5).map(|i| cache.reserve(8 + i).unwrap()).collect();
        let keys: Vec<CacheKey> = (0..5).map(|i| CacheKey::new(0x1000 + i as u32, 1, 0)).collect();

        for i in 0..4 {
            let ended = recorder.block_ends_trace(keys[i], value(offsets[i], true));
            assert!(!ended);
        }
        let last_value = CacheValue { has_one_successor: false, ..value(offsets[4], false) };
        assert!(recorder.block_ends_trace(keys[4], last_value));

        assert!(recorder.build(&mut cache, &mut index));
        assert!(recorder.is_empty());

        for i in 0..4 {
            let rewritten = index.find(keys[i]).unwrap();
            assert!(rewritten.is_trace_block);
            assert_eq!(rewritten.is_trace_head, i == 0);
            assert_ne!(rewritten.cache_offset, offsets[i]);
        }
        assert!(index.find(keys[4]).is_none());
    }

    #[test]
    fn multi_successor_block_ends_trace_immediately() {
        let mut recorder = TraceRecorder::new();
        let key = CacheKey::new(0x2000, 1, 0);
        assert!(recorder.block_ends_trace(key, value(64, false)));
    }

    #[test]
    fn single_entry_trace_does_not_build() {
        let mut cache = CodeCache::new().unwrap();
        let mut index = Index::new();
        let mut recorder = TraceRecorder::new();
        let key = CacheKey::new(0x3000, 1, 0);
        assert!(recorder.block_ends_trace(key, value(64, false)));
        assert!(!recorder.build(&mut cache, &mut index));
    }
}
