//! The translate/cache/run loop: `Dispatcher::execute` is this crate's
//! `Execute` — it runs a bound process until it hits a syscall, a fatal
//! guest error, or an uncatchable condition, the same contract the
//! scheduler drives (`grr_scheduler`) around a process's turn.
//!
//! Grounded on the teacher's `cpu_exec_loop`/`tb_find`/`tb_gen_code`/
//! `cpu_tb_exec` split in `dispatch/src/exec_loop.rs`: `tb_find` becomes
//! [`lookup_or_translate`](Dispatcher::lookup_or_translate), `tb_gen_code`
//! becomes [`translate_and_insert`](Dispatcher::translate_and_insert), and
//! `cpu_tb_exec`'s `transmute`-to-`extern "C" fn` call becomes the call
//! through [`prologue::EntryFn`] below.

use std::io;
use std::path::Path;

use grr_cache::{CodeCache, Index, Patcher, TraceRecorder};
use grr_core::{Addr32, CacheKey, CacheValue, CountedPathEntry, Error, Result};
use grr_decode::BlockBuilder;
use grr_process::{Process, ProcessStatus};
use grr_translate::{InstrumentationCallbacks, Translator};

use crate::coverage::CoverageSink;
use crate::inline_cache::InlineCache;
use crate::prologue;

/// Bounded pending-chain-patch queue size, swept every
/// `grr_cache::patcher::PATCH_INTERVAL` additions.
const PATCH_QUEUE_CAPACITY: usize = 1024;

/// Why [`Dispatcher::execute`] returned control to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The dispatched block ended in `INT 0x80`; `process.hot.eip` is the
    /// instruction after it and `process.status` is `SystemCall`.
    Syscall,
    /// The guest hit an unrecoverable fault or decoded to `UD2`;
    /// `process.status` is `Error`.
    Error,
}

/// RET, the default body of a disabled instrumentation trampoline —
/// calling it unconditionally from translated code is always correct.
const RET: u8 = 0xC3;

pub struct Dispatcher {
    cache: CodeCache,
    index: Index,
    inline: InlineCache,
    trace: TraceRecorder,
    translator: Translator,
    block_builder: BlockBuilder,
    entry: prologue::EntryFn,
    coverage: Option<Box<dyn CoverageSink>>,
    patcher: Patcher,
    tracing_enabled: bool,
    inline_cache_enabled: bool,
}

impl Dispatcher {
    pub fn new() -> io::Result<Self> {
        Self::from_cache(CodeCache::new()?, Index::new(), Patcher::new(PATCH_QUEUE_CAPACITY))
    }

    /// A cache and index backed by files under `dir`, so translations and
    /// lookups survive a restart.
    pub fn new_persistent(dir: &Path) -> io::Result<Self> {
        let cache = CodeCache::new_persistent(&dir.join("code.cache"))?;
        let index = Index::load(&dir.join("code.index")).unwrap_or_default();
        let patcher = Patcher::load_persistent(&dir.join("code.patch"), PATCH_QUEUE_CAPACITY)?;
        Self::from_cache(cache, index, patcher)
    }

    fn from_cache(mut cache: CodeCache, index: Index, patcher: Patcher) -> io::Result<Self> {
        for slot in 0..4 {
            cache.commit(cache.trampoline_offset(slot), &[RET]);
        }

        let callbacks = InstrumentationCallbacks::new(cache.trampoline_base_addr());
        let translator = Translator::new(callbacks);

        let probe = prologue::build(0);
        let prologue_offset = cache
            .reserve(probe.bytes.len())
            .map_err(cache_err_to_io)?;
        let prologue_addr = cache.trampoline_base_addr() + prologue_offset as u64;
        let built = prologue::build(prologue_addr);
        cache.commit(prologue_offset, &built.bytes);

        // SAFETY: `built.bytes` is a `(*mut u8, *const u8)` host function
        // we just committed into executable arena memory.
        let entry: prologue::EntryFn = unsafe { std::mem::transmute(cache.offset_to_ptr(prologue_offset)) };

        let bad_block_addr = prologue_addr + built.bad_block_offset as u64;
        grr_fault::set_bad_block_addr(bad_block_addr);

        Ok(Dispatcher {
            cache,
            index,
            inline: InlineCache::new(),
            trace: TraceRecorder::new(),
            translator,
            block_builder: BlockBuilder::default(),
            entry,
            coverage: None,
            patcher,
            tracing_enabled: true,
            inline_cache_enabled: true,
        })
    }

    /// Installs the sink `execute` reports multi-way-branch edges to.
    /// `grr-snapshot` is the expected caller; `grr-dispatch` itself has no
    /// opinion on where coverage data ends up.
    pub fn set_coverage_sink(&mut self, sink: Box<dyn CoverageSink>) {
        self.coverage = Some(sink);
    }

    /// Access to the installed sink, for downcasting back to its concrete
    /// type once a run finishes (see [`CoverageSink`]'s doc comment).
    pub fn coverage_sink_mut(&mut self) -> Option<&mut dyn CoverageSink> {
        self.coverage.as_deref_mut()
    }

    /// Caps every newly-translated block at `max` guest instructions,
    /// `grr-play`'s `--max_instructions_per_block`.
    pub fn set_max_instructions_per_block(&mut self, max: usize) {
        self.block_builder = BlockBuilder::new(max);
    }

    /// `grr-play`'s `--disable_tracing`: skip promoting hot blocks into
    /// inlined traces.
    pub fn set_tracing_enabled(&mut self, enabled: bool) {
        self.tracing_enabled = enabled;
    }

    /// `grr-play`'s `--disable_inline_cache`: always go through the full
    /// index lookup instead of the host-side inline cache.
    pub fn set_inline_cache_enabled(&mut self, enabled: bool) {
        self.inline_cache_enabled = enabled;
    }

    /// `grr-play`'s `--disable_patching`: never hot-patch a direct-jump or
    /// fall-through block's chain slot, so every block keeps returning to
    /// this loop's lookup on every iteration.
    pub fn set_patching_enabled(&mut self, enabled: bool) {
        if !enabled {
            self.patcher = Patcher::disabled();
        }
    }

    pub fn save_persistent(&mut self, dir: &Path) -> io::Result<()> {
        self.patcher.shutdown(&self.index, &mut self.cache)?;
        self.index.save(&dir.join("code.index"))
    }

    /// Host pointer the bound cache's arena lives at, for fault recovery
    /// to check a faulting address against (`grr_fault::classify::classify_fault`'s
    /// `cache.contains_host_ptr`).
    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut CodeCache {
        &mut self.cache
    }

    /// The translated-block index, for introspection (coverage tooling,
    /// tests) rather than the hot execution path itself.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Runs `process` block after block until a syscall, a fatal error,
    /// or the process is no longer `Ready`.
    pub fn execute(&mut self, process: &mut Process) -> ExecOutcome {
        loop {
            let key = CacheKey::new(process.hot.eip, process.cache_pid(), process.page_hash());
            let last_branch_pc = process.hot.last_branch_pc;
            let value = match self.lookup_or_translate(process, key, last_branch_pc) {
                Ok(v) => v,
                Err(_) => {
                    process.status = ProcessStatus::Error;
                    return ExecOutcome::Error;
                }
            };

            process.signal = 0;
            let block_ptr = self.cache.offset_to_ptr(value.cache_offset);
            unsafe { (self.entry)(process as *mut Process as *mut u8, block_ptr) };

            if process.signal != 0 {
                process.status = ProcessStatus::Error;
                return ExecOutcome::Error;
            }

            if !value.has_one_successor {
                if let Some(sink) = self.coverage.as_mut() {
                    sink.record(CountedPathEntry {
                        last_branch: last_branch_pc,
                        from: key.pc32,
                        to: process.hot.eip,
                        count: 1,
                    });
                }
            }

            if self.tracing_enabled
                && self.trace.block_ends_trace(key, value)
                && self.trace.build(&mut self.cache, &mut self.index)
            {
                self.inline.clear();
            }

            if value.ends_with_syscall {
                process.status = ProcessStatus::SystemCall;
                return ExecOutcome::Syscall;
            }
            // A block that decoded to `UD2` always raises `SIGILL` before
            // its `ret` runs, so in practice this arm is unreachable —
            // `process.signal != 0` above already caught it. Kept as a
            // defensive fallback rather than relying on that timing.
            if value.ends_with_error {
                process.status = ProcessStatus::Error;
                return ExecOutcome::Error;
            }
        }
    }

    fn lookup_or_translate(&mut self, process: &mut Process, key: CacheKey, last_branch_pc: Addr32) -> Result<CacheValue> {
        // Lazily flip the page holding `key.pc32` from RW to RX before it's
        // looked up or translated, splitting that single page out of its
        // range first so a sibling page in the same RWX allocation keeps
        // its own state; this is what lets a guest write to that sibling
        // page later actually fault instead of silently going unnoticed.
        process.try_make_executable(key.pc32);

        if self.inline_cache_enabled {
            if let Some(value) = self.inline.lookup(last_branch_pc, key) {
                return Ok(value);
            }
        }
        if let Some(value) = self.index.find(key) {
            if self.inline_cache_enabled {
                self.inline.insert(last_branch_pc, key, value);
            }
            return Ok(value);
        }
        self.translate_and_insert(process, key, last_branch_pc)
    }

    fn translate_and_insert(&mut self, process: &Process, key: CacheKey, last_branch_pc: Addr32) -> Result<CacheValue> {
        let block = self.block_builder.build(key.pc32, |pc| {
            let mut byte = [0u8; 1];
            process.try_read_bytes(pc, &mut byte).then_some(byte[0])
        });

        // Pass 1: translate at a placeholder address purely to learn the
        // encoded length (instruction sizes here never depend on the
        // absolute address — every far target is a fixed-width rel32, and
        // the only rel8 branches are between positions within the same
        // block, whose distance doesn't change when the block is shifted).
        let sized = self.translator.translate(&block, 0, 0);
        let offset = self.cache.reserve(sized.bytes.len())?;
        let cache_ip = self.cache.trampoline_base_addr() + offset as u64;

        let value = CacheValue {
            block_pc32: block.start_pc,
            cache_offset: offset,
            is_trace_head: false,
            is_trace_block: false,
            has_one_successor: sized.has_one_successor,
            ends_with_syscall: sized.ends_with_syscall,
            ends_with_error: sized.ends_with_error,
        };

        // Pass 2: re-encode at the real address with the real `BLOCK64`
        // marker now that both are known.
        let real = self.translator.translate(&block, cache_ip, value.pack());
        self.cache.commit(offset, &real.bytes);

        if let Some((rel_offset, target_pc32)) = real.patch_point {
            let patch_offset = offset + rel_offset;
            let target = CacheKey { pc32: target_pc32, pid: key.pid, code_hash: key.code_hash };
            if self.patcher.add_patch_point(patch_offset, target, &self.index, &mut self.cache) {
                self.inline.clear();
            }
        }

        self.index.insert(key, value);
        if self.inline_cache_enabled {
            self.inline.insert(last_branch_pc, key, value);
        }
        Ok(value)
    }
}

fn cache_err_to_io(err: Error) -> io::Error {
    match err {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grr_core::PagePerms;

    #[test]
    fn dispatcher_builds_without_error() {
        let _ = Dispatcher::new().unwrap();
    }

    #[test]
    fn coverage_sink_can_be_installed_without_affecting_direct_blocks() {
        #[derive(Default)]
        struct RecordingSink(Vec<CountedPathEntry>);
        impl CoverageSink for RecordingSink {
            fn record(&mut self, entry: CountedPathEntry) {
                self.0.push(entry);
            }
            fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
                self
            }
        }

        let mut process = Process::new(1).unwrap();
        let pc = process.allocate(4096, PagePerms::RWX).unwrap();
        assert!(process.try_lazy_map(pc));
        assert!(process.try_make_writable(pc));
        // mov eax, 1 ; int 0x80 — a direct block, `has_one_successor: true`
        let code = [0xB8, 0x01, 0x00, 0x00, 0x00, 0xCD, 0x80];
        assert!(process.try_write_bytes(pc, &code));
        assert!(process.try_make_executable(pc));
        process.hot.eip = pc;

        let mut dispatcher = Dispatcher::new().unwrap();
        dispatcher.set_coverage_sink(Box::new(RecordingSink::default()));
        let outcome = dispatcher.execute(&mut process);
        assert_eq!(outcome, ExecOutcome::Syscall);
    }

    #[test]
    fn dispatches_a_direct_block_to_a_syscall() {
        let mut process = Process::new(1).unwrap();
        let pc = process.allocate(4096, PagePerms::RWX).unwrap();
        assert!(process.try_lazy_map(pc));
        assert!(process.try_make_writable(pc));
        // mov eax, 1 ; int 0x80
        let code = [0xB8, 0x01, 0x00, 0x00, 0x00, 0xCD, 0x80];
        assert!(process.try_write_bytes(pc, &code));
        assert!(process.try_make_executable(pc));
        process.hot.eip = pc;

        let mut dispatcher = Dispatcher::new().unwrap();
        let outcome = dispatcher.execute(&mut process);
        assert_eq!(outcome, ExecOutcome::Syscall);
        assert_eq!(process.hot.eax, 1);
        assert_eq!(process.hot.eip, pc + code.len() as u32);
    }

    #[test]
    fn execute_arms_write_protection_on_fresh_code_without_an_explicit_flip() {
        let mut process = Process::new(1).unwrap();
        let pc = process.allocate(4096, PagePerms::RWX).unwrap();
        assert!(process.try_lazy_map(pc));
        assert!(process.try_make_writable(pc));
        // mov eax, 1 ; int 0x80 — deliberately never call
        // `try_make_executable` here; `execute` must do it on its own.
        let code = [0xB8, 0x01, 0x00, 0x00, 0x00, 0xCD, 0x80];
        assert!(process.try_write_bytes(pc, &code));
        process.hot.eip = pc;

        let mut dispatcher = Dispatcher::new().unwrap();
        let outcome = dispatcher.execute(&mut process);
        assert_eq!(outcome, ExecOutcome::Syscall);

        // Had the lookup path never flipped the page to RX, it would
        // still be RW and this second flip would be a no-op `false`.
        assert!(process.try_make_writable(pc));
    }
}
