use grr_cache::CodeCache;
use grr_core::Addr32;
use grr_process::Process;

use crate::decompose::decompose_fault_addr;

/// The five signals the fault handler is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSignal {
    Segv,
    Bus,
    Fpe,
    Ill,
    Trap,
}

/// What the caller (a real signal handler, or a test driving the
/// classifier directly) should do with the faulting context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page table recovered the fault (lazy map or RX→RW flip);
    /// return from the signal handler as-is and re-execute the faulting
    /// instruction.
    Resumed,
    /// The fault landed in a protected-access probe; advance the host PC
    /// past it and resume.
    RecoveredProbe { advance_pc: u64 },
    /// Unrecoverable guest fault inside translated code; the host PC
    /// should be redirected to `bad_block`, and `process.fault_addr` /
    /// `fault_base_addr` / `fault_index_addr` are now populated.
    RedirectedToBadBlock,
    /// Not a fault this handler understands (outside guest memory, or
    /// outside the code cache); the caller should re-raise with the
    /// default disposition.
    Unhandled,
}

/// Runs the classification order from `FaultHandler`'s contract against an
/// already-captured fault. Pure and synchronous — the actual signal
/// handler (`grr_fault::handler`) does nothing but capture the signal
/// number, faulting address, and host PC and hand them here, so this path
/// is exercised directly by tests without installing real signal handlers.
pub fn classify_fault(
    process: &mut Process,
    signal: FaultSignal,
    fault_addr: Addr32,
    host_fault_pc: u64,
    cache: &CodeCache,
) -> FaultOutcome {
    process.signal = signal_number(signal);

    if process.try_lazy_map(fault_addr) {
        return FaultOutcome::Resumed;
    }
    if process.try_make_writable(fault_addr) {
        return FaultOutcome::Resumed;
    }
    if process.fault_can_recover && is_protected_probe_landing_pad(host_fault_pc) {
        process.fault_can_recover = false;
        return FaultOutcome::RecoveredProbe { advance_pc: 16 };
    }

    if cache.contains_host_ptr(host_fault_pc as *const u8) {
        let decomposed = decompose_fault_addr(process, fault_addr);
        process.fault_addr = fault_addr;
        process.fault_base_addr = decomposed.base;
        process.fault_index_addr = decomposed.index;
        return FaultOutcome::RedirectedToBadBlock;
    }

    FaultOutcome::Unhandled
}

fn signal_number(signal: FaultSignal) -> i32 {
    match signal {
        FaultSignal::Segv => libc::SIGSEGV,
        FaultSignal::Bus => libc::SIGBUS,
        FaultSignal::Fpe => libc::SIGFPE,
        FaultSignal::Ill => libc::SIGILL,
        FaultSignal::Trap => libc::SIGTRAP,
    }
}

/// A protected read/write probe's recovery landing pad sits 16 bytes past
/// its start, per the `jmp 1f; .align 16; 1: <op>; jmp 2f; .align 16; 2:`
/// convention — recognized here by alignment alone, gated on
/// `fault_can_recover` so an incidentally 16-byte-aligned PC elsewhere
/// can't be mistaken for one.
fn is_protected_probe_landing_pad(host_pc: u64) -> bool {
    host_pc % 16 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use grr_cache::CodeCache;
    use grr_core::PagePerms;

    fn process_with_lazy_page() -> (Process, Addr32) {
        let mut process = Process::new(1).unwrap();
        let addr = process.allocate(4096, PagePerms::RW).unwrap();
        (process, addr)
    }

    #[test]
    fn lazy_map_resumes() {
        let (mut process, addr) = process_with_lazy_page();
        let cache = CodeCache::new().unwrap();
        let outcome = classify_fault(&mut process, FaultSignal::Segv, addr, 0, &cache);
        assert_eq!(outcome, FaultOutcome::Resumed);
    }

    #[test]
    fn rwx_write_fault_flips_to_writable() {
        let mut process = Process::new(1).unwrap();
        let addr = process.allocate(4096, PagePerms::RWX).unwrap();
        process.try_lazy_map(addr);
        process.try_make_executable(addr);
        let cache = CodeCache::new().unwrap();
        let outcome = classify_fault(&mut process, FaultSignal::Segv, addr, 0, &cache);
        assert_eq!(outcome, FaultOutcome::Resumed);
        assert!(process.try_write_bytes(addr, &[0x90]));
    }

    #[test]
    fn probe_recovery_requires_fault_can_recover() {
        let (mut process, _addr) = process_with_lazy_page();
        let cache = CodeCache::new().unwrap();
        // Not inside a probe: alignment alone isn't enough.
        let outcome = classify_fault(&mut process, FaultSignal::Bus, 0xffff_0000, 0x4000, &cache);
        assert_eq!(outcome, FaultOutcome::Unhandled);

        process.fault_can_recover = true;
        let outcome = classify_fault(&mut process, FaultSignal::Bus, 0xffff_0000, 0x4010, &cache);
        assert_eq!(outcome, FaultOutcome::RecoveredProbe { advance_pc: 16 });
        assert!(!process.fault_can_recover);
    }

    #[test]
    fn unclassifiable_fault_outside_cache_is_unhandled() {
        let (mut process, _addr) = process_with_lazy_page();
        let cache = CodeCache::new().unwrap();
        let outcome = classify_fault(&mut process, FaultSignal::Segv, 0xffff_0000, 0x1234, &cache);
        assert_eq!(outcome, FaultOutcome::Unhandled);
    }
}
