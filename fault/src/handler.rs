//! Real signal handler glue: binds a [`Process`]/[`CodeCache`] pair to
//! process-wide statics, installs `sigaction` handlers for the signals the
//! original catches, and turns a delivered signal into a [`classify_fault`]
//! call plus (for fault signals) an in-place rewrite of the faulting
//! context's program counter.
//!
//! Grounded on `granary/os/schedule.cc`'s `gProcess` / `gSignalHandlers` /
//! `CatchInterrupt` / `CatchFault` / `CatchCrash`, and
//! `granary/base/interrupt.{h,cc}`'s `InterruptState` stack. The original's
//! `InterruptState` is a nested RAII stack threaded through `sigsetjmp`;
//! here it collapses to a single pending-signal slot plus an
//! interruptible/not flag, since nothing in this port ever needs more than
//! one outstanding deferred signal at a time — [`UninterruptibleRegion`] is
//! the `Uninterruptible` guard, and the scheduler is expected to check
//! [`take_pending_signal`] at its own points of quiescence rather than
//! `siglongjmp` back into one.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, Ordering};

use grr_cache::CodeCache;
use grr_process::Process;

use crate::classify::{classify_fault, FaultOutcome, FaultSignal};

static CURRENT_PROCESS: AtomicPtr<Process> = AtomicPtr::new(std::ptr::null_mut());
static CURRENT_CACHE: AtomicPtr<CodeCache> = AtomicPtr::new(std::ptr::null_mut());

/// Host address `CatchFault`/`CatchCrash` redirect the faulting context's PC
/// to. Set by the scheduler once the bad-block trampoline is built; a fault
/// arriving before that's set is treated as unhandled.
static BAD_BLOCK_ADDR: AtomicU64 = AtomicU64::new(0);

static INTERRUPTIBLE: AtomicBool = AtomicBool::new(true);
static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);
static RUNNING: AtomicBool = AtomicBool::new(true);

/// Binds `process`/`cache` as the targets `CatchFault`/`CatchCrash` operate
/// on. Callers (the scheduler, between processes) must call [`unbind`]
/// before the pointers they passed go out of scope.
///
/// # Safety
/// `process` and `cache` must outlive the binding, and no other thread may
/// be running guest code against either while bound.
pub unsafe fn bind(process: *mut Process, cache: *mut CodeCache) {
    CURRENT_PROCESS.store(process, Ordering::SeqCst);
    CURRENT_CACHE.store(cache, Ordering::SeqCst);
}

pub fn unbind() {
    CURRENT_PROCESS.store(std::ptr::null_mut(), Ordering::SeqCst);
    CURRENT_CACHE.store(std::ptr::null_mut(), Ordering::SeqCst);
}

pub fn set_bad_block_addr(addr: u64) {
    BAD_BLOCK_ADDR.store(addr, Ordering::SeqCst);
}

/// Whether a signal delivered right now would be handled immediately
/// (`true`) or queued for the enclosing [`UninterruptibleRegion`] to
/// re-deliver on exit.
pub fn is_interruptible() -> bool {
    INTERRUPTIBLE.load(Ordering::SeqCst)
}

pub fn is_running() -> bool {
    RUNNING.load(Ordering::SeqCst)
}

/// Takes and clears any signal queued while uninterruptible, for the
/// scheduler to check at its own points of quiescence.
pub fn take_pending_signal() -> Option<i32> {
    match PENDING_SIGNAL.swap(0, Ordering::SeqCst) {
        0 => None,
        sig => Some(sig),
    }
}

/// RAII guard mirroring `Uninterruptible`: while held, `CatchInterrupt`
/// queues rather than delivers. Nesting isn't supported — this port only
/// ever needs one outstanding region, unlike the original's full stack.
pub struct UninterruptibleRegion {
    _private: (),
}

impl UninterruptibleRegion {
    pub fn enter() -> Self {
        INTERRUPTIBLE.store(false, Ordering::SeqCst);
        UninterruptibleRegion { _private: () }
    }
}

impl Drop for UninterruptibleRegion {
    fn drop(&mut self) {
        INTERRUPTIBLE.store(true, Ordering::SeqCst);
    }
}

fn current_process<'a>() -> Option<&'a mut Process> {
    let ptr = CURRENT_PROCESS.load(Ordering::SeqCst);
    unsafe { ptr.as_mut() }
}

fn current_cache<'a>() -> Option<&'a CodeCache> {
    let ptr = CURRENT_CACHE.load(Ordering::SeqCst);
    unsafe { ptr.as_ref() }
}

/// `CatchInterrupt`: `SIGINT`/`SIGTERM`/`SIGALRM`/`SIGPIPE`. Queues the
/// signal if not at a point of quiescence, otherwise stops the run loop.
extern "C" fn catch_interrupt(sig: i32) {
    if !is_interruptible() {
        PENDING_SIGNAL.store(sig, Ordering::SeqCst);
        return;
    }
    PENDING_SIGNAL.store(sig, Ordering::SeqCst);
    RUNNING.store(false, Ordering::SeqCst);
}

/// `SIGUSR1`, the original's non-maskable interrupt: always queued for
/// immediate delivery regardless of interruptibility, and never silently
/// dropped the way a spurious re-delivery of another signal would be.
extern "C" fn catch_non_maskable(sig: i32) {
    PENDING_SIGNAL.store(sig, Ordering::SeqCst);
    RUNNING.store(false, Ordering::SeqCst);
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod ucontext {
    use super::*;

    fn pc_mut(context: *mut libc::c_void) -> *mut u64 {
        let uc = context as *mut libc::ucontext_t;
        unsafe { std::ptr::addr_of_mut!((*uc).uc_mcontext.gregs[libc::REG_RIP as usize]) as *mut u64 }
    }

    /// `CatchFault`: `SIGSEGV`. Classifies against the bound process/cache
    /// and, for an unresolved guest fault inside translated code, rewrites
    /// the signal context's PC so execution resumes at `bad_block` on
    /// return instead of re-raising the original fault.
    pub extern "C" fn catch_fault(sig: i32, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
        let (process, cache) = match (current_process(), current_cache()) {
            (Some(p), Some(c)) => (p, c),
            _ => {
                reraise_default(sig);
                return;
            }
        };
        let fault_addr = unsafe { (*info).si_addr() as u64 };
        if !process.is_process_address(fault_addr as *const u8) {
            reraise_default(sig);
            return;
        }
        let fault_addr32 = process.h2g(fault_addr as *const u8);
        let pc = pc_mut(context);
        let host_pc = unsafe { *pc };

        match classify_fault(process, FaultSignal::Segv, fault_addr32, host_pc, cache) {
            FaultOutcome::Resumed => {}
            FaultOutcome::RecoveredProbe { advance_pc } => unsafe { *pc += advance_pc },
            FaultOutcome::RedirectedToBadBlock => {
                let target = BAD_BLOCK_ADDR.load(Ordering::SeqCst);
                if target != 0 {
                    unsafe { *pc = target };
                } else {
                    reraise_default(sig);
                }
            }
            FaultOutcome::Unhandled => reraise_default(sig),
        }
    }

    /// `CatchCrash`: `SIGBUS`/`SIGFPE`/`SIGTRAP`/`SIGILL`. These never
    /// originate from the page table's own lazy-mapping machinery, so they
    /// skip straight to the cache-membership check `CatchFault` falls back
    /// on.
    pub extern "C" fn catch_crash(sig: i32, _info: *mut libc::siginfo_t, context: *mut libc::c_void) {
        let (process, cache) = match (current_process(), current_cache()) {
            (Some(p), Some(c)) => (p, c),
            _ => {
                reraise_default(sig);
                return;
            }
        };
        let signal = match sig {
            libc::SIGBUS => FaultSignal::Bus,
            libc::SIGFPE => FaultSignal::Fpe,
            libc::SIGILL => FaultSignal::Ill,
            _ => FaultSignal::Trap,
        };
        let pc = pc_mut(context);
        let host_pc = unsafe { *pc };
        let eip = process.hot.eip;

        match classify_fault(process, signal, eip, host_pc, cache) {
            FaultOutcome::RecoveredProbe { advance_pc } => unsafe { *pc += advance_pc },
            FaultOutcome::RedirectedToBadBlock => {
                let target = BAD_BLOCK_ADDR.load(Ordering::SeqCst);
                if target != 0 {
                    unsafe { *pc = target };
                } else {
                    reraise_default(sig);
                }
            }
            FaultOutcome::Resumed | FaultOutcome::Unhandled => reraise_default(sig),
        }
    }
}

fn reraise_default(sig: i32) {
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn install_sigaction(sig: i32, handler: libc::sighandler_t, siginfo: bool) {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        sa.sa_flags = if siginfo { libc::SA_SIGINFO } else { 0 };
        libc::sigfillset(&mut sa.sa_mask);
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

/// Installs every handler from the original's `gSignalHandlers` table.
/// Idempotent; safe to call more than once (matches `gHasSigHandlers`'s
/// one-shot guard in the original, minus the guard — `sigaction` itself is
/// idempotent to re-installing the same handler).
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn install_handlers() {
    install_sigaction(libc::SIGINT, catch_interrupt as usize, false);
    install_sigaction(libc::SIGTERM, catch_interrupt as usize, false);
    install_sigaction(libc::SIGALRM, catch_interrupt as usize, false);
    install_sigaction(libc::SIGPIPE, catch_interrupt as usize, false);
    install_sigaction(libc::SIGUSR1, catch_non_maskable as usize, false);
    install_sigaction(libc::SIGSEGV, ucontext::catch_fault as usize, true);
    install_sigaction(libc::SIGBUS, ucontext::catch_crash as usize, true);
    install_sigaction(libc::SIGFPE, ucontext::catch_crash as usize, true);
    install_sigaction(libc::SIGTRAP, ucontext::catch_crash as usize, true);
    install_sigaction(libc::SIGILL, ucontext::catch_crash as usize, true);
    log::debug!("fault handlers installed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The statics under test are process-wide; serialize against other
    // tests in this module so they don't trample each other's bindings.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn bind_unbind_round_trips() {
        let _guard = TEST_LOCK.lock().unwrap();
        let mut process = Process::new(1).unwrap();
        let mut cache = CodeCache::new().unwrap();
        unsafe { bind(&mut process as *mut _, &mut cache as *mut _) };
        assert!(current_process().is_some());
        assert!(current_cache().is_some());
        unbind();
        assert!(current_process().is_none());
        assert!(current_cache().is_none());
    }

    #[test]
    fn uninterruptible_region_restores_on_drop() {
        let _guard = TEST_LOCK.lock().unwrap();
        assert!(is_interruptible());
        {
            let _region = UninterruptibleRegion::enter();
            assert!(!is_interruptible());
        }
        assert!(is_interruptible());
    }

    #[test]
    fn pending_signal_round_trips() {
        let _guard = TEST_LOCK.lock().unwrap();
        assert_eq!(take_pending_signal(), None);
        PENDING_SIGNAL.store(libc::SIGINT, Ordering::SeqCst);
        assert_eq!(take_pending_signal(), Some(libc::SIGINT));
        assert_eq!(take_pending_signal(), None);
    }

    #[test]
    fn bad_block_addr_round_trips() {
        let _guard = TEST_LOCK.lock().unwrap();
        set_bad_block_addr(0x1234);
        assert_eq!(BAD_BLOCK_ADDR.load(Ordering::SeqCst), 0x1234);
        set_bad_block_addr(0);
    }
}
