use grr_core::constants::{MAGIC_PAGE_BEGIN, MAGIC_PAGE_END, PAGE_SIZE};
use grr_core::{process_offsets, Addr32, Error, PagePerms, Result};
use grr_mem::{GuestMemory, PageTable};

/// Mirrors `ProcessStatus` from `granary/os/process.h`: where the
/// scheduler should route this process next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Ready,
    SystemCall,
    IgnorableError,
    Error,
    Done,
}

/// Mirrors `ExecStatus`: whether `Execute` should be called this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Invalid,
    Ready,
    Blocked,
}

/// The prefix of [`Process`] that translated code addresses directly
/// through `PROCESS64`. Field order and types must match
/// `grr_core::process_offsets` byte-for-byte; nothing may be inserted,
/// removed, or reordered here without updating both.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ProcessHot {
    pub base: u64, // 0
    pub edi: u32,  // 8
    pub esi: u32,  // 12
    pub ebp: u32,  // 16
    pub ebx: u32,  // 20
    pub edx: u32,  // 24
    pub ecx: u32,  // 28
    pub eax: u32,  // 32
    pub esp: u32,  // 36
    pub eip: u32,  // 40
    pub eflags: u32, // 44
    pub pid: i32,  // 48
    pub last_branch_pc: Addr32, // 52
    pub text_base: Addr32, // 56
}

/// A single 32-bit guest process: registers, memory, and the
/// fault/scheduling bookkeeping the scheduler and fault handler consult.
///
/// Open files live outside `Process` (in a sibling `FileTable` the
/// scheduler holds per process), since [`File::read`]/[`File::write`]
/// need a whole `&Process` for register and memory access while also
/// being looked up through a mutable borrow of the file table — the two
/// borrows can't nest if the table lives inside `Process` itself.
///
/// `hot` must stay the first field so its address equals `&Process as
/// *const _`, the pointer stashed in `PROCESS64`.
#[repr(C)]
pub struct Process {
    pub hot: ProcessHot,

    pub mem: GuestMemory,
    pub pages: PageTable,
    pub fpregs: [u8; 512],

    pub fault_can_recover: bool,
    pub schedule_delay: i32,
    pub signal: i32,
    pub status: ProcessStatus,
    pub exec_status: ExecStatus,
    pub fault_addr: Addr32,
    pub fault_base_addr: Addr32,
    pub fault_index_addr: Addr32,

    pub page_hash: u32,
    pub page_hash_is_valid: bool,
}

impl Process {
    pub fn new(pid: i32) -> Result<Self> {
        let mem = GuestMemory::new()?;
        Ok(Process {
            hot: ProcessHot {
                base: mem.base_ptr() as u64,
                pid,
                ..Default::default()
            },
            mem,
            pages: PageTable::new(),
            fpregs: [0u8; 512],
            fault_can_recover: false,
            schedule_delay: 0,
            signal: 0,
            status: ProcessStatus::Ready,
            exec_status: ExecStatus::Invalid,
            fault_addr: 0,
            fault_base_addr: 0,
            fault_index_addr: 0,
            page_hash: 0,
            page_hash_is_valid: false,
        })
    }

    pub fn pid(&self) -> i32 {
        self.hot.pid
    }

    /// The low byte of the process id, the discriminator packed into a
    /// `CacheKey` (which only has room for 8 bits).
    pub fn cache_pid(&self) -> u8 {
        self.hot.pid as u8
    }

    pub fn g2h(&self, addr32: Addr32) -> *mut u8 {
        self.mem.g2h(addr32)
    }

    pub fn is_process_address(&self, host_addr: *const u8) -> bool {
        self.mem.is_process_address(host_addr)
    }

    /// Host pointer to guest address. Panics if `host_addr` isn't one of
    /// this process's own pointers; callers should check
    /// [`is_process_address`](Self::is_process_address) first.
    pub fn h2g(&self, host_addr: *const u8) -> Addr32 {
        self.mem.h2g(host_addr)
    }

    pub fn allocate(&mut self, num_bytes: usize, perms: PagePerms) -> Result<Addr32> {
        let addr = self.pages.allocate(num_bytes, perms)?;
        if perms.is_executable() {
            self.page_hash_is_valid = false;
        }
        Ok(addr)
    }

    pub fn deallocate(&mut self, addr: Addr32, num_bytes: usize) -> Result<()> {
        if (MAGIC_PAGE_BEGIN..MAGIC_PAGE_END).contains(&addr) {
            return Err(Error::PermissionDenied(addr));
        }
        let had_executable = self.pages.executable_ranges().any(|r| r.contains(addr));
        self.pages.deallocate(&self.mem, addr, num_bytes)?;
        if had_executable {
            self.page_hash_is_valid = false;
        }
        Ok(())
    }

    pub fn page_hash(&mut self) -> u32 {
        if self.page_hash_is_valid {
            return self.page_hash;
        }
        self.page_hash = grr_mem::hash::hash_executable_pages(&self.mem, self.pages.ranges().iter());
        self.page_hash_is_valid = true;
        self.page_hash
    }

    pub fn try_lazy_map(&mut self, addr: Addr32) -> bool {
        let mapped = self.pages.try_lazy_map(&self.mem, addr).unwrap_or(false);
        if mapped {
            self.page_hash_is_valid = false;
        }
        mapped
    }

    pub fn try_make_writable(&mut self, addr: Addr32) -> bool {
        let flipped = self.pages.try_make_writable(&self.mem, addr).unwrap_or(false);
        if flipped {
            self.page_hash_is_valid = false;
        }
        flipped
    }

    pub fn try_make_executable(&mut self, addr: Addr32) -> bool {
        self.pages.try_make_executable(&self.mem, addr).unwrap_or(false)
    }

    pub fn can_execute(&self, pc32: Addr32) -> bool {
        self.pages.find(pc32).map(|r| r.perms.is_executable()).unwrap_or(false)
    }

    /// Writes `val` into guest memory at `addr`, honoring the page's
    /// *currently realized* host protection (not just the guest's
    /// requested permissions — a `RWX` range sitting in the `RX` state
    /// isn't actually writable until `try_make_writable` flips it).
    /// Returns `false` (the caller reports a soft `EFAULT`) rather than
    /// touching memory the host mapping doesn't actually grant.
    pub fn try_write_bytes(&self, addr: Addr32, val: &[u8]) -> bool {
        match self.pages.find(addr) {
            Some(range) if range.state.is_writable() => {
                if (addr as u64 + val.len() as u64) > range.lazy_base as u64 {
                    return false;
                }
                unsafe { self.mem.write_bytes(addr, val) };
                true
            }
            _ => false,
        }
    }

    pub fn try_read_bytes(&self, addr: Addr32, out: &mut [u8]) -> bool {
        match self.pages.find(addr) {
            Some(range) if range.state.is_readable() => {
                if (addr as u64 + out.len() as u64) > range.lazy_base as u64 {
                    return false;
                }
                let src = unsafe { self.mem.read_bytes(addr, out.len()) };
                out.copy_from_slice(src);
                true
            }
            _ => false,
        }
    }

    pub fn try_write_u32(&self, addr: Addr32, val: u32) -> bool {
        self.try_write_bytes(addr, &val.to_le_bytes())
    }

    pub fn try_read_u32(&self, addr: Addr32) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.try_read_bytes(addr, &mut buf).then(|| u32::from_le_bytes(buf))
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.hot.pid)
            .field("eip", &self.hot.eip)
            .field("status", &self.status)
            .field("exec_status", &self.exec_status)
            .finish()
    }
}

const _: () = assert!(PAGE_SIZE == 4096);
const _: () = assert!(std::mem::offset_of!(ProcessHot, base) == process_offsets::BASE);
const _: () = assert!(std::mem::offset_of!(ProcessHot, edi) == process_offsets::GPR_EDI);
const _: () = assert!(std::mem::offset_of!(ProcessHot, esi) == process_offsets::GPR_ESI);
const _: () = assert!(std::mem::offset_of!(ProcessHot, ebp) == process_offsets::GPR_EBP);
const _: () = assert!(std::mem::offset_of!(ProcessHot, ebx) == process_offsets::GPR_EBX);
const _: () = assert!(std::mem::offset_of!(ProcessHot, edx) == process_offsets::GPR_EDX);
const _: () = assert!(std::mem::offset_of!(ProcessHot, ecx) == process_offsets::GPR_ECX);
const _: () = assert!(std::mem::offset_of!(ProcessHot, eax) == process_offsets::GPR_EAX);
const _: () = assert!(std::mem::offset_of!(ProcessHot, esp) == process_offsets::GPR_ESP);
const _: () = assert!(std::mem::offset_of!(ProcessHot, eip) == process_offsets::GPR_EIP);
const _: () = assert!(std::mem::offset_of!(ProcessHot, eflags) == process_offsets::GPR_EFLAGS);
const _: () = assert!(std::mem::offset_of!(ProcessHot, pid) == process_offsets::PID);
const _: () = assert!(std::mem::offset_of!(ProcessHot, last_branch_pc) == process_offsets::LAST_BRANCH_PC);
const _: () = assert!(std::mem::offset_of!(ProcessHot, text_base) == process_offsets::TEXT_BASE);
const _: () = assert!(std::mem::offset_of!(Process, hot) == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocating_executable_invalidates_page_hash() {
        let mut process = Process::new(1).unwrap();
        process.page_hash_is_valid = true;
        process.allocate(4096, PagePerms::RWX).unwrap();
        assert!(!process.page_hash_is_valid);
    }

    #[test]
    fn deallocating_magic_page_is_rejected() {
        let mut process = Process::new(1).unwrap();
        assert!(process.deallocate(MAGIC_PAGE_BEGIN, 4096).is_err());
    }
}
