use std::io;
use std::ptr;

use grr_core::constants::PROCESS_SIZE;
use grr_core::Addr32;

/// A reserved, contiguous 4 GiB host mapping standing in for one guest
/// process's entire address space.
///
/// The whole range is reserved up front with `PROT_NONE` so that guest
/// pointer arithmetic never collides with unrelated host allocations; actual
/// backing (`RO`/`RW`/`RX`) is applied page range by page range as
/// [`PageTable`](crate::PageTable) grants it.
pub struct GuestMemory {
    base: *mut u8,
    size: usize,
}

// SAFETY: GuestMemory owns its mmap'd region exclusively; callers serialize
// access the same way the original serializes access to one process at a
// time via `PushProcess32`.
unsafe impl Send for GuestMemory {}

impl GuestMemory {
    /// Reserve a fresh 4 GiB address space.
    pub fn new() -> io::Result<Self> {
        // SAFETY: anonymous PROT_NONE reservation, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                PROCESS_SIZE as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        log::debug!("reserved {} bytes of guest address space", PROCESS_SIZE);
        Ok(GuestMemory {
            base: ptr as *mut u8,
            size: PROCESS_SIZE as usize,
        })
    }

    /// Guest address to host pointer.
    #[inline]
    pub fn g2h(&self, addr: Addr32) -> *mut u8 {
        debug_assert!((addr as usize) < self.size);
        unsafe { self.base.add(addr as usize) }
    }

    /// Host pointer to guest address. Panics if `ptr` falls outside this
    /// region.
    #[inline]
    pub fn h2g(&self, ptr: *const u8) -> Addr32 {
        let off = ptr as usize - self.base as usize;
        assert!(off < self.size, "host pointer not within guest memory");
        off as Addr32
    }

    #[inline]
    pub fn is_process_address(&self, ptr: *const u8) -> bool {
        let off = (ptr as usize).wrapping_sub(self.base as usize);
        off < self.size
    }

    #[inline]
    pub fn base_ptr(&self) -> *const u8 {
        self.base as *const u8
    }

    /// Apply host protection to a page-aligned guest range.
    pub fn mprotect(&self, addr: Addr32, len: usize, prot: i32) -> io::Result<()> {
        let host = self.g2h(addr);
        // SAFETY: range is within our reserved mapping.
        let ret = unsafe { libc::mprotect(host as *mut libc::c_void, len, prot) };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Back a page-aligned guest range with anonymous memory at the given
    /// protection, replacing whatever `PROT_NONE` placeholder was there.
    pub fn mmap_fixed(&self, addr: Addr32, len: usize, prot: i32) -> io::Result<()> {
        let host = self.g2h(addr);
        // SAFETY: MAP_FIXED within our reserved mapping only.
        let ret = unsafe {
            libc::mmap(
                host as *mut libc::c_void,
                len,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// # Safety
    /// `addr..addr+data.len()` must be mapped writable.
    pub unsafe fn write_bytes(&self, addr: Addr32, data: &[u8]) {
        let dst = self.g2h(addr);
        ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
    }

    /// # Safety
    /// `addr..addr+len` must be mapped readable.
    pub unsafe fn read_bytes(&self, addr: Addr32, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.g2h(addr), len)
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        if !self.base.is_null() {
            // SAFETY: reverses the mmap in `new`.
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_drop() {
        let mem = GuestMemory::new().unwrap();
        assert!(!mem.base.is_null());
    }

    #[test]
    fn g2h_h2g_round_trip() {
        let mem = GuestMemory::new().unwrap();
        let addr: Addr32 = 0x0804_1000;
        let host = mem.g2h(addr);
        assert_eq!(mem.h2g(host), addr);
    }

    #[test]
    fn mmap_fixed_and_write_round_trip() {
        let mem = GuestMemory::new().unwrap();
        let addr: Addr32 = 0x0805_0000;
        mem.mmap_fixed(addr, 4096, libc::PROT_READ | libc::PROT_WRITE)
            .unwrap();
        let data = b"hello";
        unsafe { mem.write_bytes(addr, data) };
        let back = unsafe { mem.read_bytes(addr, data.len()) };
        assert_eq!(back, data);
    }
}
