use twox_hash::XxHash32;
use std::hash::Hasher;

use grr_core::page::PageRange;

use crate::GuestMemory;

/// 24-bit hash of the contents of every currently-executable page.
///
/// Fed into [`grr_core::CacheKey`] so a block translated before
/// self-modifying code rewrote its page never matches a stale cache entry.
pub fn hash_executable_pages<'a>(
    mem: &GuestMemory,
    ranges: impl Iterator<Item = &'a PageRange>,
) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    for range in ranges {
        if range.lazy_base <= range.base {
            continue;
        }
        let len = (range.lazy_base - range.base) as usize;
        // SAFETY: executable ranges are always readable.
        let bytes = unsafe { mem.read_bytes(range.base, len) };
        hasher.write(bytes);
    }
    (hasher.finish() as u32) & 0x00FF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use grr_core::page::PagePerms;

    #[test]
    fn hash_changes_when_page_contents_change() {
        let mem = GuestMemory::new().unwrap();
        let addr = 0x0810_0000u32;
        mem.mmap_fixed(addr, 4096, libc::PROT_READ | libc::PROT_WRITE)
            .unwrap();
        let mut range = PageRange::new(addr, addr + 4096, PagePerms::RX);
        range.lazy_base = addr + 4096;

        unsafe { mem.write_bytes(addr, &[0x90; 16]) };
        let h1 = hash_executable_pages(&mem, std::iter::once(&range));

        unsafe { mem.write_bytes(addr, &[0xCC; 16]) };
        let h2 = hash_executable_pages(&mem, std::iter::once(&range));

        assert_ne!(h1, h2);
        assert_eq!(h1 & !0x00FF_FFFF, 0);
    }
}
