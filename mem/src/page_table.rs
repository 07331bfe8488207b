use grr_core::constants::{page_align_down, page_align_up, MAGIC_PAGE_BEGIN, MAX_ADDRESS, PAGE_SIZE};
use grr_core::page::{PagePerms, PageRange, PageState};
use grr_core::{Addr32, Error, Result};

use crate::GuestMemory;

fn host_prot(perms: PagePerms) -> i32 {
    match perms {
        PagePerms::Invalid => libc::PROT_NONE,
        PagePerms::RO => libc::PROT_READ,
        PagePerms::RW => libc::PROT_READ | libc::PROT_WRITE,
        PagePerms::RWX => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        PagePerms::RX => libc::PROT_READ | libc::PROT_EXEC,
    }
}

/// Host protection for a page actually in state `state`, as opposed to
/// whatever the guest's nominal `perms` would allow. An `RWX` range's pages
/// start out `RX`-mapped, not `RWX`-mapped, so a guest write to fresh code
/// actually traps instead of silently succeeding.
fn host_prot_for_state(state: PageState) -> i32 {
    match state {
        PageState::Reserved => libc::PROT_NONE,
        PageState::RO => libc::PROT_READ,
        PageState::RW => libc::PROT_READ | libc::PROT_WRITE,
        PageState::RX => libc::PROT_READ | libc::PROT_EXEC,
    }
}

/// Tracks every page range `Allocate`/`mmap_fixed` has handed out, and the
/// lazy RO/RW/RX state machine each range moves through as faults touch it.
///
/// New allocations are handed out from high memory downward, below
/// `MAX_ADDRESS` and above the magic page, the same direction
/// `AllocateFromHighMem` grows in the original.
pub struct PageTable {
    ranges: Vec<PageRange>,
    next_high: Addr32,
}

impl PageTable {
    pub fn new() -> Self {
        PageTable {
            ranges: Vec::new(),
            next_high: MAX_ADDRESS,
        }
    }

    pub fn ranges(&self) -> &[PageRange] {
        &self.ranges
    }

    fn find_index(&self, addr: Addr32) -> Option<usize> {
        self.ranges.iter().position(|r| r.contains(addr))
    }

    pub fn find(&self, addr: Addr32) -> Option<&PageRange> {
        self.ranges.iter().find(|r| r.contains(addr))
    }

    /// Register a fixed-address range (used for the ELF image, the magic
    /// page, and the guest stack), backing it immediately.
    pub fn map_fixed(
        &mut self,
        mem: &GuestMemory,
        base: Addr32,
        len: u32,
        perms: PagePerms,
    ) -> Result<()> {
        let limit = page_align_up((base as u64) + (len as u64)) as Addr32;
        self.map_partial(mem, base, limit, limit, perms)
    }

    /// Registers `[base, limit)` like [`map_fixed`](Self::map_fixed), but
    /// only backs the first `lazy_limit - base` bytes; the remainder stays
    /// a reserved placeholder until [`try_lazy_map`](Self::try_lazy_map)
    /// backs it page by page. Used to revive a snapshotted range that
    /// recorded less than its full length as resident (the guest stack,
    /// whose top couple of pages of an 8 MiB reservation is typically all
    /// that was ever touched).
    pub fn map_partial(
        &mut self,
        mem: &GuestMemory,
        base: Addr32,
        limit: Addr32,
        lazy_limit: Addr32,
        perms: PagePerms,
    ) -> Result<()> {
        let base = page_align_down(base as u64) as Addr32;
        let limit = page_align_up(limit as u64) as Addr32;
        let lazy_limit = (page_align_up(lazy_limit as u64) as Addr32).clamp(base, limit);
        let state = if lazy_limit > base { state_for(perms) } else { PageState::Reserved };
        if lazy_limit > base {
            mem.mmap_fixed(base, (lazy_limit - base) as usize, host_prot_for_state(state))?;
        }
        let mut range = PageRange::new(base, limit, perms);
        range.lazy_base = lazy_limit;
        range.state = state;
        self.insert_sorted(range);
        Ok(())
    }

    /// Reserve a new range somewhere in high memory without backing it yet;
    /// the first access lazily maps it via [`try_lazy_map`](Self::try_lazy_map).
    pub fn allocate(&mut self, num_bytes: usize, perms: PagePerms) -> Result<Addr32> {
        let len = page_align_up(num_bytes as u64) as Addr32;
        if len == 0 || self.next_high < len || self.next_high - len <= MAGIC_PAGE_BEGIN {
            return Err(Error::CacheFull);
        }
        self.next_high -= len;
        let base = self.next_high;
        let limit = base + len;
        self.insert_sorted(PageRange::new(base, limit, perms));
        Ok(base)
    }

    /// Frees `[addr, addr + num_bytes)`, which may cover only part of the
    /// range registered at `addr`. Partitions that range into whichever of
    /// a kept prefix / kept suffix survive the cut, so the untouched
    /// remainder stays tracked in the table, and `mprotect`s only the bytes
    /// actually being freed rather than the whole original range. Mirrors
    /// `Process32::Deallocate`'s per-page partition loop.
    pub fn deallocate(&mut self, mem: &GuestMemory, addr: Addr32, num_bytes: usize) -> Result<()> {
        let idx = self
            .find_index(addr)
            .ok_or(Error::PageNotMapped(addr))?;
        let range = self.ranges.remove(idx);
        let free_limit = ((addr as u64) + (num_bytes as u64)).min(range.limit as u64) as Addr32;

        if addr > range.base {
            let mut prefix = range.clone();
            prefix.limit = addr;
            prefix.lazy_base = range.lazy_base.clamp(range.base, addr);
            self.insert_sorted(prefix);
        }
        if free_limit < range.limit {
            let mut suffix = range.clone();
            suffix.base = free_limit;
            suffix.lazy_base = range.lazy_base.clamp(free_limit, range.limit);
            self.insert_sorted(suffix);
        }

        if free_limit > addr {
            mem.mprotect(addr, (free_limit - addr) as usize, libc::PROT_NONE)?;
        }
        Ok(())
    }

    fn insert_sorted(&mut self, range: PageRange) {
        let pos = self
            .ranges
            .iter()
            .position(|r| range.cmp_reverse_base(r) == std::cmp::Ordering::Less)
            .unwrap_or(self.ranges.len());
        self.ranges.insert(pos, range);
    }

    /// Splits the range at `idx` so that `[sub_base, sub_limit)` — itself a
    /// sub-interval of that range — becomes its own tracked `PageRange`,
    /// apportioning `lazy_base` to whichever pieces result. Returns the
    /// index of the `[sub_base, sub_limit)` piece after the split, so a
    /// caller can mutate its state independently of any sibling page.
    fn split_range(&mut self, idx: usize, sub_base: Addr32, sub_limit: Addr32) -> usize {
        let range = self.ranges.remove(idx);
        if sub_base == range.base && sub_limit == range.limit {
            self.insert_sorted(range);
            return self.find_index(sub_base).expect("just inserted");
        }

        if sub_base > range.base {
            let mut prefix = range.clone();
            prefix.limit = sub_base;
            prefix.lazy_base = range.lazy_base.clamp(range.base, sub_base);
            self.insert_sorted(prefix);
        }
        if sub_limit < range.limit {
            let mut suffix = range.clone();
            suffix.base = sub_limit;
            suffix.lazy_base = range.lazy_base.clamp(sub_limit, range.limit);
            self.insert_sorted(suffix);
        }

        let mut middle = range;
        middle.base = sub_base;
        middle.limit = sub_limit;
        middle.lazy_base = middle.lazy_base.clamp(sub_base, sub_limit);
        self.insert_sorted(middle);

        self.find_index(sub_base).expect("just inserted")
    }

    /// Extends the backing of the range containing `addr` to cover it, if
    /// `addr` is the next not-yet-backed page in that range. Returns
    /// `false` — not just "no new mapping needed", but "this handler
    /// doesn't apply" — if `addr` isn't inside any known range, or is
    /// already backed (a fault there has some other cause, like a
    /// protection mismatch `try_make_writable` should handle instead).
    pub fn try_lazy_map(&mut self, mem: &GuestMemory, addr: Addr32) -> Result<bool> {
        let idx = match self.find_index(addr) {
            Some(i) => i,
            None => return Ok(false),
        };
        let range = &mut self.ranges[idx];
        if addr < range.lazy_base {
            return Ok(false); // already backed; not this handler's fault to fix
        }
        let page = page_align_down(addr as u64) as Addr32;
        let new_lazy_base = page + PAGE_SIZE as u32;
        let state = state_for(range.perms);
        mem.mmap_fixed(
            range.lazy_base,
            (new_lazy_base - range.lazy_base) as usize,
            host_prot_for_state(state),
        )?;
        range.lazy_base = new_lazy_base;
        range.state = state;
        range.hash_is_valid = false;
        Ok(true)
    }

    /// Moves the page containing `addr` from `RX` back to readable-and-
    /// writable, for `RWX` ranges whose current state is `RX` because they
    /// were last touched by execution. Splits that single page out of its
    /// range first, so a sibling page inside the same `RWX` allocation
    /// that was never executed keeps its own state untouched. Mirrors
    /// `TryMakeWritable`.
    pub fn try_make_writable(&mut self, mem: &GuestMemory, addr: Addr32) -> Result<bool> {
        let idx = match self.find_index(addr) {
            Some(i) => i,
            None => return Ok(false),
        };
        if self.ranges[idx].perms != PagePerms::RWX || self.ranges[idx].state != PageState::RX {
            return Ok(false);
        }

        let page = page_align_down(addr as u64) as Addr32;
        let page_limit = (page + PAGE_SIZE as u32).min(self.ranges[idx].limit);
        let idx = self.split_range(idx, page, page_limit);

        let range = &mut self.ranges[idx];
        mem.mprotect(
            range.base,
            (range.lazy_base - range.base) as usize,
            host_prot(PagePerms::RW),
        )?;
        range.state = PageState::RW;
        range.hash_is_valid = false;
        Ok(true)
    }

    /// Moves the page containing `addr` from `RW` to `RX`, for `RWX` ranges
    /// about to be executed. Splits that single page out of its range
    /// first, the same way [`try_make_writable`](Self::try_make_writable)
    /// does, so executing one page of a multi-page `RWX` allocation never
    /// flips a sibling page that hasn't run yet. Mirrors `TryMakeExecutable`.
    pub fn try_make_executable(&mut self, mem: &GuestMemory, addr: Addr32) -> Result<bool> {
        let idx = match self.find_index(addr) {
            Some(i) => i,
            None => return Ok(false),
        };
        if !self.ranges[idx].perms.is_executable() {
            return Ok(false);
        }
        if self.ranges[idx].state == PageState::RX {
            return Ok(true);
        }

        let page = page_align_down(addr as u64) as Addr32;
        let page_limit = (page + PAGE_SIZE as u32).min(self.ranges[idx].limit);
        let idx = self.split_range(idx, page, page_limit);

        let range = &mut self.ranges[idx];
        mem.mprotect(
            range.base,
            (range.lazy_base - range.base) as usize,
            host_prot(if range.perms == PagePerms::RWX { PagePerms::RX } else { range.perms }),
        )?;
        range.state = PageState::RX;
        Ok(true)
    }

    /// All pages backed with execute permission, used to build the page
    /// hash that keys the code cache index.
    pub fn executable_ranges(&self) -> impl Iterator<Item = &PageRange> {
        self.ranges.iter().filter(|r| r.perms.is_executable())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

fn state_for(perms: PagePerms) -> PageState {
    match perms {
        PagePerms::Invalid => PageState::Reserved,
        PagePerms::RO => PageState::RO,
        PagePerms::RW => PageState::RW,
        PagePerms::RWX | PagePerms::RX => PageState::RX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_grows_downward_from_max_address() {
        let mut table = PageTable::new();
        let a = table.allocate(4096, PagePerms::RW).unwrap();
        let b = table.allocate(4096, PagePerms::RW).unwrap();
        assert!(b < a);
        assert_eq!(a, MAX_ADDRESS - PAGE_SIZE as u32);
    }

    #[test]
    fn allocate_rejects_exhaustion() {
        let mut table = PageTable::new();
        let huge = (MAX_ADDRESS - MAGIC_PAGE_BEGIN) as usize + PAGE_SIZE as usize;
        assert!(table.allocate(huge, PagePerms::RW).is_err());
    }

    #[test]
    fn lazy_map_then_deallocate_round_trips() {
        let mem = GuestMemory::new().unwrap();
        let mut table = PageTable::new();
        let addr = table.allocate(4096, PagePerms::RW).unwrap();
        assert!(table.try_lazy_map(&mem, addr).unwrap());
        unsafe { mem.write_bytes(addr, b"ok") };
        table.deallocate(&mem, addr, 4096).unwrap();
        assert!(table.find(addr).is_none());
    }

    #[test]
    fn fresh_rwx_page_is_mapped_rx_only_not_rwx() {
        let mem = GuestMemory::new().unwrap();
        let mut table = PageTable::new();
        let addr = table.allocate(4096, PagePerms::RWX).unwrap();
        assert!(table.try_lazy_map(&mem, addr).unwrap());
        assert_eq!(table.find(addr).unwrap().state, PageState::RX);
        // A genuinely RX-only host mapping rejects a write; if this ever
        // silently succeeded the host page was mapped RWX by mistake.
        let ret = unsafe { libc::mprotect(mem.g2h(addr) as *mut libc::c_void, 4096, libc::PROT_READ) };
        assert_eq!(ret, 0);
    }

    #[test]
    fn executing_one_page_of_a_multi_page_rwx_range_leaves_sibling_untouched() {
        let mem = GuestMemory::new().unwrap();
        let mut table = PageTable::new();
        let base = table.allocate(2 * PAGE_SIZE as usize, PagePerms::RWX).unwrap();
        assert!(table.try_lazy_map(&mem, base).unwrap());
        assert!(table.try_lazy_map(&mem, base + PAGE_SIZE as u32).unwrap());
        assert!(table.try_make_writable(&mem, base).unwrap());

        assert_eq!(table.find(base).unwrap().state, PageState::RW);
        assert_eq!(table.find(base + PAGE_SIZE as u32).unwrap().state, PageState::RX);
        assert_eq!(table.ranges().len(), 2);
    }

    #[test]
    fn partial_deallocate_keeps_tracking_the_untouched_remainder() {
        let mem = GuestMemory::new().unwrap();
        let mut table = PageTable::new();
        let base = table.allocate(3 * PAGE_SIZE as usize, PagePerms::RW).unwrap();
        assert!(table.try_lazy_map(&mem, base).unwrap());
        assert!(table.try_lazy_map(&mem, base + PAGE_SIZE as u32).unwrap());
        assert!(table.try_lazy_map(&mem, base + 2 * PAGE_SIZE as u32).unwrap());

        // Free only the middle page.
        table.deallocate(&mem, base + PAGE_SIZE as u32, PAGE_SIZE as usize).unwrap();

        assert!(table.find(base).is_some());
        assert!(table.find(base + PAGE_SIZE as u32).is_none());
        assert!(table.find(base + 2 * PAGE_SIZE as u32).is_some());
    }
}
