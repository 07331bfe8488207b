//! The `GRRS` process-snapshot file: a register block plus the mapped
//! memory ranges needed to revive a process byte-for-byte, the same
//! information `granary/os/decree_user/snapshot.cc` and
//! `granary/os/snapshot.{h,cc}` capture before fuzzing begins and restore
//! before every run.

use std::io::{Read, Write};
use std::path::Path;

use grr_core::page::PagePerms;
use grr_core::Addr32;
use grr_process::Process;

use crate::error::{Error, Result};
use crate::gregs;

const MAGIC: &[u8; 4] = b"GRRS";
const HEADER_LEN: usize = 4 + 4 + gregs::NUM_GREGS * 8 + 512;
const RANGE_RECORD_LEN: usize = 20;

/// One mapped range as captured at snapshot time: how much of it was
/// actually backed (`lazy_begin`), and its resident bytes.
#[derive(Debug, Clone)]
pub struct MappedRange {
    pub begin: Addr32,
    pub end: Addr32,
    pub lazy_begin: Addr32,
    pub perms: PagePerms,
    pub data: Vec<u8>,
}

pub struct Snapshot {
    pub exe_num: i32,
    pub gregs: [u64; gregs::NUM_GREGS],
    pub fpregs: [u8; 512],
    pub ranges: Vec<MappedRange>,
}

impl Snapshot {
    /// Captures `process`'s current state. Ranges overlapping the guest
    /// stack are moved to the end of the list, mirroring the original's
    /// convention that the stack range is always last.
    pub fn capture(process: &Process, exe_num: i32) -> Snapshot {
        let mut ranges: Vec<MappedRange> = process
            .pages
            .ranges()
            .iter()
            .map(|r| {
                let backed = (r.lazy_base - r.base) as usize;
                let data = if backed > 0 {
                    // SAFETY: `[base, lazy_base)` is exactly the backed
                    // prefix of this range.
                    unsafe { process.mem.read_bytes(r.base, backed) }.to_vec()
                } else {
                    Vec::new()
                };
                MappedRange {
                    begin: r.base,
                    end: r.limit,
                    lazy_begin: r.lazy_base,
                    perms: r.perms,
                    data,
                }
            })
            .collect();
        ranges.sort_by_key(|r| r.begin >= grr_core::constants::STACK_BEGIN);

        Snapshot {
            exe_num,
            gregs: gregs::from_hot(&process.hot),
            fpregs: process.fpregs,
            ranges,
        }
    }

    /// Rebuilds a fresh [`Process`] from this snapshot. Every saved range
    /// is backed immediately up to its saved `lazy_begin`; the remainder
    /// (if any) is left `Reserved` for `try_lazy_map` to back later, via
    /// `PageTable::map_partial`.
    pub fn revive(&self, pid: i32) -> Result<Process> {
        let mut process = Process::new(pid)?;
        gregs::apply_to_hot(&self.gregs, &mut process.hot);
        process.fpregs = self.fpregs;

        for range in &self.ranges {
            process
                .pages
                .map_partial(&process.mem, range.begin, range.end, range.lazy_begin, range.perms)?;
            if !range.data.is_empty() {
                // SAFETY: `map_partial` just backed `[begin, lazy_begin)`.
                unsafe { process.mem.write_bytes(range.begin, &range.data) };
            }
        }
        Ok(process)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.ranges.len() * RANGE_RECORD_LEN + RANGE_RECORD_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.exe_num.to_le_bytes());
        for g in &self.gregs {
            out.extend_from_slice(&g.to_le_bytes());
        }
        out.extend_from_slice(&self.fpregs);

        let mut fd_offs = 0u32;
        for range in &self.ranges {
            write_range_record(&mut out, fd_offs, range);
            fd_offs += range.data.len() as u32;
        }
        // Zero-limit sentinel terminates the range list.
        out.extend_from_slice(&[0u8; RANGE_RECORD_LEN]);

        for range in &self.ranges {
            out.extend_from_slice(&range.data);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Snapshot> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }
        if &bytes[0..4] != MAGIC {
            return Err(Error::BadMagic);
        }
        let exe_num = i32::from_le_bytes(bytes[4..8].try_into().unwrap());

        let mut gregs = [0u64; gregs::NUM_GREGS];
        let mut cursor = 8;
        for g in gregs.iter_mut() {
            *g = u64::from_le_bytes(bytes[cursor..cursor + 8].try_into().unwrap());
            cursor += 8;
        }
        let mut fpregs = [0u8; 512];
        fpregs.copy_from_slice(&bytes[cursor..cursor + 512]);
        cursor += 512;

        let mut headers = Vec::new();
        loop {
            if bytes.len() < cursor + RANGE_RECORD_LEN {
                return Err(Error::Truncated);
            }
            let record = &bytes[cursor..cursor + RANGE_RECORD_LEN];
            cursor += RANGE_RECORD_LEN;
            let fd_offs = u32::from_le_bytes(record[0..4].try_into().unwrap());
            let begin = u32::from_le_bytes(record[4..8].try_into().unwrap());
            let end = u32::from_le_bytes(record[8..12].try_into().unwrap());
            let lazy_begin = u32::from_le_bytes(record[12..16].try_into().unwrap());
            if end == 0 {
                break;
            }
            let is_r = record[16] != 0;
            let is_w = record[17] != 0;
            let is_x = record[18] != 0;
            headers.push((fd_offs, begin, end, lazy_begin, perms_from_rwx(is_r, is_w, is_x)));
        }

        let data_start = cursor;
        let mut ranges = Vec::with_capacity(headers.len());
        for (fd_offs, begin, end, lazy_begin, perms) in headers {
            let len = (lazy_begin - begin) as usize;
            let start = data_start + fd_offs as usize;
            let end_off = start + len;
            if bytes.len() < end_off {
                return Err(Error::Truncated);
            }
            ranges.push(MappedRange {
                begin,
                end,
                lazy_begin,
                perms,
                data: bytes[start..end_off].to_vec(),
            });
        }

        Ok(Snapshot { exe_num, gregs, fpregs, ranges })
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(&self.to_bytes())?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Snapshot> {
        let mut bytes = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut bytes)?;
        Snapshot::from_bytes(&bytes)
    }
}

fn write_range_record(out: &mut Vec<u8>, fd_offs: u32, range: &MappedRange) {
    out.extend_from_slice(&fd_offs.to_le_bytes());
    out.extend_from_slice(&range.begin.to_le_bytes());
    out.extend_from_slice(&range.end.to_le_bytes());
    out.extend_from_slice(&range.lazy_begin.to_le_bytes());
    let (r, w, x) = rwx_from_perms(range.perms);
    out.push(r as u8);
    out.push(w as u8);
    out.push(x as u8);
    out.push(0); // pad
}

fn rwx_from_perms(perms: PagePerms) -> (bool, bool, bool) {
    (perms.is_readable(), perms.is_writable(), perms.is_executable())
}

fn perms_from_rwx(r: bool, w: bool, x: bool) -> PagePerms {
    match (r, w, x) {
        (_, true, true) => PagePerms::RWX,
        (_, false, true) => PagePerms::RX,
        (_, true, false) => PagePerms::RW,
        (true, false, false) => PagePerms::RO,
        (false, false, false) => PagePerms::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grr_core::PagePerms as P;

    fn sample_process() -> Process {
        let mut process = Process::new(7).unwrap();
        let addr = process.allocate(4096, P::RW).unwrap();
        assert!(process.try_lazy_map(addr));
        assert!(process.try_write_bytes(addr, b"hello snapshot"));
        process.hot.eax = 0xdead_beef;
        process.hot.eip = addr;
        process
    }

    #[test]
    fn capture_and_revive_round_trips_registers_and_memory() {
        let process = sample_process();
        let addr = process.hot.eip;
        let snap = Snapshot::capture(&process, 7);

        let revived = snap.revive(7).unwrap();
        assert_eq!(revived.hot.eax, 0xdead_beef);
        assert_eq!(revived.hot.eip, addr);

        let mut buf = [0u8; 14];
        assert!(revived.try_read_bytes(addr, &mut buf));
        assert_eq!(&buf, b"hello snapshot");
    }

    #[test]
    fn serializes_and_parses_through_bytes() {
        let process = sample_process();
        let snap = Snapshot::capture(&process, 7);
        let bytes = snap.to_bytes();
        let parsed = Snapshot::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.exe_num, 7);
        assert_eq!(parsed.gregs, snap.gregs);
        assert_eq!(parsed.ranges.len(), snap.ranges.len());
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = vec![0u8; HEADER_LEN + RANGE_RECORD_LEN];
        assert!(matches!(Snapshot::from_bytes(&bytes), Err(Error::BadMagic)));
    }

    #[test]
    fn round_trips_through_a_file() {
        let process = sample_process();
        let snap = Snapshot::capture(&process, 7);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cb.snapshot");
        snap.write_to_file(&path).unwrap();
        let read_back = Snapshot::read_from_file(&path).unwrap();
        assert_eq!(read_back.exe_num, 7);
    }
}
