use grr_core::constants::PAGE_SIZE;

use crate::process::Process;

/// Outcome of a blocking-capable file operation. `InProgress` means the
/// scheduler should retry the syscall next round rather than complete it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileIoStatus {
    Completed,
    Faulted,
    InProgress,
}

const BUFFER_SIZE: usize = (PAGE_SIZE as usize) * 46;

/// A single emulated DECREE file descriptor's ring buffer and blocked
/// reader/writer state. Readers may under-read; writers block if a write
/// would overflow the buffer.
pub struct File {
    buffer: Vec<u8>,
    writer_head: usize,
    reader_head: usize,
    blocked_writer_count: usize,
    blocked_writer: Option<i32>,
    blocked_reader: Option<i32>,
}

impl Default for File {
    fn default() -> Self {
        Self::new()
    }
}

impl File {
    pub fn new() -> Self {
        File {
            buffer: vec![0u8; BUFFER_SIZE],
            writer_head: 0,
            reader_head: 0,
            blocked_writer_count: 0,
            blocked_writer: None,
            blocked_reader: None,
        }
    }

    pub fn read_will_block(&self, pid: i32) -> bool {
        self.reader_head == self.writer_head || self.blocked_reader.is_some_and(|b| b != pid)
    }

    pub fn write_will_block(&self, pid: i32) -> bool {
        (self.writer_head - self.reader_head + self.blocked_writer_count) > self.buffer.len()
            || self.blocked_writer.is_some_and(|b| b != pid)
    }

    /// Reads up to `count` bytes into guest memory at `buf_addr`, and
    /// writes the actual byte count to `num_bytes_addr` if non-zero.
    pub fn read(
        &mut self,
        process: &Process,
        num_bytes_addr: u32,
        buf_addr: u32,
        count: u32,
    ) -> FileIoStatus {
        let mut completed = 0usize;
        if count > 0 {
            if let Some(blocked) = self.blocked_reader {
                if blocked != process.pid() {
                    return FileIoStatus::InProgress;
                } else if self.reader_head == self.writer_head {
                    return FileIoStatus::InProgress;
                } else {
                    self.blocked_reader = None;
                }
            } else if self.reader_head == self.writer_head {
                self.blocked_reader = Some(process.pid());
                return FileIoStatus::InProgress;
            }

            let max_count = (self.writer_head - self.reader_head).min(count as usize);
            let mut status = FileIoStatus::Completed;
            for i in 0..max_count {
                let byte = self.buffer[(self.reader_head + i) % self.buffer.len()];
                if !process.try_write_bytes(buf_addr + i as u32, &[byte]) {
                    status = FileIoStatus::Faulted;
                    break;
                }
                completed += 1;
            }
            self.reader_head += completed;
            if status == FileIoStatus::Faulted {
                return status;
            }
        }

        if num_bytes_addr != 0 && !process.try_write_u32(num_bytes_addr, completed as u32) {
            return FileIoStatus::Faulted;
        }
        FileIoStatus::Completed
    }

    /// Writes up to `count` bytes from guest memory at `buf_addr`.
    pub fn write(
        &mut self,
        process: &Process,
        num_bytes_addr: u32,
        buf_addr: u32,
        count: u32,
    ) -> FileIoStatus {
        let mut completed = 0usize;
        if count > 0 {
            if let Some(blocked) = self.blocked_writer {
                if blocked != process.pid() {
                    return FileIoStatus::InProgress;
                } else if (self.writer_head - self.reader_head + count as usize) > self.buffer.len() {
                    return FileIoStatus::InProgress;
                } else {
                    self.blocked_writer_count = 0;
                    self.blocked_writer = None;
                }
            } else if (self.writer_head - self.reader_head + count as usize) > self.buffer.len() {
                self.blocked_writer = Some(process.pid());
                self.blocked_writer_count = count as usize;
                return FileIoStatus::InProgress;
            }

            let mut status = FileIoStatus::Completed;
            let mut byte = [0u8; 1];
            for i in 0..count as usize {
                if !process.try_read_bytes(buf_addr + i as u32, &mut byte) {
                    status = FileIoStatus::Faulted;
                    break;
                }
                self.buffer[(self.writer_head + i) % self.buffer.len()] = byte[0];
                completed += 1;
            }
            self.writer_head += completed;
            if status == FileIoStatus::Faulted {
                return status;
            }
        }

        if num_bytes_addr != 0 && !process.try_write_u32(num_bytes_addr, completed as u32) {
            return FileIoStatus::Faulted;
        }
        FileIoStatus::Completed
    }

    pub fn cancel(&mut self) {
        self.blocked_reader = None;
        self.blocked_writer = None;
        self.blocked_writer_count = 0;
    }
}

/// Open files indexed by DECREE fd. Fds 0/1/2 (stdin/stdout/stderr) are
/// present by construction, matching DECREE's fixed three-descriptor set.
pub struct FileTable {
    files: Vec<File>,
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    pub fn new() -> Self {
        FileTable { files: (0..3).map(|_| File::new()).collect() }
    }

    pub fn get(&self, fd: i32) -> Option<&File> {
        usize::try_from(fd).ok().and_then(|i| self.files.get(i))
    }

    pub fn get_mut(&mut self, fd: i32) -> Option<&mut File> {
        usize::try_from(fd).ok().and_then(|i| self.files.get_mut(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grr_core::PagePerms;

    fn process_with_buffer(pid: i32) -> (Process, u32) {
        let mut process = Process::new(pid).unwrap();
        let addr = process.allocate(4096, PagePerms::RW).unwrap();
        process.try_lazy_map(addr);
        (process, addr)
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut file = File::new();
        let (process, buf) = process_with_buffer(1);

        process.try_write_bytes(buf, b"hi");
        let status = file.write(&process, 0, buf, 2);
        assert_eq!(status, FileIoStatus::Completed);

        let status = file.read(&process, 0, buf + 16, 2);
        assert_eq!(status, FileIoStatus::Completed);
        let mut out = [0u8; 2];
        process.try_read_bytes(buf + 16, &mut out);
        assert_eq!(&out, b"hi");
    }

    #[test]
    fn read_on_empty_buffer_blocks() {
        let mut file = File::new();
        let (process, buf) = process_with_buffer(2);
        let status = file.read(&process, 0, buf, 4);
        assert_eq!(status, FileIoStatus::InProgress);
    }
}
