use grr_core::constants::{page_align_up, MAGIC_PAGE_BEGIN, MAGIC_PAGE_END, TASK_SIZE};
use grr_core::PagePerms;
use grr_process::{FileTable, Process, ProcessStatus};

use crate::abi::{errno, Selector, SyscallAbi};
use crate::input::InputTape;

const STDIN: u32 = 0;
const STDOUT: u32 = 1;
const STDERR: u32 = 2;

/// Outcome of one syscall dispatch, steering the scheduler's next move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallStatus {
    Complete,
    InProgress,
    Sleeping,
    Terminated,
}

/// Decodes and runs one `INT 0x80` syscall. `stdout`/`stderr` receive
/// `transmit`'s bytes when given; `input` backs `receive` on fd 0.
pub fn dispatch(
    process: &mut Process,
    files: &mut FileTable,
    input: &mut InputTape,
    mut stdout: impl std::io::Write,
) -> SyscallStatus {
    let mut abi = SyscallAbi::new(process);
    match abi.number() {
        Selector::Invalid => {
            abi.set_return(errno::ENOSYS);
            SyscallStatus::Complete
        }
        Selector::Terminate => {
            log::debug!("pid {} terminating with code {}", abi.process().pid(), abi.arg1());
            abi.process_mut().status = ProcessStatus::Done;
            abi.set_return(0);
            SyscallStatus::Terminated
        }
        Selector::Transmit => transmit(&mut abi, files, &mut stdout),
        Selector::Receive => receive(&mut abi, files, input),
        Selector::Fdwait => fdwait(&mut abi, files),
        Selector::Allocate => allocate(&mut abi),
        Selector::Deallocate => deallocate(&mut abi),
        Selector::Random => random(&mut abi),
    }
}

fn transmit(abi: &mut SyscallAbi, files: &mut FileTable, stdout: &mut impl std::io::Write) -> SyscallStatus {
    let fd = abi.arg1();
    let buf = abi.arg2();
    let length = abi.arg3();
    let tx_bytes_addr = abi.arg4();

    if length > i32::MAX as u32 {
        abi.set_return(errno::EINVAL);
        return SyscallStatus::Complete;
    }

    let mut data = vec![0u8; length as usize];
    if length > 0 && !abi.process().try_read_bytes(buf, &mut data) {
        abi.set_return(errno::EFAULT);
        return SyscallStatus::Complete;
    }

    if fd == STDIN || fd == STDOUT || fd == STDERR {
        if fd != STDERR {
            let _ = stdout.write_all(&data);
        }
        if tx_bytes_addr != 0 && !abi.process().try_write_u32(tx_bytes_addr, length) {
            abi.set_return(errno::EFAULT);
        } else {
            abi.set_return(0);
        }
        return SyscallStatus::Complete;
    }

    match files.get_mut(fd as i32) {
        None => {
            abi.set_return(errno::EBADF);
            SyscallStatus::Complete
        }
        Some(file) => convert_status(abi, file.write(abi.process(), tx_bytes_addr, buf, length)),
    }
}

fn receive(abi: &mut SyscallAbi, files: &mut FileTable, input: &mut InputTape) -> SyscallStatus {
    let fd = abi.arg1();
    let buf = abi.arg2();
    let length = abi.arg3();
    let rx_bytes_addr = abi.arg4();

    if length > i32::MAX as u32 {
        abi.set_return(errno::EINVAL);
        return SyscallStatus::Complete;
    }

    if fd == STDIN || fd == STDOUT || fd == STDERR {
        let mut written = 0u32;
        let mut faulted = false;
        let chunk = input.take(length as usize).to_vec();
        for (i, byte) in chunk.iter().enumerate() {
            if !abi.process().try_write_bytes(buf + i as u32, &[*byte]) {
                faulted = true;
                break;
            }
            written += 1;
        }

        if faulted {
            abi.set_return(errno::EFAULT);
        } else if rx_bytes_addr != 0 && !abi.process().try_write_u32(rx_bytes_addr, written) {
            abi.set_return(errno::EFAULT);
        } else {
            abi.set_return(0);
        }
        return SyscallStatus::Complete;
    }

    match files.get_mut(fd as i32) {
        None => {
            abi.set_return(errno::EBADF);
            SyscallStatus::Complete
        }
        Some(file) => convert_status(abi, file.read(abi.process(), rx_bytes_addr, buf, length)),
    }
}

fn convert_status(abi: &mut SyscallAbi, status: grr_process::FileIoStatus) -> SyscallStatus {
    use grr_process::FileIoStatus;
    match status {
        FileIoStatus::Completed => {
            abi.set_return(0);
            SyscallStatus::Complete
        }
        FileIoStatus::Faulted => {
            abi.set_return(errno::EFAULT);
            SyscallStatus::Complete
        }
        FileIoStatus::InProgress => SyscallStatus::InProgress,
    }
}

/// `fd_set`s are emulated as a flat little-endian bitmask read directly out
/// of guest memory rather than reconstructing DECREE's `_fd_bits` layout
/// bit-for-bit; the bit numbering (fd == bit index) is preserved.
fn fdwait(abi: &mut SyscallAbi, files: &mut FileTable) -> SyscallStatus {
    let nfds = abi.arg1() as i32;
    let readfds_addr = abi.arg2();
    let writefds_addr = abi.arg3();
    let timeout_addr = abi.arg4();
    let readyfds_addr = abi.arg5();

    if nfds < 0 {
        abi.set_return(errno::EINVAL);
        return SyscallStatus::Complete;
    }

    let mut has_timeout = false;
    let mut timeout_secs = 0i32;
    if timeout_addr != 0 {
        let sec = abi.process().try_read_u32(timeout_addr);
        let usec = abi.process().try_read_u32(timeout_addr + 4);
        match (sec, usec) {
            (Some(s), Some(u)) => {
                if (s as i32) < 0 || (u as i32) < 0 {
                    abi.set_return(errno::EINVAL);
                    return SyscallStatus::Complete;
                }
                has_timeout = s != 0 || u != 0;
                timeout_secs = s as i32;
            }
            _ => {
                abi.set_return(errno::EFAULT);
                return SyscallStatus::Complete;
            }
        }
    }

    let fd_set_bytes = 128usize; // 1024 bits, matches `decree_fd_set`.
    let mut read_set = vec![0u8; fd_set_bytes];
    let mut write_set = vec![0u8; fd_set_bytes];
    if readfds_addr != 0 && !abi.process().try_read_bytes(readfds_addr, &mut read_set) {
        abi.set_return(errno::EFAULT);
        return SyscallStatus::Complete;
    }
    if writefds_addr != 0 && !abi.process().try_read_bytes(writefds_addr, &mut write_set) {
        abi.set_return(errno::EFAULT);
        return SyscallStatus::Complete;
    }

    let mut ready = 0i32;
    if readfds_addr != 0 {
        for fd in 0..nfds {
            if !bit_set(&read_set, fd as usize) {
                continue;
            }
            let blocks = fd >= 3 && files.get(fd as i32).map(|f| f.read_will_block(abi.process().pid())).unwrap_or(true);
            if blocks {
                clear_bit(&mut read_set, fd as usize);
            } else {
                ready += 1;
            }
        }
    }
    if writefds_addr != 0 {
        for fd in 0..nfds {
            if !bit_set(&write_set, fd as usize) {
                continue;
            }
            let blocks = fd >= 3 && files.get(fd as i32).map(|f| f.write_will_block(abi.process().pid())).unwrap_or(true);
            if blocks {
                clear_bit(&mut write_set, fd as usize);
            } else {
                ready += 1;
            }
        }
    }

    if readyfds_addr != 0 && !abi.process().try_write_u32(readyfds_addr, ready as u32) {
        abi.set_return(errno::EFAULT);
        return SyscallStatus::Complete;
    }

    if ready == 0 {
        if !has_timeout && timeout_addr == 0 {
            return SyscallStatus::InProgress;
        }
        if has_timeout {
            if abi.process().schedule_delay <= 0 {
                abi.process_mut().schedule_delay = timeout_secs.max(1);
                return SyscallStatus::Sleeping;
            }
            abi.process_mut().schedule_delay -= 1;
            if abi.process().schedule_delay > 0 {
                return SyscallStatus::Sleeping;
            }
        }
    }

    if readfds_addr != 0 {
        abi.process().try_write_bytes(readfds_addr, &read_set);
    }
    if writefds_addr != 0 {
        abi.process().try_write_bytes(writefds_addr, &write_set);
    }

    abi.set_return(0);
    SyscallStatus::Complete
}

fn bit_set(set: &[u8], fd: usize) -> bool {
    set.get(fd / 8).map(|b| b & (1 << (fd % 8)) != 0).unwrap_or(false)
}

fn clear_bit(set: &mut [u8], fd: usize) {
    if let Some(b) = set.get_mut(fd / 8) {
        *b &= !(1 << (fd % 8));
    }
}

fn allocate(abi: &mut SyscallAbi) -> SyscallStatus {
    let length = abi.arg1();
    let is_executable = abi.arg2() != 0;
    let addr_ptr = abi.arg3();

    if length == 0 {
        abi.set_return(errno::EINVAL);
        return SyscallStatus::Complete;
    }

    let num_bytes = page_align_up(length as u64) as usize;
    let perms = if is_executable { PagePerms::RWX } else { PagePerms::RW };

    match abi.process_mut().allocate(num_bytes, perms) {
        Err(_) => {
            abi.set_return(errno::ENOMEM);
        }
        Ok(addr32) => {
            abi.set_return(0);
            if addr_ptr != 0 && !abi.process().try_write_u32(addr_ptr, addr32) {
                let _ = abi.process_mut().deallocate(addr32, num_bytes);
                abi.set_return(errno::EFAULT);
            }
        }
    }
    SyscallStatus::Complete
}

fn deallocate(abi: &mut SyscallAbi) -> SyscallStatus {
    let addr = abi.arg1();
    let length = abi.arg2();
    let aligned_length = page_align_up(length as u64) as u32;

    if aligned_length == 0 {
        abi.set_return(errno::EINVAL);
    } else if addr % 4096 != 0 {
        abi.set_return(errno::EINVAL);
    } else if addr >= TASK_SIZE {
        abi.set_return(errno::EINVAL);
    } else if length > TASK_SIZE - addr {
        abi.set_return(errno::EINVAL);
    } else if !(addr + length <= MAGIC_PAGE_BEGIN || addr >= MAGIC_PAGE_END) {
        abi.set_return(errno::EINVAL);
    } else {
        let _ = abi.process_mut().deallocate(addr, aligned_length as usize);
        abi.set_return(0);
    }
    SyscallStatus::Complete
}

/// Writes zero bytes rather than drawing from an OS entropy source, so a
/// recorded run replays identically. Matches the original's `DoRandom`,
/// which unconditionally writes zero.
fn random(abi: &mut SyscallAbi) -> SyscallStatus {
    let buf = abi.arg1();
    let count = abi.arg2();
    let rnd_bytes_addr = abi.arg3();

    if count > i32::MAX as u32 {
        abi.set_return(errno::EINVAL);
        return SyscallStatus::Complete;
    }

    if count > 0 {
        let zeros = vec![0u8; count as usize];
        if buf == 0 || !abi.process().try_write_bytes(buf, &zeros) {
            abi.set_return(errno::EFAULT);
            return SyscallStatus::Complete;
        }
    }

    abi.set_return(0);
    if rnd_bytes_addr != 0 && !abi.process().try_write_u32(rnd_bytes_addr, count) {
        abi.set_return(errno::EFAULT);
    }
    SyscallStatus::Complete
}

#[cfg(test)]
mod tests {
    use super::*;
    use grr_process::Process;

    fn process_with_buffer() -> (Process, u32) {
        let mut process = Process::new(1).unwrap();
        let addr = process.allocate(4096, PagePerms::RW).unwrap();
        process.try_lazy_map(addr);
        (process, addr)
    }

    #[test]
    fn terminate_sets_done_status() {
        let (mut process, _) = process_with_buffer();
        process.hot.eax = 1;
        let mut files = FileTable::new();
        let mut input = InputTape::new(vec![]);
        let status = dispatch(&mut process, &mut files, &mut input, std::io::sink());
        assert_eq!(status, SyscallStatus::Terminated);
        assert_eq!(process.status, ProcessStatus::Done);
    }

    #[test]
    fn receive_past_end_of_tape_returns_zero_not_fault() {
        let (mut process, buf) = process_with_buffer();
        process.hot.eax = 3; // receive
        process.hot.ebx = 0; // stdin
        process.hot.ecx = buf;
        process.hot.edx = 10;
        process.hot.esi = 0;
        let mut files = FileTable::new();
        let mut input = InputTape::new(vec![]);
        let status = dispatch(&mut process, &mut files, &mut input, std::io::sink());
        assert_eq!(status, SyscallStatus::Complete);
        assert_eq!(process.hot.eax, 0);
    }

    #[test]
    fn allocate_zero_length_is_einval() {
        let (mut process, _) = process_with_buffer();
        process.hot.eax = 5; // allocate
        process.hot.ebx = 0;
        let mut files = FileTable::new();
        let mut input = InputTape::new(vec![]);
        dispatch(&mut process, &mut files, &mut input, std::io::sink());
        assert_eq!(process.hot.eax, errno::EINVAL);
    }
}
