//! Per-guest-process state: registers, memory, and fault bookkeeping, plus
//! the file table a process's open descriptors live in. Grouped the way
//! `granary/os/process.h` groups them; `FileTable` stays a sibling of
//! `Process` rather than a field of it (see `process::Process`'s doc
//! comment) since file I/O needs a whole `&Process` for guest-memory
//! access while being reached through its own mutable borrow.

pub mod file;
pub mod process;

pub use file::{File, FileIoStatus, FileTable};
pub use process::{ExecStatus, Process, ProcessHot, ProcessStatus};
