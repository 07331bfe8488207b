use grr_process::{FileTable, Process};
use grr_syscall::InputTape;

/// One guest process's complete turn-taking state: its registers/memory,
/// its open files, and the input tape its `receive` syscalls draw from.
///
/// A sibling grouping to `Process`/`FileTable` themselves (see
/// `grr_process::process::Process`'s doc comment on why files live outside
/// the process struct) — the scheduler is what actually needs all three
/// together for a single process's turn.
pub struct ProcessSlot {
    pub process: Process,
    pub files: FileTable,
    pub input: InputTape,
}

impl ProcessSlot {
    pub fn new(process: Process, input: InputTape) -> Self {
        ProcessSlot {
            process,
            files: FileTable::new(),
            input,
        }
    }
}
