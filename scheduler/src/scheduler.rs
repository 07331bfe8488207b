//! The round-robin loop itself.

use std::io::Write;

use grr_dispatch::{Dispatcher, ExecOutcome};
use grr_fault::UninterruptibleRegion;
use grr_process::ProcessStatus;
use grr_syscall::SyscallStatus;

use crate::slot::ProcessSlot;

/// Why [`Scheduler::run`] returned control to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Every process reached `done`, `error`, or `ignorable_error`.
    AllDone,
    /// A caught signal ended the run; the value is the raw signal number.
    Interrupted(i32),
    /// A full pass produced no observable change in any process — every
    /// runnable process is blocked on I/O with no timeout to count down.
    /// Mirrors the original's own deadlock backstop.
    NoProgress,
}

/// Drives a fixed group of processes, one round-robin pass at a time,
/// against a single shared [`Dispatcher`] (and therefore a single shared
/// code cache, index, inline cache, and trace recorder — matching the
/// "shared process-wide, mutated only from the single scheduler thread"
/// resource model).
pub struct Scheduler<W: Write> {
    dispatcher: Dispatcher,
    slots: Vec<ProcessSlot>,
    stdout: W,
}

impl<W: Write> Scheduler<W> {
    pub fn new(dispatcher: Dispatcher, stdout: W) -> Self {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        grr_fault::install_handlers();

        Scheduler {
            dispatcher,
            slots: Vec::new(),
            stdout,
        }
    }

    pub fn add_process(&mut self, slot: ProcessSlot) {
        self.slots.push(slot);
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    pub fn slots(&self) -> &[ProcessSlot] {
        &self.slots
    }

    /// Runs rounds until every process is terminal, a signal interrupts the
    /// run, or a round makes no progress at all.
    pub fn run(&mut self) -> RoundOutcome {
        loop {
            if let Some(sig) = grr_fault::take_pending_signal() {
                return RoundOutcome::Interrupted(sig);
            }

            let mut any_runnable = false;
            let mut progressed = false;

            for slot in &mut self.slots {
                if matches!(
                    slot.process.status,
                    ProcessStatus::Error | ProcessStatus::IgnorableError | ProcessStatus::Done
                ) {
                    continue;
                }
                any_runnable = true;

                unsafe { grr_fault::bind(&mut slot.process as *mut _, self.dispatcher.cache_mut() as *mut _) };

                if slot.process.status == ProcessStatus::Ready {
                    self.dispatcher.execute(&mut slot.process);
                    progressed = true;
                }

                if slot.process.status == ProcessStatus::SystemCall {
                    let region = UninterruptibleRegion::enter();
                    let status = grr_syscall::dispatch(&mut slot.process, &mut slot.files, &mut slot.input, &mut self.stdout);
                    drop(region);

                    match status {
                        SyscallStatus::Complete => {
                            slot.process.status = ProcessStatus::Ready;
                            progressed = true;
                        }
                        SyscallStatus::Terminated => progressed = true,
                        SyscallStatus::Sleeping => progressed = true,
                        SyscallStatus::InProgress => {}
                    }
                }

                grr_fault::unbind();
            }

            if !any_runnable {
                return RoundOutcome::AllDone;
            }
            if !progressed {
                return RoundOutcome::NoProgress;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grr_core::PagePerms;
    use grr_process::Process;
    use grr_syscall::InputTape;

    fn loop_and_terminate_program() -> Vec<u8> {
        vec![
            0xB9, 0x03, 0x00, 0x00, 0x00, // mov ecx, 3
            0x49, // dec ecx
            0x75, 0xFD, // jnz -3
            0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1 (terminate)
            0xCD, 0x80, // int 0x80
        ]
    }

    #[test]
    fn single_process_runs_to_completion() {
        let mut process = Process::new(1).unwrap();
        let pc = process.allocate(4096, PagePerms::RWX).unwrap();
        assert!(process.try_lazy_map(pc));
        assert!(process.try_make_writable(pc));
        let code = loop_and_terminate_program();
        assert!(process.try_write_bytes(pc, &code));
        assert!(process.try_make_executable(pc));
        process.hot.eip = pc;

        let dispatcher = Dispatcher::new().unwrap();
        let mut scheduler = Scheduler::new(dispatcher, std::io::sink());
        scheduler.add_process(ProcessSlot::new(process, InputTape::new(vec![])));

        let outcome = scheduler.run();
        assert_eq!(outcome, RoundOutcome::AllDone);
        assert_eq!(scheduler.slots()[0].process.status, ProcessStatus::Done);
    }

    #[test]
    fn fdwait_on_nothing_with_no_timeout_deadlocks_as_no_progress() {
        let mut process = Process::new(1).unwrap();
        let pc = process.allocate(4096, PagePerms::RWX).unwrap();
        assert!(process.try_lazy_map(pc));
        assert!(process.try_make_writable(pc));
        // xor ebx,ebx; xor ecx,ecx; xor edx,edx; xor esi,esi; xor edi,edi
        // mov eax, 4 (fdwait: nfds=0, no fd sets, no timeout) ; int 0x80
        let code = [0x31, 0xDB, 0x31, 0xC9, 0x31, 0xD2, 0x31, 0xF6, 0x31, 0xFF, 0xB8, 0x04, 0x00, 0x00, 0x00, 0xCD, 0x80];
        assert!(process.try_write_bytes(pc, &code));
        assert!(process.try_make_executable(pc));
        process.hot.eip = pc;

        let dispatcher = Dispatcher::new().unwrap();
        let mut scheduler = Scheduler::new(dispatcher, std::io::sink());
        scheduler.add_process(ProcessSlot::new(process, InputTape::new(vec![])));

        // Waiting on an empty fd set with no timeout never resolves; the
        // scheduler's own deadlock backstop is what ends the run.
        let outcome = scheduler.run();
        assert_eq!(outcome, RoundOutcome::NoProgress);
    }
}
