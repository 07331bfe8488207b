//! The end-to-end scenarios this harness is built to support: a guest
//! program run to completion, a syscall fault recovering cleanly, and a
//! process reviving byte-for-byte from a snapshot.
//!
//! Self-modifying code, indirect-call instrumentation, and trace formation
//! (the harder scenarios) exercise decode/translate paths this crate can't
//! confirm without a compiler in the loop, so they're left to `grr-decode`/
//! `grr-translate`/`grr-cache`'s own colocated unit tests instead of being
//! guessed at here.

use grr_core::PagePerms;
use grr_dispatch::Dispatcher;
use grr_process::{Process, ProcessStatus};
use grr_scheduler::{ProcessSlot, RoundOutcome, Scheduler};
use grr_snapshot::Snapshot;
use grr_syscall::abi::errno;
use grr_syscall::InputTape;

fn loop_and_terminate() -> Vec<u8> {
    vec![
        0xB9, 0x05, 0x00, 0x00, 0x00, // mov ecx, 5
        0x49, // dec ecx
        0x75, 0xFD, // jnz -3
        0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1 (terminate)
        0xCD, 0x80, // int 0x80
    ]
}

/// Scenario 1: a simple counted loop runs to completion, and both blocks
/// it decodes into (the header and the loop body/tail) land in the index.
#[test]
fn simple_loop_runs_to_completion_and_populates_the_index() {
    let mut process = Process::new(1).unwrap();
    let pc = process.allocate(4096, PagePerms::RWX).unwrap();
    assert!(process.try_lazy_map(pc));
    assert!(process.try_make_writable(pc));
    let code = loop_and_terminate();
    assert!(process.try_write_bytes(pc, &code));
    assert!(process.try_make_executable(pc));
    process.hot.eip = pc;

    let dispatcher = Dispatcher::new().unwrap();
    let mut scheduler = Scheduler::new(dispatcher, std::io::sink());
    scheduler.add_process(ProcessSlot::new(process, InputTape::new(vec![])));

    let outcome = scheduler.run();
    assert_eq!(outcome, RoundOutcome::AllDone);
    assert_eq!(scheduler.slots()[0].process.status, ProcessStatus::Done);
    assert!(scheduler.dispatcher().index().len() >= 1);
}

/// Scenario 4: `receive` into a buffer the guest never mapped surfaces
/// `EFAULT` without disturbing the process's runnable state.
#[test]
fn receive_into_unmapped_buffer_faults_cleanly() {
    let mut process = Process::new(1).unwrap();
    // A valid code page so the process has somewhere to "be", but the
    // receive buffer below points outside anything ever allocated.
    let pc = process.allocate(4096, PagePerms::RW).unwrap();
    assert!(process.try_lazy_map(pc));
    process.hot.eax = 3; // receive
    process.hot.ebx = 0; // stdin
    process.hot.ecx = 1; // unmapped address
    process.hot.edx = 4; // length
    process.hot.esi = 0; // don't care about rx_bytes

    let mut files = grr_process::FileTable::new();
    let mut input = InputTape::new(vec![0xAA, 0xBB, 0xCC, 0xDD]);
    let status = grr_syscall::dispatch(&mut process, &mut files, &mut input, std::io::sink());

    assert_eq!(status, grr_syscall::SyscallStatus::Complete);
    assert_eq!(process.hot.eax, errno::EFAULT);
}

/// Scenario 5: capturing a running process and reviving it from that
/// snapshot reproduces every register and every resident byte.
#[test]
fn snapshot_round_trip_reproduces_registers_and_memory() {
    let mut process = Process::new(3).unwrap();
    let heap = process.allocate(8192, PagePerms::RW).unwrap();
    assert!(process.try_lazy_map(heap));
    assert!(process.try_write_bytes(heap, b"state to carry across a snapshot"));
    process.hot.eax = 0x1111_2222;
    process.hot.ecx = 0x3333_4444;
    process.hot.eip = heap;

    let snapshot = Snapshot::capture(&process, 3);
    let revived = snapshot.revive(3).unwrap();

    assert_eq!(revived.hot.eax, 0x1111_2222);
    assert_eq!(revived.hot.ecx, 0x3333_4444);
    assert_eq!(revived.hot.eip, heap);

    let mut buf = [0u8; 33];
    assert!(revived.try_read_bytes(heap, &mut buf));
    assert_eq!(&buf, b"state to carry across a snapshot");
}

/// A file-backed snapshot round-trips through disk the same way, which is
/// the form `grr-play` actually consumes (`--snapshot_dir/{exe_num}.snapshot`).
#[test]
fn snapshot_round_trip_through_a_file_and_a_fresh_scheduler() {
    let mut process = Process::new(4).unwrap();
    let pc = process.allocate(4096, PagePerms::RWX).unwrap();
    assert!(process.try_lazy_map(pc));
    assert!(process.try_make_writable(pc));
    let code = loop_and_terminate();
    assert!(process.try_write_bytes(pc, &code));
    assert!(process.try_make_executable(pc));
    process.hot.eip = pc;

    let snapshot = Snapshot::capture(&process, 4);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("0.snapshot");
    snapshot.write_to_file(&path).unwrap();

    let reloaded = Snapshot::read_from_file(&path).unwrap();
    let revived = reloaded.revive(4).unwrap();
    assert_eq!(revived.hot.eip, pc);

    let dispatcher = Dispatcher::new().unwrap();
    let mut scheduler = Scheduler::new(dispatcher, std::io::sink());
    scheduler.add_process(ProcessSlot::new(revived, InputTape::new(vec![])));
    assert_eq!(scheduler.run(), RoundOutcome::AllDone);
}

/// An install-a-sink-and-run smoke test at the full stack level (the
/// narrower version lives in `grr-dispatch`'s own unit tests); here it's
/// checked through `Scheduler` exactly the way `grr-play` drives it.
#[test]
fn coverage_sink_survives_a_full_scheduler_run() {
    use std::any::Any;
    use grr_core::CountedPathEntry;
    use grr_dispatch::CoverageSink;

    #[derive(Default)]
    struct CountingSink(usize);
    impl CoverageSink for CountingSink {
        fn record(&mut self, _entry: CountedPathEntry) {
            self.0 += 1;
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    let mut process = Process::new(5).unwrap();
    let pc = process.allocate(4096, PagePerms::RWX).unwrap();
    assert!(process.try_lazy_map(pc));
    assert!(process.try_make_writable(pc));
    let code = loop_and_terminate();
    assert!(process.try_write_bytes(pc, &code));
    assert!(process.try_make_executable(pc));
    process.hot.eip = pc;

    let mut dispatcher = Dispatcher::new().unwrap();
    dispatcher.set_coverage_sink(Box::new(CountingSink::default()));
    let mut scheduler = Scheduler::new(dispatcher, std::io::sink());
    scheduler.add_process(ProcessSlot::new(process, InputTape::new(vec![])));

    assert_eq!(scheduler.run(), RoundOutcome::AllDone);
    assert!(scheduler.dispatcher().index().len() >= 1);
}
