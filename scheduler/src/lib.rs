//! Cooperative round-robin scheduler: the single host thread that drives a
//! fixed group of guest [`Process`](grr_process::Process)es through
//! [`grr_dispatch::Dispatcher`], handing each syscall trap to
//! [`grr_syscall::dispatch`] and routing signals through `grr_fault`.
//!
//! Grounded on the teacher's `linux-user/src/main.rs` run loop (`loop {
//! cpu_exec_loop(...); match reason { ECALL => handle_syscall(...), ... } }`),
//! generalized from one RISC-V guest under a single exit-reason match to a
//! fixed group of x86-32 guests taking turns, each yielding on syscall,
//! fault, or sleep instead of a single linear syscall trap.

pub mod slot;

mod scheduler;

pub use scheduler::{RoundOutcome, Scheduler};
pub use slot::ProcessSlot;
