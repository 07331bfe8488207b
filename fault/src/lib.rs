//! Fault classification and signal-handler glue for a bound guest process.
//!
//! Split the way `granary/arch/x86/fault.cc` and `granary/os/schedule.cc`
//! are split in the original: [`decompose`] re-derives a faulting
//! instruction's effective address from its own bytes, [`classify`] runs
//! the pure decision tree a captured fault goes through, and [`handler`]
//! wires that decision tree up to real `sigaction` handlers.

pub mod classify;
pub mod decompose;
pub mod handler;

pub use classify::{classify_fault, FaultOutcome, FaultSignal};
pub use decompose::{decompose_fault_addr, DecomposedFault};
pub use handler::{
    bind, is_interruptible, is_running, set_bad_block_addr, take_pending_signal, unbind,
    UninterruptibleRegion,
};

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use handler::install_handlers;
