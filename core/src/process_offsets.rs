//! Byte offsets within `grr_process::Process` that translated code bakes in
//! at compile time (the `PROCESS64` ABI register points at a `Process`, and
//! the translator writes directly to these offsets rather than going
//! through Rust field access).
//!
//! These mirror the original's `Process32` layout exactly, since nothing
//! other than this table needs to agree with the translator about it.

pub const BASE: usize = 0;
pub const GPR_EDI: usize = 8;
pub const GPR_ESI: usize = 12;
pub const GPR_EBP: usize = 16;
pub const GPR_EBX: usize = 20;
pub const GPR_EDX: usize = 24;
pub const GPR_ECX: usize = 28;
pub const GPR_EAX: usize = 32;
pub const GPR_ESP: usize = 36;
pub const GPR_EIP: usize = 40;
pub const GPR_EFLAGS: usize = 44;
pub const PID: usize = 48;
pub const LAST_BRANCH_PC: usize = 52;
pub const TEXT_BASE: usize = 56;
