//! The DECREE syscall ABI: selector decode, per-call handlers, and the
//! input tape `receive` draws from.

pub mod abi;
pub mod handlers;
pub mod input;

pub use abi::{Selector, SyscallAbi};
pub use handlers::{dispatch, SyscallStatus};
pub use input::InputTape;
