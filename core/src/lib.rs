//! Shared data model: guest address types, the code-cache index key/value
//! records, the host ABI register table, and page/process constants.
//!
//! Every other crate in this workspace depends on `grr-core`; it carries no
//! behavior of its own, only the types and constants that define how the
//! pieces agree with each other.

pub mod abi;
pub mod constants;
pub mod coverage;
pub mod error;
pub mod index;
pub mod page;
pub mod process_offsets;

pub use abi::AbiReg;
pub use coverage::CountedPathEntry;
pub use error::{Error, Result};
pub use index::{CacheKey, CacheValue};
pub use page::{PagePerms, PageRange, PageState};

/// A 32-bit address inside the guest's address space.
pub type Addr32 = u32;

/// A 64-bit host address, typically `guest_base + Addr32`.
pub type Addr64 = u64;

/// Offset of a translated block within the code cache arena.
pub type CacheOffset = u32;
