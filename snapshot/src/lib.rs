//! Persistence the fuzzing harness needs beyond the code cache itself:
//! the `GRRS` process-snapshot format (register + memory state a run
//! starts from) and the path-coverage file `grr-dispatch`'s multi-way
//! branch edges accumulate into.
//!
//! The code-cache index and JIT patch points already persist themselves
//! (`grr_cache::Index::load`/`save`, `grr_cache::Patcher::load_persistent`/
//! `shutdown`); this crate covers exactly the two things those don't.

pub mod coverage_file;
pub mod error;
pub mod gregs;
pub mod process_snapshot;

pub use coverage_file::FileCoverageSink;
pub use error::{Error, Result};
pub use process_snapshot::{MappedRange, Snapshot};
