//! The translate/cache/run engine: looks a block up (by inline cache,
//! then by index), translates and commits it on a miss, and drives a
//! bound process's guest code through the host ABI until it needs the
//! scheduler's attention.
//!
//! Split the way the teacher's `exec_loop.rs`/`tb_store.rs` split lookup
//! from execution, generalized from a TCG translation block cache to the
//! `PROCESS64`-addressed code cache `grr_cache` builds.

pub mod coverage;
pub mod executor;
pub mod inline_cache;
pub mod prologue;

pub use coverage::CoverageSink;
pub use executor::{Dispatcher, ExecOutcome};
pub use inline_cache::InlineCache;
