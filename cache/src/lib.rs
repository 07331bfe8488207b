//! Code cache, index, patcher, and trace recorder.
//!
//! Grouped in one crate because the patcher and trace recorder both reach
//! into the arena and the index atomically as part of one operation, the
//! same way the original keeps `code/{cache,index,trace}.cc` in one
//! translation unit.

pub mod code_cache;
pub mod index;
pub mod patcher;
pub mod trace;

pub use code_cache::CodeCache;
pub use index::Index;
pub use patcher::Patcher;
pub use trace::TraceRecorder;
