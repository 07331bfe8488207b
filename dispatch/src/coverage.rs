//! The host-side hook a [`Dispatcher`](crate::Dispatcher) calls into on
//! every multi-way branch, instead of the JIT'd `MultiWayBranch`
//! trampoline reaching back into Rust itself.
//!
//! A multi-way (indirect) branch block always has `has_one_successor:
//! false` and so never gets a chain-patch target (see `grr-cache`'s
//! `Patcher`, wired into `Dispatcher::translate_and_insert` for
//! single-successor blocks) — it always returns to
//! [`Dispatcher::execute`](crate::Dispatcher::execute), so the host loop
//! can derive a `CountedPathEntry` itself on every such block's
//! completion instead of requiring `control_flow.rs`'s `MultiWayBranch`
//! call site to reach a real Rust callback.

use std::any::Any;

use grr_core::CountedPathEntry;

/// Receives one coverage edge per multi-way branch a dispatched block
/// takes. `grr-snapshot` provides the concrete file-backed implementation;
/// this trait is the seam so `grr-dispatch` doesn't need to know about
/// file formats or hashing.
///
/// `as_any_mut` lets a caller that installed a concrete sink (`grr-play`,
/// installing a `grr_snapshot::FileCoverageSink`) get it back via
/// [`Dispatcher::coverage_sink_mut`](crate::Dispatcher::coverage_sink_mut)
/// and `downcast_mut` once a run finishes, to save it or read its
/// new-path count — `Dispatcher` itself has no reason to know the
/// concrete type.
pub trait CoverageSink: Any {
    fn record(&mut self, entry: CountedPathEntry);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
