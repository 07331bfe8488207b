//! End-to-end scenario tests driving the full stack (`grr-process` through
//! `grr-scheduler`/`grr-snapshot`) the way a fuzzing harness actually would,
//! rather than any single crate's unit tests in isolation.

mod scenarios;
