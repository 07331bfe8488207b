//! Per-instruction decode and basic-block assembly.
//!
//! Wraps `iced-x86`'s decoder with the metadata the translator needs
//! (which GPRs an instruction reads/writes, whether it touches memory or
//! the flags register, whether any operand is PC-relative) and assembles
//! runs of decoded instructions into basic blocks.

pub mod block;
pub mod decoder;

pub use block::{Block, BlockBuilder};
pub use decoder::{DecodedInstruction, Decoder};
