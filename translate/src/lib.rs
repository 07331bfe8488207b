//! The block translator: rewrites a decoded guest basic block into host
//! machine code that runs against the virtual ABI registers.
//!
//! The translator walks a block's instructions from last to first, building
//! up a list of host instructions that is then reversed and encoded
//! front-to-back — prepending to a stack is cheap, appending to a `Vec` you
//! later reverse is cheaper still and has the same effect.

pub mod abi_emit;
pub mod control_flow;
pub mod instrument;
pub mod stack;
pub mod stringops;
pub mod translator;
pub mod virtualize;

pub use instrument::{InstrumentationCallbacks, InstrumentationPoint};
pub use translator::{TranslatedBlock, Translator};
