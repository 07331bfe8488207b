//! The four instrumentation points a translated block can call into.
//!
//! Each point is reached through an 8-byte trampoline slot in the code
//! cache's instrumentation page (`grr_cache`); the translator only needs to
//! know the trampoline's address and whether that point is enabled for the
//! current guest PC.

use iced_x86::{Code, Instruction};

/// Matches `granary::code::instrument::InstrumentationPoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentationPoint {
    MultiWayBranch = 0,
    BlockEntry = 1,
    PerPC = 2,
    MemoryAddress = 3,
}

impl InstrumentationPoint {
    pub const ALL: [InstrumentationPoint; 4] = [
        InstrumentationPoint::MultiWayBranch,
        InstrumentationPoint::BlockEntry,
        InstrumentationPoint::PerPC,
        InstrumentationPoint::MemoryAddress,
    ];

    pub fn slot_index(self) -> usize {
        self as usize
    }
}

/// The trampoline addresses a translation run is being compiled against.
/// When a point isn't enabled, its trampoline is a plain `RET`, so calling
/// it unconditionally is always correct and the translator never needs to
/// special-case "disabled".
#[derive(Debug, Clone, Copy)]
pub struct InstrumentationCallbacks {
    pub trampoline_page_base: u64,
}

impl InstrumentationCallbacks {
    pub fn new(trampoline_page_base: u64) -> Self {
        InstrumentationCallbacks {
            trampoline_page_base,
        }
    }

    fn trampoline_addr(&self, point: InstrumentationPoint) -> u64 {
        self.trampoline_page_base + (point.slot_index() as u64) * 8
    }

    /// A `CALL rel32` to the given instrumentation point's trampoline.
    pub fn emit_call(&self, point: InstrumentationPoint) -> Vec<Instruction> {
        vec![Instruction::with_branch(
            Code::Call_rel32_64,
            self.trampoline_addr(point),
        )]
    }

    /// `PerPC` additionally loads the dense instrumentation ID into `VAL32`
    /// ahead of the call so the callee can correlate the event.
    pub fn emit_per_pc_call(&self, id: u32) -> Vec<Instruction> {
        vec![
            Instruction::with_reg_u32(Code::Mov_r32_imm32, grr_core::abi::AbiReg::Val.reg32(), id),
            Instruction::with_branch(Code::Call_rel32_64, self.trampoline_addr(InstrumentationPoint::PerPC)),
        ]
    }
}
