//! PUSH/POP family expansion: guest stack instructions become explicit
//! store/bump or bump/load sequences through `[MEM64 + SP64]`, so `SP32`
//! stays the sole authoritative stack pointer rather than trusting the
//! host's `RSP`.

use iced_x86::{Code, Instruction, Register};

use grr_core::abi::AbiReg;

use crate::abi_emit::{bump_sp, load_through_sp, store_through_sp};

const ID_FLAG_MASK: u32 = !0x0020_0000;
/// `POPFD` additionally clears bit 21 (`ID`) so CPUID-capability probing
/// through a pushed-and-popped flags image doesn't work.
const POPF_MASK: u32 = !0x0020_0000;

pub fn push_reg(reg: Register) -> Vec<Instruction> {
    vec![store_through_sp(reg), bump_sp(-4)]
}

pub fn pop_reg(reg: Register) -> Vec<Instruction> {
    vec![load_through_sp(reg), bump_sp(4)]
}

const GPR_PUSH_ORDER: [Register; 8] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP, // pushed as the pre-PUSHA value; substituted to SP32 by virtualize
    Register::EBP,
    Register::ESI,
    Register::EDI,
];

pub fn pusha() -> Vec<Instruction> {
    let mut ops = Vec::new();
    for (i, reg) in GPR_PUSH_ORDER.iter().enumerate() {
        let src = if *reg == Register::ESP {
            AbiReg::Sp.reg32()
        } else {
            *reg
        };
        ops.push(store_through_sp(src));
        if i + 1 < GPR_PUSH_ORDER.len() {
            ops.push(bump_sp(-4));
        }
    }
    ops.push(bump_sp(-4));
    ops
}

pub fn popa() -> Vec<Instruction> {
    let mut ops = Vec::new();
    for reg in GPR_PUSH_ORDER.iter().rev() {
        if *reg == Register::ESP {
            // POPA discards the popped ESP value rather than restoring it.
            ops.push(bump_sp(4));
            continue;
        }
        ops.push(load_through_sp(*reg));
        ops.push(bump_sp(4));
    }
    ops
}

pub fn pushf() -> Vec<Instruction> {
    vec![
        Instruction::with_reg(Code::Pushfq, Register::None),
        Instruction::with_reg_mem(Code::Mov_r32_rm32, AbiReg::Val.reg32(), iced_x86::MemoryOperand::new(Register::RSP, Register::None, 1, 0, 4, false, Register::None)),
        Instruction::with_reg_u32(Code::Add_rm64_imm8, Register::RSP, 8),
        store_through_sp(AbiReg::Val.reg32()),
        bump_sp(-4),
    ]
}

pub fn popf() -> Vec<Instruction> {
    vec![
        load_through_sp(AbiReg::Val.reg32()),
        bump_sp(4),
        Instruction::with_reg_u32(Code::And_rm32_imm32, AbiReg::Val.reg32(), POPF_MASK),
    ]
}

/// `ENTER imm16, 0`: push `EBP`, `EBP <- SP32`, `SP32 -= imm16`. (Nested
/// `ENTER` with a non-zero level is not emitted by compilers targeting this
/// guest and is treated as `UD2` by the caller.)
pub fn enter(frame_size: u32) -> Vec<Instruction> {
    let mut ops = push_reg(AbiReg::Sp.reg32());
    ops.push(Instruction::with_reg_reg(Code::Mov_r32_rm32, Register::EBP, AbiReg::Sp.reg32()));
    if frame_size != 0 {
        ops.push(bump_sp(-(frame_size as i32)));
    }
    ops
}

/// `LEAVE`: `SP32 <- EBP`, pop `EBP`.
pub fn leave() -> Vec<Instruction> {
    let mut ops = vec![Instruction::with_reg_reg(Code::Mov_r32_rm32, AbiReg::Sp.reg32(), Register::EBP)];
    ops.extend(pop_reg(Register::EBP));
    ops
}
