//! Small helpers for emitting host instructions against the virtual ABI
//! registers, so the rest of the translator reads in terms of "write PC",
//! "load through MEM64", etc. rather than raw register numbers.

use iced_x86::{Code, Instruction, MemoryOperand, Register};

use grr_core::abi::AbiReg;
use grr_core::Addr32;

/// `PC32 <- imm`, emitted before every translated guest instruction so a
/// fault always reports a precise guest PC.
pub fn write_pc_imm(pc: Addr32) -> Instruction {
    Instruction::with_reg_u32(Code::Mov_r32_imm32, AbiReg::Pc.reg32(), pc)
}

/// `PC32 <- reg`, used when the next PC is computed rather than constant
/// (indirect jumps/calls, returns).
pub fn write_pc_reg(src: Register) -> Instruction {
    Instruction::with_reg_reg(Code::Mov_r32_rm32, AbiReg::Pc.reg32(), src)
}

/// A host memory operand addressing `[MEM64 + base*1 + disp]`, the rebased
/// form every guest memory access is translated into.
pub fn rebase(base: Register, disp: i64) -> MemoryOperand {
    MemoryOperand::new(AbiReg::Mem64.reg64(), base, 1, disp, 8, false, Register::None)
}

/// `ADDR64 <- lea [computed guest address]`, emitted ahead of a rebased
/// memory access so the real instruction can use `[MEM64 + ADDR64]`.
pub fn lea_addr(effective: MemoryOperand) -> Instruction {
    Instruction::with_reg_mem(Code::Lea_r64_m, AbiReg::Addr.reg64(), effective)
}

/// Bumps `SP32` by a signed delta (`4` for a pop, `-4` for a push).
pub fn bump_sp(delta: i32) -> Instruction {
    if delta >= 0 {
        Instruction::with_reg_u32(Code::Add_rm32_imm32, AbiReg::Sp.reg32(), delta as u32)
    } else {
        Instruction::with_reg_u32(Code::Sub_rm32_imm32, AbiReg::Sp.reg32(), (-delta) as u32)
    }
}

/// `[MEM64 + SP64] <- reg`, a 32-bit store through the virtual stack
/// pointer widened to 64 bits for addressing purposes.
pub fn store_through_sp(reg: Register) -> Instruction {
    let mem = rebase(AbiReg::Sp.reg64(), 0);
    Instruction::with_mem_reg(Code::Mov_rm32_r32, mem, reg)
}

/// `reg <- [MEM64 + SP64]`.
pub fn load_through_sp(reg: Register) -> Instruction {
    let mem = rebase(AbiReg::Sp.reg64(), 0);
    Instruction::with_reg_mem(Code::Mov_r32_rm32, reg, mem)
}

/// A `RET` ending a translated block, returning control to the dispatcher.
pub fn dispatcher_return() -> Instruction {
    Instruction::with(Code::Retnq)
}

/// `CALL rel32` to a trampoline in the instrumentation page.
pub fn call_trampoline(target: u64) -> Instruction {
    Instruction::with_branch(Code::Call_rel32_64, target)
}
