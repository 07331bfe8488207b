//! Operand virtualization: rewriting a guest instruction's registers and
//! memory operands so it runs correctly against the host ABI, without
//! changing its architectural effect.

use iced_x86::{Instruction, MemoryOperand, OpKind, Register};

use grr_core::abi::AbiReg;
use grr_decode::DecodedInstruction;

use crate::abi_emit::{lea_addr, rebase};

/// Registers the translator is allowed to borrow as scratch when an
/// instruction needs a stolen register (legacy 8-bit high-byte operands).
/// Never one of the pinned ABI registers.
const STEAL_CANDIDATES: [Register; 3] = [Register::RAX, Register::RBX, Register::RDX];

fn pick_steal_register(avoid: &[Register]) -> Register {
    STEAL_CANDIDATES
        .into_iter()
        .find(|r| !avoid.iter().any(|a| a.full_register() == *r))
        .unwrap_or(Register::RAX)
}

/// If `reg` is the guest's ESP/SP, the ABI's virtual stack pointer register
/// stands in for it; every other register is used unchanged (host and
/// guest general registers share the same names/encodings below 32 bits).
fn substitute_register(reg: Register) -> Register {
    match reg {
        Register::ESP => AbiReg::Sp.reg32(),
        Register::SP => AbiReg::Sp.reg16().unwrap_or(AbiReg::Sp.reg32()),
        Register::AH | Register::CH | Register::DH | Register::BH => reg,
        _ => reg,
    }
}

/// Virtualizes one guest instruction into zero or more host instructions.
/// Pure copies (no memory operand, no ESP, no legacy high byte) pass
/// through unchanged save for register substitution.
pub fn virtualize(di: &DecodedInstruction) -> Vec<Instruction> {
    let instr = &di.inner;
    let mut out = Vec::new();

    if di.uses_legacy_registers && has_memory_operand(instr) {
        return virtualize_with_stolen_register(di);
    }

    let mut copy = *instr;
    for i in 0..copy.op_count() {
        if copy.op_kind(i) == OpKind::Register {
            let reg = substitute_register(copy.op_register(i));
            copy.set_op_register(i, reg);
        }
    }

    if has_memory_operand(instr) && !is_pure_effective_address(instr) {
        let disp = instr.memory_displacement64() as i64;
        let base = substitute_register(instr.memory_base());
        let index = instr.memory_index();

        if instr.is_ip_rel_memory_operand() {
            // PC-relative: fold the end-of-instruction PC into an absolute
            // guest address, then rebase through MEM64 below.
            let folded = instr.next_ip() as i64 + disp;
            out.push(lea_addr(MemoryOperand::new(
                Register::None,
                Register::None,
                1,
                folded,
                8,
                false,
                Register::None,
            )));
        } else {
            out.push(lea_addr(MemoryOperand::new(
                base,
                index,
                instr.memory_index_scale() as u32,
                disp,
                8,
                false,
                Register::None,
            )));
        }

        let rebased = rebase(AbiReg::Addr.reg64(), 0);
        copy.set_memory_base(rebased.base);
        copy.set_memory_index(rebased.index);
        copy.set_memory_index_scale(rebased.scale);
        copy.set_memory_displacement64(rebased.displacement as u64);
        copy.set_segment_prefix(Register::None);
    }

    out.push(copy);
    out
}

fn has_memory_operand(instr: &Instruction) -> bool {
    (0..instr.op_count()).any(|i| instr.op_kind(i) == OpKind::Memory)
}

/// LEA and the MPX `BND*` family address-compute but never touch memory:
/// their operand is relativized (PC-relative folded to absolute) but never
/// rebased through `MEM64`.
fn is_pure_effective_address(instr: &Instruction) -> bool {
    matches!(
        instr.code(),
        iced_x86::Code::Lea_r16_m
            | iced_x86::Code::Lea_r32_m
            | iced_x86::Code::Lea_r64_m
            | iced_x86::Code::Bndmov_bnd_bndm64
            | iced_x86::Code::Bndmov_bndm64_bnd
    )
}

/// `AH`/`CH`/`DH`/`BH` can't be combined with an R8-R15 base in one
/// encoding, so the effective address is computed into a stolen
/// non-legacy GPR, saved/restored around the access, and used as the sole
/// memory operand instead of the `[MEM64 + ADDR64]` form.
fn virtualize_with_stolen_register(di: &DecodedInstruction) -> Vec<Instruction> {
    use iced_x86::Code;

    let instr = &di.inner;
    let steal = pick_steal_register(&[AbiReg::Mem64.reg64(), AbiReg::Addr.reg64()]);
    let mut out = Vec::new();

    out.push(Instruction::with_reg(Code::Push_r64, steal));

    let base = substitute_register(instr.memory_base());
    let disp = instr.memory_displacement64() as i64;
    out.push(Instruction::with_reg_mem(
        Code::Lea_r64_m,
        steal,
        rebase(base, disp),
    ));

    let mut copy = *instr;
    copy.set_memory_base(steal);
    copy.set_memory_index(Register::None);
    copy.set_memory_displacement64(0);
    out.push(copy);

    out.push(Instruction::with_reg(Code::Pop_r64, steal));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_esp_for_virtual_sp() {
        assert_eq!(substitute_register(Register::ESP), AbiReg::Sp.reg32());
        assert_eq!(substitute_register(Register::EAX), Register::EAX);
    }
}
