//! String-instruction widening: `MOVS`/`STOS`/`SCAS`/`CMPS`/`LODS`/`INS`/
//! `OUTS` (with or without a `REP` prefix) compute their host effective
//! address from `RDI`/`RSI` directly, so those registers are widened by
//! `MEM64` before the real instruction and narrowed back afterward — the
//! translator otherwise never touches them.

use iced_x86::{Code, Instruction, Register};

use grr_core::abi::AbiReg;

fn is_string_op(code: Code) -> bool {
    matches!(
        code,
        Code::Movsb_m8_m8
            | Code::Movsw_m16_m16
            | Code::Movsd_m32_m32
            | Code::Stosb_m8_AL
            | Code::Stosw_m16_AX
            | Code::Stosd_m32_EAX
            | Code::Scasb_AL_m8
            | Code::Scasw_AX_m16
            | Code::Scasd_EAX_m32
            | Code::Cmpsb_m8_m8
            | Code::Cmpsw_m16_m16
            | Code::Cmpsd_m32_m32
            | Code::Lodsb_AL_m8
            | Code::Lodsw_AX_m16
            | Code::Lodsd_EAX_m32
            | Code::Insb_m8_DX
            | Code::Insw_m16_DX
            | Code::Insd_m32_DX
            | Code::Outsb_DX_m8
            | Code::Outsw_DX_m16
            | Code::Outsd_DX_m32
    )
}

fn uses_rdi(code: Code) -> bool {
    !matches!(
        code,
        Code::Lodsb_AL_m8 | Code::Lodsw_AX_m16 | Code::Lodsd_EAX_m32 | Code::Outsb_DX_m8 | Code::Outsw_DX_m16 | Code::Outsd_DX_m32
    )
}

fn uses_rsi(code: Code) -> bool {
    !matches!(
        code,
        Code::Stosb_m8_AL | Code::Stosw_m16_AX | Code::Stosd_m32_EAX
    )
}

/// Widens the registers a string op needs, runs `op`, then narrows them
/// back, returning the full host sequence.
pub fn widen_execute_narrow(op: Instruction) -> Vec<Instruction> {
    let code = op.code();
    if !is_string_op(code) {
        return vec![op];
    }

    let mem64 = AbiReg::Mem64.reg64();
    let mut ops = Vec::new();

    if uses_rdi(code) {
        ops.push(Instruction::with_reg_reg(Code::Add_r64_rm64, Register::RDI, mem64));
    }
    if uses_rsi(code) {
        ops.push(Instruction::with_reg_reg(Code::Add_r64_rm64, Register::RSI, mem64));
    }

    ops.push(op);

    if uses_rdi(code) {
        ops.push(Instruction::with_reg_reg(Code::Sub_r64_rm64, Register::RDI, mem64));
    }
    if uses_rsi(code) {
        ops.push(Instruction::with_reg_reg(Code::Sub_r64_rm64, Register::RSI, mem64));
    }

    ops
}
