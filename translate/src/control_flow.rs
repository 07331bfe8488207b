//! Emulation of guest control-flow instructions: every case that needs to
//! touch `PC32`, the virtual stack, or the process's `last_branch_pc`
//! instead of a plain virtualized copy.

use iced_x86::{Code, ConditionCode, Instruction, Register};

use grr_core::abi::AbiReg;
use grr_core::Addr32;
use grr_decode::DecodedInstruction;

use crate::abi_emit::{bump_sp, dispatcher_return, load_through_sp, write_pc_imm, write_pc_reg};
use crate::instrument::{InstrumentationCallbacks, InstrumentationPoint};

/// Outcome of emulating a control-flow guest instruction: host ops plus
/// whatever the caller needs to know to finish building the `CacheValue`.
pub struct EmulatedBranch {
    pub ops: Vec<Instruction>,
    pub has_one_successor: bool,
    pub has_syscall: bool,
    /// True if the emulation fully terminates the block (vs. needing a
    /// fall-through write appended by the caller).
    pub terminates_block: bool,
    /// The constant guest PC this block always resumes at, for a
    /// single-successor exit the dispatcher can later hot-patch a direct
    /// `JMP rel32` onto. `None` for anything whose next PC isn't fixed at
    /// translation time, or whose exit must keep round-tripping through
    /// the dispatcher (a forced-coverage fall-through).
    pub patch_target: Option<Addr32>,
}

fn record_last_branch(pc: Addr32) -> Instruction {
    // process.last_branch_pc = pc, at the compile-time-baked GPRs.last_branch_pc
    // offset within the Process structure pointed to by PROCESS64.
    let mem = iced_x86::MemoryOperand::new(
        AbiReg::Process64.reg64(),
        Register::None,
        1,
        grr_core::process_offsets::LAST_BRANCH_PC as i64,
        4,
        false,
        Register::None,
    );
    Instruction::with_mem_i32(Code::Mov_rm32_imm32, mem, pc as i32)
}

/// Direct jump: constant target, single successor, chainable by the
/// patcher.
pub fn direct_jump(target: Addr32) -> EmulatedBranch {
    EmulatedBranch {
        ops: vec![write_pc_imm(target), dispatcher_return()],
        has_one_successor: true,
        has_syscall: false,
        terminates_block: true,
        patch_target: Some(target),
    }
}

/// Indirect jump: target comes from the (already-virtualized) operand
/// register; fires the multi-way-branch instrumentation hook.
pub fn indirect_jump(
    target_reg: Register,
    site_pc: Addr32,
    callbacks: &InstrumentationCallbacks,
) -> EmulatedBranch {
    let mut ops = vec![write_pc_reg(target_reg), record_last_branch(site_pc)];
    ops.extend(callbacks.emit_call(InstrumentationPoint::MultiWayBranch));
    ops.push(dispatcher_return());
    EmulatedBranch {
        ops,
        has_one_successor: false,
        has_syscall: false,
        terminates_block: true,
        patch_target: None,
    }
}

/// Direct call: push the 32-bit return PC onto the virtual stack, jump to
/// the constant target.
pub fn direct_call(target: Addr32, return_pc: Addr32) -> EmulatedBranch {
    let ops = vec![
        bump_sp(-4),
        Instruction::with_mem_i32(
            Code::Mov_rm32_imm32,
            crate::abi_emit::rebase(AbiReg::Sp.reg64(), 0),
            return_pc as i32,
        ),
        write_pc_imm(target),
        dispatcher_return(),
    ];
    EmulatedBranch {
        ops,
        has_one_successor: true,
        has_syscall: false,
        terminates_block: true,
        patch_target: None,
    }
}

/// Indirect call: like [`direct_call`] but the target comes from a
/// register, and fires multi-way-branch instrumentation the same as an
/// indirect jump.
pub fn indirect_call(
    target_reg: Register,
    return_pc: Addr32,
    site_pc: Addr32,
    callbacks: &InstrumentationCallbacks,
) -> EmulatedBranch {
    let mut ops = vec![
        bump_sp(-4),
        Instruction::with_mem_i32(
            Code::Mov_rm32_imm32,
            crate::abi_emit::rebase(AbiReg::Sp.reg64(), 0),
            return_pc as i32,
        ),
        write_pc_reg(target_reg),
        record_last_branch(site_pc),
    ];
    ops.extend(callbacks.emit_call(InstrumentationPoint::MultiWayBranch));
    ops.push(dispatcher_return());
    EmulatedBranch {
        ops,
        has_one_successor: false,
        has_syscall: false,
        terminates_block: true,
        patch_target: None,
    }
}

/// `RET [imm16]`: optionally bumps `SP32` by the immediate pop count first,
/// then pops the 32-bit return PC.
pub fn ret(pop_count: u32) -> EmulatedBranch {
    let mut ops = Vec::new();
    if pop_count != 0 {
        ops.push(bump_sp(pop_count as i32));
    }
    ops.push(load_through_sp(AbiReg::Pc.reg32()));
    ops.push(bump_sp(4));
    ops.push(dispatcher_return());
    EmulatedBranch {
        ops,
        has_one_successor: false,
        has_syscall: false,
        terminates_block: true,
        patch_target: None,
    }
}

/// Conditional branch: a taken/not-taken pair, each recording the branch
/// and calling the multi-way-branch hook. `JCXZ` is special-cased into
/// `JECXZ` on a zero-extended `CX` because amd64 has no 16-bit `JCXZ`.
pub fn jcc(
    code: Code,
    cc: Option<ConditionCode>,
    taken_target: Addr32,
    not_taken_target: Addr32,
    site_pc: Addr32,
    callbacks: &InstrumentationCallbacks,
) -> EmulatedBranch {
    let mut ops = Vec::new();

    let is_jcxz = code == Code::Jcxz_rel8_16;
    if is_jcxz {
        ops.push(Instruction::with_reg_reg(Code::Movzx_r32_rm16, Register::ECX, Register::CX));
    }

    // Short-circuit: test the host condition directly; if false, fall to
    // the not-taken trampoline immediately below.
    let around_label = Instruction::with_branch(
        host_jcc_code(cc, is_jcxz),
        0, // patched to "taken" trampoline offset by the caller during encode
    );
    ops.push(around_label);

    // Not-taken side.
    ops.push(record_last_branch(site_pc));
    ops.extend(callbacks.emit_call(InstrumentationPoint::MultiWayBranch));
    ops.push(write_pc_imm(not_taken_target));
    ops.push(dispatcher_return());

    // Taken side (the `Jcc` above lands here).
    ops.push(record_last_branch(site_pc));
    ops.extend(callbacks.emit_call(InstrumentationPoint::MultiWayBranch));
    ops.push(write_pc_imm(taken_target));
    ops.push(dispatcher_return());

    EmulatedBranch {
        ops,
        has_one_successor: false,
        has_syscall: false,
        terminates_block: true,
        patch_target: None,
    }
}

fn host_jcc_code(cc: Option<ConditionCode>, is_jcxz: bool) -> Code {
    if is_jcxz {
        return Code::Jrcxz_rel8_64;
    }
    match cc {
        Some(cc) => jcc_rel8_for_condition(cc),
        None => Code::Jmp_rel8_64,
    }
}

fn jcc_rel8_for_condition(cc: ConditionCode) -> Code {
    use ConditionCode::*;
    match cc {
        o => Code::Jo_rel8_64,
        no => Code::Jno_rel8_64,
        b => Code::Jb_rel8_64,
        ae => Code::Jae_rel8_64,
        e => Code::Je_rel8_64,
        ne => Code::Jne_rel8_64,
        be => Code::Jbe_rel8_64,
        a => Code::Ja_rel8_64,
        s => Code::Js_rel8_64,
        ns => Code::Jns_rel8_64,
        p => Code::Jp_rel8_64,
        np => Code::Jnp_rel8_64,
        l => Code::Jl_rel8_64,
        ge => Code::Jge_rel8_64,
        le => Code::Jle_rel8_64,
        g => Code::Jg_rel8_64,
        None => Code::Jmp_rel8_64,
    }
}

/// `INT 0x80`: the only interrupt the guest ever legitimately executes.
/// Marks the block as ending with a syscall rather than emulating one.
pub fn int80(end_pc: Addr32) -> EmulatedBranch {
    EmulatedBranch {
        ops: vec![write_pc_imm(end_pc), dispatcher_return()],
        has_one_successor: false,
        has_syscall: true,
        terminates_block: true,
        patch_target: None,
    }
}

/// Any other `INT`/`INTO`/`INT1`/`INT3`, plus `SYSCALL`/`SYSENTER`/
/// `SYSRET`/`SYSEXIT`: the guest should never execute these, so they become
/// `UD2`.
pub fn undefined() -> EmulatedBranch {
    EmulatedBranch {
        ops: vec![Instruction::with(Code::Ud2)],
        has_one_successor: false,
        has_syscall: false,
        terminates_block: true,
        patch_target: None,
    }
}

/// `IRETD`: pops `EFLAGS` (ID-masked the same as `POPFD`), `CS` (discarded,
/// there's only one guest code segment), then `PC32`.
pub fn iretd() -> EmulatedBranch {
    let ops = vec![
        load_through_sp(AbiReg::Val.reg32()),
        Instruction::with_reg_u32(Code::And_rm32_imm32, AbiReg::Val.reg32(), !0x0020_0000u32),
        bump_sp(4),
        bump_sp(4), // discard CS
        load_through_sp(AbiReg::Pc.reg32()),
        bump_sp(4),
        dispatcher_return(),
    ];
    EmulatedBranch {
        ops,
        has_one_successor: false,
        has_syscall: false,
        terminates_block: true,
        patch_target: None,
    }
}

/// Non-branching fall-through at the end of a block: write the next PC and
/// return to the dispatcher. Matches `has_one_successor` unless the last
/// instruction was serializing or `UD2`.
pub fn fall_through(end_pc: Addr32, instr: &DecodedInstruction) -> EmulatedBranch {
    let serializing = matches!(instr.inner.code(), Code::Cpuid | Code::Wbinvd | Code::Invd);
    let has_one_successor = !serializing && instr.inner.code() != Code::Ud2;
    EmulatedBranch {
        ops: vec![write_pc_imm(end_pc), dispatcher_return()],
        has_one_successor,
        has_syscall: false,
        terminates_block: true,
        // Only a true single-successor fall-through is safe to chain: the
        // serializing/UD2 case must keep returning to the dispatcher every
        // time so its forced coverage event still fires.
        patch_target: has_one_successor.then_some(end_pc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grr_decode::Decoder;

    #[test]
    fn direct_jump_is_chainable_onto_its_own_target() {
        let branch = direct_jump(0x4000);
        assert!(branch.has_one_successor);
        assert_eq!(branch.patch_target, Some(0x4000));
    }

    #[test]
    fn fall_through_is_chainable_for_an_ordinary_instruction() {
        let nop = Decoder::decode(&[0x90], 0x1000);
        let branch = fall_through(0x1001, &nop);
        assert!(branch.has_one_successor);
        assert_eq!(branch.patch_target, Some(0x1001));
    }

    #[test]
    fn fall_through_is_not_chainable_after_a_serializing_instruction() {
        let cpuid = Decoder::decode(&[0x0F, 0xA2], 0x1000);
        let branch = fall_through(0x1002, &cpuid);
        assert!(!branch.has_one_successor);
        assert_eq!(branch.patch_target, None);
    }

    #[test]
    fn indirect_jump_is_never_chainable() {
        let callbacks = InstrumentationCallbacks::new(0);
        let branch = indirect_jump(Register::EAX, 0x1000, &callbacks);
        assert_eq!(branch.patch_target, None);
    }
}
