//! The fixed host trampoline bridging `grr_process::Process`'s register
//! fields to the ABI registers translated blocks run against, and back.
//!
//! Built once and called through a transmuted function pointer for every
//! dispatched block — the same shape as the teacher's fixed `fn(env,
//! tb_ptr)` prologue/epilogue pair (`ExecEnv::new`'s `emit_prologue`/
//! `emit_epilogue`, invoked by `cpu_tb_exec`), generalized here to the
//! `PROCESS64` ABI this translator's blocks actually address directly
//! instead of a `tcg_core::Context` environment pointer.

use iced_x86::{Code, Encoder, Instruction, MemoryOperand, Register};

use grr_core::process_offsets;

/// `fn(process_ptr, block_host_ptr)`. Guest GPRs and `SP32` are loaded
/// from `*process_ptr` before the call and written back after the block
/// returns (or after a fault redirects the call to land on the same
/// return address — see [`Built::bad_block_addr`]).
pub type EntryFn = unsafe extern "C" fn(*mut u8, *const u8);

/// Free host register used to stash the call target across register
/// setup. Not one of `grr_core::abi::AbiReg`'s pinned registers and not a
/// guest GPR substitution target, so nothing in the setup sequence below
/// clobbers it before the `call`.
const SCRATCH: Register = Register::R13;

/// Host registers the trampoline clobbers and must restore for its own
/// caller (the executor's Rust code): the callee-saved GPRs among
/// `AbiReg`'s pinned set (`R12`/`R14`/`R15`), plus `RBX`/`RBP` since guest
/// `EBX`/`EBP` are loaded into them directly.
const CALLEE_SAVED: [Register; 5] = [Register::RBX, Register::RBP, Register::R12, Register::R14, Register::R15];

fn mem32(base: Register, offset: usize) -> MemoryOperand {
    MemoryOperand::new(base, Register::None, 1, offset as i64, 4, false, Register::None)
}

fn mem64(base: Register, offset: usize) -> MemoryOperand {
    MemoryOperand::new(base, Register::None, 1, offset as i64, 8, false, Register::None)
}

/// Guest general-purpose registers that map 1:1 onto their host
/// namesakes (every guest GPR except `ESP`, which is virtualized through
/// `AbiReg::Sp` instead). Order doesn't matter; every one is loaded
/// before the call and stored back after.
const GUEST_GPRS: [(Register, usize); 7] = [
    (Register::EAX, process_offsets::GPR_EAX),
    (Register::EBX, process_offsets::GPR_EBX),
    (Register::ECX, process_offsets::GPR_ECX),
    (Register::EDX, process_offsets::GPR_EDX),
    (Register::ESI, process_offsets::GPR_ESI),
    (Register::EDI, process_offsets::GPR_EDI),
    (Register::EBP, process_offsets::GPR_EBP),
];

/// The trampoline's machine code plus the offset, relative to its own
/// start, where a faulted block's redirected return lands.
pub struct Built {
    pub bytes: Vec<u8>,
    /// Byte offset of the instruction immediately after the `call`, i.e.
    /// the address a normal block `ret` returns to. `grr_fault`'s
    /// `FaultOutcome::RedirectedToBadBlock` patches the faulting
    /// context's PC to the same address, so an unrecoverable guest fault
    /// "returns" here exactly as if the block had, and the register
    /// write-back + restore + `ret` run unconditionally either way.
    pub bad_block_offset: u32,
}

/// Encodes the trampoline at `ip` (the address it will be committed to in
/// the code cache; nothing it contains is address-dependent since every
/// operand is either register-relative or a fixed-size instruction, but
/// `Encoder` still wants an `ip` to stamp into the result).
pub fn build(ip: u64) -> Built {
    let mut enc = Encoder::new(64);
    let mut bytes = Vec::new();
    let mut emit = |instr: &Instruction| {
        let pos = bytes.len() as u64;
        let len = enc.encode(instr, ip + pos).expect("prologue instruction failed to encode");
        bytes.extend_from_slice(&enc.take_buffer());
        len
    };

    for &reg in CALLEE_SAVED.iter() {
        emit(&Instruction::with_reg(Code::Push_r64, reg));
    }

    // PROCESS64 <- rdi (arg 1).
    emit(&Instruction::with_reg_reg(Code::Mov_r64_rm64, Register::R15, Register::RDI));
    // Stash the block pointer (arg 2, rsi) before rsi is overwritten below.
    emit(&Instruction::with_reg_reg(Code::Mov_r64_rm64, SCRATCH, Register::RSI));
    // MEM64 <- process.mem base (the qword at process_offsets::BASE).
    emit(&Instruction::with_reg_mem(Code::Mov_r64_rm64, grr_core::abi::AbiReg::Mem64.reg64(), mem64(Register::R15, process_offsets::BASE)));
    // SP32 <- process.hot.esp.
    emit(&Instruction::with_reg_mem(Code::Mov_r32_rm32, grr_core::abi::AbiReg::Sp.reg32(), mem32(Register::R15, process_offsets::GPR_ESP)));

    for &(reg, offset) in GUEST_GPRS.iter() {
        emit(&Instruction::with_reg_mem(Code::Mov_r32_rm32, reg, mem32(Register::R15, offset)));
    }

    emit(&Instruction::with_reg(Code::Call_rm64, SCRATCH));

    let bad_block_offset = bytes.len() as u32;

    for &(reg, offset) in GUEST_GPRS.iter() {
        emit(&Instruction::with_mem_reg(Code::Mov_rm32_r32, mem32(Register::R15, offset), reg));
    }
    emit(&Instruction::with_mem_reg(Code::Mov_rm32_r32, mem32(Register::R15, process_offsets::GPR_ESP), grr_core::abi::AbiReg::Sp.reg32()));
    emit(&Instruction::with_mem_reg(Code::Mov_rm32_r32, mem32(Register::R15, process_offsets::GPR_EIP), grr_core::abi::AbiReg::Pc.reg32()));

    for &reg in CALLEE_SAVED.iter().rev() {
        emit(&Instruction::with_reg(Code::Pop_r64, reg));
    }
    emit(&Instruction::with(Code::Retnq));

    Built { bytes, bad_block_offset }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_block_offset_lands_after_the_call() {
        let built = build(0x1000);
        assert!(built.bad_block_offset > 0);
        assert!((built.bad_block_offset as usize) < built.bytes.len());
    }

    #[test]
    fn encoding_is_address_independent() {
        let a = build(0x1000);
        let b = build(0x9000_0000);
        assert_eq!(a.bytes.len(), b.bytes.len());
        assert_eq!(a.bad_block_offset, b.bad_block_offset);
    }
}
