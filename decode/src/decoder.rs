use iced_x86::{
    Code, Decoder as IcedDecoder, DecoderOptions, FlowControl, Instruction, InstructionInfoFactory,
    OpAccess, OpKind, Register,
};

use grr_core::Addr32;

/// A decoded 32-bit guest instruction, with the register/memory/flags
/// metadata the translator consults instead of re-deriving it per use.
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    pub inner: Instruction,
    pub is_valid: bool,
    pub len: usize,
    pub gprs_read: Vec<Register>,
    pub gprs_written: Vec<Register>,
    pub reads_aflags: bool,
    pub writes_aflags: bool,
    pub reads_mem: bool,
    pub writes_mem: bool,
    pub uses_legacy_registers: bool,
    pub has_pc_rel_op: bool,
}

impl DecodedInstruction {
    /// Synthesize a 2-byte `UD2` standing in for an instruction the decoder
    /// couldn't handle. `is_valid` stays `true`: the *block* records the
    /// failure via `has_error`, this is a legitimate, executable placeholder.
    fn ud2(pc: Addr32) -> Self {
        let mut instr = Instruction::default();
        instr.set_code(Code::Ud2);
        instr.set_ip(pc as u64);
        instr.set_next_ip(pc as u64 + 2);
        DecodedInstruction {
            inner: instr,
            is_valid: true,
            len: 2,
            gprs_read: Vec::new(),
            gprs_written: Vec::new(),
            reads_aflags: false,
            writes_aflags: false,
            reads_mem: false,
            writes_mem: false,
            uses_legacy_registers: false,
            has_pc_rel_op: false,
        }
    }

    /// `UD2` standing in for a block that ran off the end of mapped or
    /// executable memory.
    pub fn read_failure_ud2(pc: Addr32) -> Self {
        Self::ud2(pc)
    }

    pub fn is_block_terminator(&self) -> bool {
        !matches!(self.inner.flow_control(), FlowControl::Next)
    }

    pub fn is_syscall(&self) -> bool {
        self.inner.code() == Code::Int_imm8 && self.inner.immediate8() == 0x80
    }
}

/// Categories the guest is never expected to execute here; any decode that
/// falls into one becomes `UD2` rather than being mistranslated.
fn is_unsupported(instr: &Instruction) -> bool {
    use iced_x86::CpuidFeature::*;
    instr
        .cpuid_features()
        .iter()
        .any(|f| matches!(f, AVX | AVX2 | AES | RDRAND | RDSEED | BMI1 | BMI2))
}

/// Decodes 32-bit x86 machine code, one instruction at a time.
pub struct Decoder;

impl Decoder {
    /// Decode a single instruction starting at guest address `pc`, reading
    /// from `bytes` (up to 15 of them, the x86 maximum instruction length).
    pub fn decode(bytes: &[u8], pc: Addr32) -> DecodedInstruction {
        let len = bytes.len().min(15);
        let mut iced = IcedDecoder::with_ip(32, &bytes[..len], pc as u64, DecoderOptions::NONE);
        if !iced.can_decode() {
            return DecodedInstruction::ud2(pc);
        }
        let mut instr = Instruction::default();
        iced.decode_out(&mut instr);
        if instr.is_invalid() || is_unsupported(&instr) {
            return DecodedInstruction::ud2(pc);
        }

        let mut info_factory = InstructionInfoFactory::new();
        let info = info_factory.info(&instr);

        let mut gprs_read = Vec::new();
        let mut gprs_written = Vec::new();
        let mut reads_aflags = false;
        let mut writes_aflags = false;
        for used in info.used_registers() {
            let reg = used.register();
            if reg.is_gpr() {
                match used.access() {
                    OpAccess::Read | OpAccess::CondRead | OpAccess::ReadWrite | OpAccess::ReadCondWrite => {
                        gprs_read.push(reg);
                    }
                    _ => {}
                }
                match used.access() {
                    OpAccess::Write | OpAccess::ReadWrite | OpAccess::CondWrite | OpAccess::ReadCondWrite => {
                        gprs_written.push(reg);
                    }
                    _ => {}
                }
            }
        }
        if !instr.rflags_read().is_empty() {
            reads_aflags = true;
        }
        if !instr.rflags_written().is_empty() {
            writes_aflags = true;
        }

        let reads_mem = info.used_memory().iter().any(|m| matches!(m.access(), OpAccess::Read | OpAccess::CondRead | OpAccess::ReadWrite | OpAccess::ReadCondWrite));
        let writes_mem = info.used_memory().iter().any(|m| matches!(m.access(), OpAccess::Write | OpAccess::ReadWrite | OpAccess::CondWrite | OpAccess::ReadCondWrite));

        let uses_legacy_registers = (0..instr.op_count()).any(|i| {
            instr.op_kind(i) == OpKind::Register && is_legacy_high_byte(instr.op_register(i))
        });

        let has_pc_rel_op = instr.is_ip_rel_memory_operand()
            || (0..instr.op_count()).any(|i| matches!(instr.op_kind(i), OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64));

        DecodedInstruction {
            len: instr.len(),
            inner: instr,
            is_valid: true,
            gprs_read,
            gprs_written,
            reads_aflags,
            writes_aflags,
            reads_mem,
            writes_mem,
            uses_legacy_registers,
            has_pc_rel_op,
        }
    }
}

fn is_legacy_high_byte(reg: Register) -> bool {
    matches!(reg, Register::AH | Register::CH | Register::DH | Register::BH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_simple_mov() {
        // mov ecx, 5
        let bytes = [0xB9, 0x05, 0x00, 0x00, 0x00];
        let d = Decoder::decode(&bytes, 0x1000);
        assert!(d.is_valid);
        assert_eq!(d.len, 5);
        assert!(d.gprs_written.iter().any(|r| r.full_register() == Register::ECX));
    }

    #[test]
    fn unsupported_bytes_become_ud2() {
        let bytes = [0xFF]; // truncated ModRM-needing opcode
        let d = Decoder::decode(&bytes, 0x2000);
        assert!(d.is_valid);
        assert_eq!(d.inner.code(), Code::Ud2);
    }

    #[test]
    fn detects_block_terminator() {
        // jmp rel8 +2
        let bytes = [0xEB, 0x02];
        let d = Decoder::decode(&bytes, 0x3000);
        assert!(d.is_block_terminator());
    }
}
