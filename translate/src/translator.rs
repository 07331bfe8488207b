use iced_x86::{BlockEncoder, BlockEncoderOptions, Code, Encoder, FlowControl, Instruction, InstructionBlock, Mnemonic};

use grr_core::abi::AbiReg;
use grr_core::Addr32;
use grr_decode::{Block, DecodedInstruction};

use crate::abi_emit::write_pc_imm;
use crate::instrument::InstrumentationCallbacks;
use crate::{control_flow, stack, stringops, virtualize};

/// Result of translating one guest [`Block`] into host machine code.
pub struct TranslatedBlock {
    pub bytes: Vec<u8>,
    pub has_one_successor: bool,
    pub ends_with_syscall: bool,
    pub ends_with_error: bool,
    /// `(offset_within_bytes, target_pc32)` of a patchable 5-byte
    /// `JMP rel32` spliced in front of this block's final return to the
    /// dispatcher. Present only for a single-successor `direct_jump`/
    /// `fall_through` exit; the dispatcher registers it with `Patcher`
    /// once the block is committed to the cache.
    pub patch_point: Option<(u32, Addr32)>,
}

/// Translates decoded guest blocks into host code.
pub struct Translator {
    callbacks: InstrumentationCallbacks,
}

impl Translator {
    pub fn new(callbacks: InstrumentationCallbacks) -> Self {
        Translator { callbacks }
    }

    /// Translates `block`, emitting host code suitable for placement at
    /// `cache_ip` (the host virtual address the encoded bytes will live
    /// at — needed so branch-target-relative encodings resolve correctly).
    /// `block_value` is the packed `CacheValue` this block will be indexed
    /// under, baked into the first instruction as `BLOCK64`'s initial load.
    pub fn translate(&self, block: &Block, cache_ip: u64, block_value: u64) -> TranslatedBlock {
        let mut groups: Vec<Vec<Instruction>> = Vec::with_capacity(block.instructions.len());
        let mut patch_target: Option<Addr32> = None;

        let n = block.instructions.len();
        for (i, di) in block.instructions.iter().enumerate().rev() {
            let is_last = i + 1 == n;
            let pc = di.inner.ip() as Addr32;
            let mut ops = vec![write_pc_imm(pc)];

            if is_last && (block.has_error || di.inner.code() == Code::Ud2) {
                ops.push(Instruction::with(Code::Ud2));
            } else if is_last && block.has_syscall && di.is_syscall() {
                ops.extend(control_flow::int80(di.inner.next_ip() as Addr32).ops);
            } else if is_last && di.is_block_terminator() {
                let branch = self.emit_terminator(di, block.end_pc());
                patch_target = branch.patch_target;
                ops.extend(branch.ops);
            } else {
                ops.extend(self.emit_linear(di));
                if is_last {
                    let branch = control_flow::fall_through(block.end_pc(), di);
                    patch_target = branch.patch_target;
                    ops.extend(branch.ops);
                }
            }

            groups.push(ops);
        }
        groups.reverse();

        let mut ops: Vec<Instruction> = groups.into_iter().flatten().collect();
        ops.insert(0, block_entry_marker(block_value));

        let (mut bytes, offsets) = encode(&ops, cache_ip);

        // The last instruction in `ops` is always this block's exit
        // `dispatcher_return()`; splicing a raw `JMP rel32` in right
        // before it gives the patcher a fixed-width slot to hot-patch
        // without fighting iced's own branch-shortening on `jcc`'s
        // trampoline jump elsewhere in this same encode.
        let patch_point = patch_target.map(|target| {
            let splice_at = offsets[ops.len() - 1] as usize;
            bytes.splice(splice_at..splice_at, [0xE9, 0, 0, 0, 0]);
            (splice_at as u32 + 1, target)
        });

        let last = block.instructions.last();
        let ends_with_error = block.has_error;
        let ends_with_syscall = block.has_syscall;
        let has_one_successor = !ends_with_error
            && !ends_with_syscall
            && last
                .map(|di| matches!(di.inner.flow_control(), FlowControl::Next | FlowControl::UnconditionalBranch | FlowControl::Call))
                .unwrap_or(false);

        TranslatedBlock {
            bytes,
            has_one_successor,
            ends_with_syscall,
            ends_with_error,
            patch_point,
        }
    }

    fn emit_linear(&self, di: &DecodedInstruction) -> Vec<Instruction> {
        match di.inner.mnemonic() {
            Mnemonic::Push if di.inner.op_count() == 1 && di.inner.op_register(0) != iced_x86::Register::None => {
                stack::push_reg(di.inner.op_register(0))
            }
            Mnemonic::Pop if di.inner.op_count() == 1 && di.inner.op_register(0) != iced_x86::Register::None => {
                stack::pop_reg(di.inner.op_register(0))
            }
            Mnemonic::Pusha | Mnemonic::Pushad => stack::pusha(),
            Mnemonic::Popa | Mnemonic::Popad => stack::popa(),
            Mnemonic::Pushf | Mnemonic::Pushfd => stack::pushf(),
            Mnemonic::Popf | Mnemonic::Popfd => stack::popf(),
            Mnemonic::Enter => stack::enter(di.inner.immediate16() as u32),
            Mnemonic::Leave => stack::leave(),
            _ if is_string_mnemonic(di.inner.mnemonic()) => {
                let virtualized = virtualize::virtualize(di);
                virtualized.into_iter().flat_map(stringops::widen_execute_narrow).collect()
            }
            _ => virtualize::virtualize(di),
        }
    }

    fn emit_terminator(&self, di: &DecodedInstruction, end_pc: Addr32) -> control_flow::EmulatedBranch {
        let pc = di.inner.ip() as Addr32;
        match di.inner.flow_control() {
            FlowControl::UnconditionalBranch => {
                if di.inner.op_kind(0) == iced_x86::OpKind::NearBranch32 || di.inner.op_kind(0) == iced_x86::OpKind::NearBranch64 {
                    control_flow::direct_jump(di.inner.near_branch_target() as Addr32)
                } else {
                    let ops = virtualize::virtualize(di);
                    let target_reg = di.inner.op_register(0);
                    control_flow::indirect_jump(target_reg, pc, &self.callbacks)
                        .also_prefix(ops)
                }
            }
            FlowControl::IndirectBranch => {
                let ops = virtualize::virtualize(di);
                let target_reg = di.inner.op_register(0);
                control_flow::indirect_jump(target_reg, pc, &self.callbacks).also_prefix(ops)
            }
            FlowControl::Call => {
                if di.inner.op_kind(0) == iced_x86::OpKind::NearBranch32 || di.inner.op_kind(0) == iced_x86::OpKind::NearBranch64 {
                    control_flow::direct_call(di.inner.near_branch_target() as Addr32, end_pc)
                } else {
                    let ops = virtualize::virtualize(di);
                    control_flow::indirect_call(di.inner.op_register(0), end_pc, pc, &self.callbacks).also_prefix(ops)
                }
            }
            FlowControl::IndirectCall => {
                let ops = virtualize::virtualize(di);
                control_flow::indirect_call(di.inner.op_register(0), end_pc, pc, &self.callbacks).also_prefix(ops)
            }
            FlowControl::Return => {
                let pop = if di.inner.op_count() > 0 { di.inner.immediate16() as u32 } else { 0 };
                control_flow::ret(pop)
            }
            FlowControl::ConditionalBranch => control_flow::jcc(
                di.inner.code(),
                Some(di.inner.condition_code()),
                di.inner.near_branch_target() as Addr32,
                end_pc,
                pc,
                &self.callbacks,
            ),
            FlowControl::Interrupt => {
                if di.is_syscall() {
                    control_flow::int80(end_pc)
                } else {
                    control_flow::undefined()
                }
            }
            FlowControl::Exception => control_flow::undefined(),
            FlowControl::XbeginXabortXend => control_flow::undefined(),
            FlowControl::Next => control_flow::fall_through(end_pc, di),
        }
    }
}

impl control_flow::EmulatedBranch {
    fn also_prefix(mut self, mut prefix: Vec<Instruction>) -> Self {
        prefix.extend(self.ops);
        self.ops = prefix;
        self
    }
}

fn is_string_mnemonic(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Movs | Mnemonic::Stos | Mnemonic::Scas | Mnemonic::Cmps | Mnemonic::Lods | Mnemonic::Ins | Mnemonic::Outs
    )
}

/// `BLOCK64 <- CacheValue.bits`, the first instruction of every translated
/// block, making the running block self-identifying on crash.
fn block_entry_marker(block_value: u64) -> Instruction {
    Instruction::with_reg_u64(Code::Mov_r64_imm64, AbiReg::Block.reg64(), block_value)
}

/// Encodes `ops`, returning both the code buffer and the byte offset each
/// instruction landed at (`new_instruction_offsets`), needed to locate a
/// specific instruction's bytes after `BlockEncoder` has resolved branch
/// targets and possibly shortened some of them.
fn encode(ops: &[Instruction], ip: u64) -> (Vec<u8>, Vec<u32>) {
    let block = InstructionBlock::new(ops, ip);
    match BlockEncoder::encode(64, block, BlockEncoderOptions::NONE) {
        Ok(result) => (result.code_buffer, result.new_instruction_offsets),
        Err(_) => {
            // Any instruction the block encoder rejects degrades to a
            // single `UD2`, the same policy as an unsupported decode.
            let mut enc = Encoder::new(64);
            let _ = enc.encode(&Instruction::with(Code::Ud2), ip);
            (enc.take_buffer(), vec![0])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grr_decode::BlockBuilder;

    fn byte_source(code: &'static [u8], base: Addr32) -> impl FnMut(Addr32) -> Option<u8> {
        move |pc| {
            let off = pc.checked_sub(base)? as usize;
            code.get(off).copied()
        }
    }

    #[test]
    fn direct_jump_block_gets_a_patchable_jmp_rel32_before_its_dispatcher_return() {
        // jmp $-2: an unconditional self-loop, translated as a direct jump.
        let code: &[u8] = &[0xEB, 0xFE];
        let block = BlockBuilder::default().build(0x1000, byte_source(code, 0x1000));
        assert_eq!(block.num_instructions(), 1);

        let translator = Translator::new(InstrumentationCallbacks::new(0));
        let translated = translator.translate(&block, 0x5000, 0);

        let (rel_offset, target) = translated.patch_point.expect("direct jump must be chainable");
        assert_eq!(target, 0x1000);
        let rel_offset = rel_offset as usize;
        assert_eq!(translated.bytes[rel_offset - 1], 0xE9);
        assert_eq!(&translated.bytes[rel_offset..rel_offset + 4], &[0, 0, 0, 0]);
        assert!(translated.has_one_successor);
    }

    #[test]
    fn ordinary_fall_through_block_is_also_chainable() {
        // nop, falls through to the next guest PC.
        let code: &[u8] = &[0x90];
        let block = BlockBuilder::new(1).build(0x2000, byte_source(code, 0x2000));
        assert_eq!(block.num_instructions(), 1);

        let translator = Translator::new(InstrumentationCallbacks::new(0));
        let translated = translator.translate(&block, 0x6000, 0);

        let (rel_offset, target) = translated.patch_point.expect("fall-through must be chainable");
        assert_eq!(target, 0x2001);
        let rel_offset = rel_offset as usize;
        assert_eq!(translated.bytes[rel_offset - 1], 0xE9);
        assert_eq!(&translated.bytes[rel_offset..rel_offset + 4], &[0, 0, 0, 0]);
    }

    #[test]
    fn indirect_jump_block_has_no_patch_point() {
        // jmp eax
        let code: &[u8] = &[0xFF, 0xE0];
        let block = BlockBuilder::default().build(0x3000, byte_source(code, 0x3000));
        let translator = Translator::new(InstrumentationCallbacks::new(0));
        let translated = translator.translate(&block, 0x7000, 0);
        assert_eq!(translated.patch_point, None);
    }
}
