use grr_core::Addr32;

use crate::decoder::{DecodedInstruction, Decoder};

/// Blocks are capped at this many guest instructions so that worst-case
/// translated size (and worst-case time spent decoding a pathological
/// straight-line run) stays bounded.
pub const MAX_INSTRUCTIONS_PER_BLOCK: usize = 32;

/// A straight-line run of decoded guest instructions.
#[derive(Debug)]
pub struct Block {
    pub start_pc: Addr32,
    pub instructions: Vec<DecodedInstruction>,
    pub has_error: bool,
    pub has_syscall: bool,
}

impl Block {
    pub fn end_pc(&self) -> Addr32 {
        self.instructions
            .last()
            .map(|i| i.inner.next_ip() as Addr32)
            .unwrap_or(self.start_pc)
    }

    pub fn num_instructions(&self) -> usize {
        self.instructions.len()
    }

    pub fn hit_max_instructions(&self) -> bool {
        self.instructions.len() >= MAX_INSTRUCTIONS_PER_BLOCK
    }
}

/// Assembles a [`Block`] by repeatedly decoding from a byte-fetch callback
/// until a terminator, a decode error, or the instruction cap is reached.
pub struct BlockBuilder {
    max_instructions: usize,
}

impl BlockBuilder {
    pub fn new(max_instructions: usize) -> Self {
        BlockBuilder { max_instructions }
    }

    /// `try_read_byte(pc)` returns `None` for unmapped or non-executable
    /// bytes; that's the only way a block ends in an error from here (the
    /// decoder itself never fails — it degrades to `UD2`).
    pub fn build(&self, start_pc: Addr32, mut try_read_byte: impl FnMut(Addr32) -> Option<u8>) -> Block {
        let mut instructions = Vec::new();
        let mut pc = start_pc;
        let mut has_error = false;
        let mut has_syscall = false;

        loop {
            if instructions.len() >= self.max_instructions {
                break;
            }

            let mut buf = [0u8; 15];
            let mut n = 0usize;
            let mut read_failed = false;
            for slot in buf.iter_mut() {
                match try_read_byte(pc + n as u32) {
                    Some(b) => {
                        *slot = b;
                        n += 1;
                    }
                    None => {
                        read_failed = n == 0;
                        break;
                    }
                }
            }

            if read_failed {
                instructions.push(DecodedInstruction::read_failure_ud2(pc));
                has_error = true;
                break;
            }

            let decoded = Decoder::decode(&buf[..n], pc);
            let terminator = decoded.is_block_terminator();
            let syscall = decoded.is_syscall();
            let is_ud2 = decoded.inner.code() == iced_x86::Code::Ud2 && n < decoded.len;
            let next_pc = pc + decoded.len as u32;

            instructions.push(decoded);

            if is_ud2 {
                has_error = true;
                break;
            }
            if syscall {
                has_syscall = true;
                pc = next_pc;
                break;
            }
            if terminator {
                pc = next_pc;
                break;
            }
            pc = next_pc;
        }

        Block {
            start_pc,
            instructions,
            has_error,
            has_syscall,
        }
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new(MAX_INSTRUCTIONS_PER_BLOCK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_source(code: &'static [u8], base: Addr32) -> impl FnMut(Addr32) -> Option<u8> {
        move |pc| {
            let off = pc.checked_sub(base)? as usize;
            code.get(off).copied()
        }
    }

    #[test]
    fn stops_at_unconditional_jump() {
        // mov ecx, 5 ; jmp rel8 0
        let code: &[u8] = &[0xB9, 0x05, 0x00, 0x00, 0x00, 0xEB, 0xFE];
        let builder = BlockBuilder::default();
        let block = builder.build(0x1000, byte_source(code, 0x1000));
        assert_eq!(block.num_instructions(), 2);
        assert!(!block.has_error);
    }

    #[test]
    fn read_failure_sets_error() {
        let builder = BlockBuilder::default();
        let block = builder.build(0x1000, |_| None);
        assert!(block.has_error);
        assert_eq!(block.num_instructions(), 1);
    }

    #[test]
    fn caps_at_max_instructions() {
        // 40 copies of `nop`
        let code: Vec<u8> = std::iter::repeat(0x90u8).take(40).collect();
        let base = 0x2000;
        let builder = BlockBuilder::new(32);
        let block = builder.build(base, move |pc| {
            let off = (pc - base) as usize;
            code.get(off).copied()
        });
        assert_eq!(block.num_instructions(), 32);
    }
}
