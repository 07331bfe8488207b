use grr_core::Addr32;
use grr_decode::Decoder;
use grr_process::Process;
use iced_x86::{OpKind, Register};

/// The decomposed guest effective address `base + index*scale + disp` that
/// produced a fault, recovered from the faulting instruction's own bytes
/// rather than trusted blindly from the hardware-reported address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecomposedFault {
    pub base: Addr32,
    pub index: Addr32,
    pub scale: u32,
    pub disp: u32,
}

const MAX_INSTRUCTION_BYTES: usize = 15;

fn reg_value(process: &Process, reg: Register) -> u32 {
    match reg.full_register() {
        Register::EAX => process.hot.eax,
        Register::ECX => process.hot.ecx,
        Register::EDX => process.hot.edx,
        Register::EBX => process.hot.ebx,
        Register::ESP => process.hot.esp,
        Register::EBP => process.hot.ebp,
        Register::ESI => process.hot.esi,
        Register::EDI => process.hot.edi,
        _ => 0,
    }
}

/// Finds which memory operand of the guest instruction at `process.hot.eip`
/// produced `fault_addr`, decomposing it into base/index/scale/disp. Falls
/// back to `{ base: fault_addr, .. }` if the instruction can't be decoded
/// or no operand's effective address matches.
pub fn decompose_fault_addr(process: &Process, fault_addr: Addr32) -> DecomposedFault {
    let fallback = DecomposedFault { base: fault_addr, index: 0, scale: 0, disp: 0 };

    let mut bytes = [0u8; MAX_INSTRUCTION_BYTES];
    let mut len = 0usize;
    for (i, slot) in bytes.iter_mut().enumerate() {
        let addr = process.hot.eip.wrapping_add(i as u32);
        if !process.try_read_bytes(addr, std::slice::from_mut(slot)) {
            break;
        }
        len += 1;
    }
    if len == 0 {
        return fallback;
    }

    let decoded = Decoder::decode(&bytes[..len], process.hot.eip);
    if !decoded.is_valid {
        return fallback;
    }

    let instr = &decoded.inner;
    for op in 0..instr.op_count() {
        if instr.op_kind(op) != OpKind::Memory {
            continue;
        }
        let base = reg_value(process, instr.memory_base());
        let index = reg_value(process, instr.memory_index());
        let scale = instr.memory_index_scale();
        let disp = instr.memory_displacement32();
        let effective = base.wrapping_add(index.wrapping_mul(scale)).wrapping_add(disp);
        if effective == fault_addr {
            return DecomposedFault { base, index, scale, disp };
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use grr_core::PagePerms;

    #[test]
    fn decomposes_simple_indexed_load() {
        let mut process = Process::new(1).unwrap();
        let code_addr = process.allocate(4096, PagePerms::RWX).unwrap();
        process.try_lazy_map(code_addr);
        process.try_make_writable(code_addr);

        // mov eax, [ebx + ecx*2 + 0x10]
        let bytes: [u8; 7] = [0x8B, 0x44, 0x4B, 0x10, 0x90, 0x90, 0x90];
        process.try_write_bytes(code_addr, &bytes);
        process.hot.eip = code_addr;
        process.hot.ebx = 0x1000;
        process.hot.ecx = 0x20;

        let fault_addr = 0x1000u32.wrapping_add(0x20 * 2).wrapping_add(0x10);
        let decomposed = decompose_fault_addr(&process, fault_addr);
        assert_eq!(decomposed.base, 0x1000);
        assert_eq!(decomposed.index, 0x20);
        assert_eq!(decomposed.scale, 2);
        assert_eq!(decomposed.disp, 0x10);
    }

    #[test]
    fn falls_back_when_instruction_bytes_unreadable() {
        let process = Process::new(1).unwrap();
        let decomposed = decompose_fault_addr(&process, 0xdead_beef);
        assert_eq!(decomposed, DecomposedFault { base: 0xdead_beef, index: 0, scale: 0, disp: 0 });
    }
}
