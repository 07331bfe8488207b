//! The fixed host-register ABI translated blocks are generated against.
//!
//! Every translated block agrees on which host GPR holds which virtualized
//! guest role. This table is the single source of truth other crates encode
//! and decode against; it must never change independently in more than one
//! place.

use iced_x86::Register;

/// A virtualized role a host general-purpose register is pinned to for the
/// lifetime of a translated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiReg {
    /// Base of the guest's 4 GiB address space within the host process.
    Mem64,
    /// The guest stack pointer, as a byte offset within `Mem64`.
    Sp,
    /// The 32-bit program counter of the current or next block.
    Pc,
    /// Scratch register for a computed value.
    Val,
    /// Scratch register for a computed host address.
    Addr,
    /// Pointer to the `Process` structure backing the running block.
    Process64,
    /// The `CacheValue` of the block currently executing.
    Block,
}

impl AbiReg {
    /// The 64-bit host register backing this role.
    pub const fn reg64(self) -> Register {
        match self {
            AbiReg::Mem64 => Register::R8,
            AbiReg::Sp => Register::R9,
            AbiReg::Pc => Register::R10,
            AbiReg::Val => Register::R11,
            AbiReg::Addr => Register::R12,
            AbiReg::Process64 => Register::R15,
            AbiReg::Block => Register::R14,
        }
    }

    /// The 32-bit sub-register, for roles that are used at 32-bit width
    /// (guest addresses and values are always 32-bit).
    pub const fn reg32(self) -> Register {
        match self {
            AbiReg::Mem64 => Register::R8D,
            AbiReg::Sp => Register::R9D,
            AbiReg::Pc => Register::R10D,
            AbiReg::Val => Register::R11D,
            AbiReg::Addr => Register::R12D,
            AbiReg::Process64 => Register::R15D,
            AbiReg::Block => Register::R14D,
        }
    }

    /// The 16-bit sub-register. `Process64` and `Block` never need one.
    pub const fn reg16(self) -> Option<Register> {
        match self {
            AbiReg::Mem64 => None,
            AbiReg::Sp => Some(Register::R9W),
            AbiReg::Pc => Some(Register::R10W),
            AbiReg::Val => Some(Register::R11W),
            AbiReg::Addr => Some(Register::R12W),
            AbiReg::Process64 => None,
            AbiReg::Block => None,
        }
    }

    /// The 8-bit sub-register, where one is defined.
    pub const fn reg8(self) -> Option<Register> {
        match self {
            AbiReg::Pc => Some(Register::R10L),
            AbiReg::Val => Some(Register::R11L),
            AbiReg::Addr => Some(Register::R12L),
            _ => None,
        }
    }

    /// True if a host register is one of the pinned ABI registers and so
    /// must never be chosen as a scratch register by the translator.
    pub fn is_reserved(reg: Register) -> bool {
        const ALL: [AbiReg; 7] = [
            AbiReg::Mem64,
            AbiReg::Sp,
            AbiReg::Pc,
            AbiReg::Val,
            AbiReg::Addr,
            AbiReg::Process64,
            AbiReg::Block,
        ];
        ALL.iter().any(|r| r.reg64() == reg.full_register())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_use_distinct_registers() {
        let all = [
            AbiReg::Mem64,
            AbiReg::Sp,
            AbiReg::Pc,
            AbiReg::Val,
            AbiReg::Addr,
            AbiReg::Process64,
            AbiReg::Block,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.reg64(), b.reg64());
            }
        }
    }

    #[test]
    fn reserved_detects_sub_registers() {
        assert!(AbiReg::is_reserved(Register::R10D));
        assert!(AbiReg::is_reserved(Register::R10L));
        assert!(!AbiReg::is_reserved(Register::RAX));
    }
}
