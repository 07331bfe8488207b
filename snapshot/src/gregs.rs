//! Maps the guest's 32-bit GPRs onto the snapshot format's 27-`u64` slots,
//! the layout of an x86_64 `user_regs_struct` — what the original's
//! snapshot writer actually ptrace'd out of a DECREE CB running under a
//! 64-bit monitor, even though only the low 32 bits of each slot were ever
//! meaningful for a 32-bit guest.

use grr_process::ProcessHot;

pub const NUM_GREGS: usize = 27;

// Slot order: r15, r14, r13, r12, rbp, rbx, r11, r10, r9, r8, rax, rcx, rdx,
// rsi, rdi, orig_rax, rip, cs, eflags, rsp, ss, fs_base, gs_base, ds, es, fs,
// gs. Only the slots a 32-bit guest actually has a register for are filled
// in; `r8`-`r15`, the segment bases/selectors, and `orig_rax` stay zeroed
// format baggage, the same way `fpregs` is carried unread by anything but
// this crate.
const RBP: usize = 4;
const RBX: usize = 5;
const RAX: usize = 10;
const RCX: usize = 11;
const RDX: usize = 12;
const RSI: usize = 13;
const RDI: usize = 14;
const RIP: usize = 16;
const EFLAGS: usize = 18;
const RSP: usize = 19;

pub fn from_hot(hot: &ProcessHot) -> [u64; NUM_GREGS] {
    let mut gregs = [0u64; NUM_GREGS];
    gregs[RAX] = hot.eax as u64;
    gregs[RBX] = hot.ebx as u64;
    gregs[RCX] = hot.ecx as u64;
    gregs[RDX] = hot.edx as u64;
    gregs[RSI] = hot.esi as u64;
    gregs[RDI] = hot.edi as u64;
    gregs[RBP] = hot.ebp as u64;
    gregs[RSP] = hot.esp as u64;
    gregs[RIP] = hot.eip as u64;
    gregs[EFLAGS] = hot.eflags as u64;
    gregs
}

pub fn apply_to_hot(gregs: &[u64; NUM_GREGS], hot: &mut ProcessHot) {
    hot.eax = gregs[RAX] as u32;
    hot.ebx = gregs[RBX] as u32;
    hot.ecx = gregs[RCX] as u32;
    hot.edx = gregs[RDX] as u32;
    hot.esi = gregs[RSI] as u32;
    hot.edi = gregs[RDI] as u32;
    hot.ebp = gregs[RBP] as u32;
    hot.esp = gregs[RSP] as u32;
    hot.eip = gregs[RIP] as u32;
    hot.eflags = gregs[EFLAGS] as u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_hot() {
        let mut hot = ProcessHot {
            eax: 1,
            ebx: 2,
            ecx: 3,
            edx: 4,
            esi: 5,
            edi: 6,
            ebp: 7,
            esp: 8,
            eip: 9,
            eflags: 10,
            ..Default::default()
        };
        let gregs = from_hot(&hot);
        hot.eax = 0;
        apply_to_hot(&gregs, &mut hot);
        assert_eq!(hot.eax, 1);
        assert_eq!(hot.eip, 9);
    }
}
