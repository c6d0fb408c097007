//! x86_64 register-file layout.
//!
//! General-purpose numbering follows the System V AMD64 DWARF mapping:
//! rax=0 through r15=15, with the return-address column (rip) at 16. The
//! floating bank maps xmm0 through xmm15 onto 17 through 32.

use nix::libc;

use crate::{FpWord, Word};

pub(crate) type RawContext = libc::ucontext_t;

pub(crate) const GP_BANK: usize = 17;
pub(crate) const FP_BANK: usize = 16;

pub(crate) const REG_IP: u16 = 16;
pub(crate) const REG_SP: u16 = 7;
pub(crate) const REG_FP: u16 = 6;

const FP_BASE: u16 = 17;

// DWARF register number -> index into the mcontext greg array.
const GREG_SLOTS: [i32; GP_BANK] = [
    libc::REG_RAX,
    libc::REG_RDX,
    libc::REG_RCX,
    libc::REG_RBX,
    libc::REG_RSI,
    libc::REG_RDI,
    libc::REG_RBP,
    libc::REG_RSP,
    libc::REG_R8,
    libc::REG_R9,
    libc::REG_R10,
    libc::REG_R11,
    libc::REG_R12,
    libc::REG_R13,
    libc::REG_R14,
    libc::REG_R15,
    libc::REG_RIP,
];

const GP_NAMES: [&str; GP_BANK] = [
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip",
];

const XMM_NAMES: [&str; FP_BANK] = [
    "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
    "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
];

pub(crate) fn gp_slot(reg: u16) -> Option<usize> {
    (reg < GP_BANK as u16).then_some(reg as usize)
}

pub(crate) fn fp_slot(reg: u16) -> Option<usize> {
    reg.checked_sub(FP_BASE)
        .map(usize::from)
        .filter(|slot| *slot < FP_BANK)
}

pub(crate) fn reg_name(reg: u16) -> Option<&'static str> {
    if let Some(slot) = gp_slot(reg) {
        return Some(GP_NAMES[slot]);
    }
    fp_slot(reg).map(|slot| XMM_NAMES[slot])
}

/// Copies a kernel-captured context into the portable register banks.
///
/// # Safety
///
/// `raw` must have been filled by `getcontext` and must not have moved since,
/// so that its floating-point state pointer still refers into the same
/// allocation.
pub(crate) unsafe fn load_banks(raw: &RawContext) -> ([Word; GP_BANK], [FpWord; FP_BANK]) {
    let mut gp = [0; GP_BANK];
    for (slot, greg) in GREG_SLOTS.iter().enumerate() {
        gp[slot] = raw.uc_mcontext.gregs[*greg as usize] as Word;
    }

    let mut fp = [FpWord(0); FP_BANK];
    let fpstate = raw.uc_mcontext.fpregs;
    if !fpstate.is_null() {
        for (slot, xmm) in (*fpstate)._xmm.iter().enumerate() {
            let e = &xmm.element;
            fp[slot] = FpWord(
                u128::from(e[0])
                    | u128::from(e[1]) << 32
                    | u128::from(e[2]) << 64
                    | u128::from(e[3]) << 96,
            );
        }
    }

    (gp, fp)
}

/// Writes the general-purpose bank back into the raw context before a resume.
pub(crate) fn store_gp_bank(raw: &mut RawContext, gp: &[Word; GP_BANK]) {
    for (slot, greg) in GREG_SLOTS.iter().enumerate() {
        raw.uc_mcontext.gregs[*greg as usize] = gp[slot] as i64;
    }
}
