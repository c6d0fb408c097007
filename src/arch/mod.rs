//! # Architecture Module
//!
//! Register numbering and raw register-file layout for each supported target.
//!
//! Register numbers follow the DWARF numbering of the target architecture, so
//! producers and consumers of unwind metadata agree on what a number means.
//! Each backend exposes the sizes of the two register banks, the mapping from
//! a register number to a slot in the captured register file, and the
//! plumbing to copy a kernel-captured context into (and back out of) the
//! portable banks interpreted by the accessors.
//!
//! The general-purpose bank is indexed directly by register number on every
//! supported target; the floating bank starts at an architecture-specific
//! base number.

use std::fmt::{self, Display};

use serde::Serialize;

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
use x86_64 as imp;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
use aarch64 as imp;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("framewalk currently supports x86_64 and aarch64 targets only");

pub(crate) use imp::{
    fp_slot, gp_slot, load_banks, store_gp_bank, RawContext, FP_BANK, GP_BANK, REG_IP, REG_SP,
};

/// An architecture-neutral identifier of a processor register.
///
/// The numbering is the DWARF numbering of the compilation target. The
/// associated constants name the registers every backend must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RegNum(pub u16);

impl RegNum {
    /// The register holding the instruction pointer.
    pub const IP: RegNum = RegNum(imp::REG_IP);

    /// The register holding the stack pointer.
    pub const SP: RegNum = RegNum(imp::REG_SP);

    /// The register anchoring the frame chain.
    pub const FP: RegNum = RegNum(imp::REG_FP);
}

impl Display for RegNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match imp::reg_name(self.0) {
            Some(name) => f.write_str(name),
            None => write!(f, "reg{}", self.0),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_well_known_registers_are_in_the_gp_bank() {
        assert!(gp_slot(RegNum::IP.0).is_some());
        assert!(gp_slot(RegNum::SP.0).is_some());
        assert!(gp_slot(RegNum::FP.0).is_some());
    }

    #[test]
    fn test_banks_do_not_overlap() {
        for reg in 0..512u16 {
            assert!(
                !(gp_slot(reg).is_some() && fp_slot(reg).is_some()),
                "register {reg} maps into both banks"
            );
        }
    }

    #[test]
    fn test_reg_display_names() {
        assert_ne!(RegNum::IP.to_string(), "");
        assert_eq!(RegNum(999).to_string(), "reg999");
    }
}
