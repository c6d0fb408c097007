//! # Execution Context Module
//!
//! Captures and carries the register file of one thread.
//!
//! An [`ExecutionContext`] is an architecture-specific snapshot of a thread's
//! general-purpose and floating-point register banks plus its program
//! counter. The layout is opaque to everything except the accessor capability
//! set, which maps architecture-neutral register numbers onto bank slots.
//!
//! The snapshot keeps the raw kernel context pinned on the heap so that a
//! later `resume` can transfer control back into a previously unwound frame;
//! everything else reads and writes the portable banks.

use std::fmt;
use std::mem::MaybeUninit;

use nix::errno::Errno;
use nix::libc;
use tracing::trace;

use crate::addr::Addr;
use crate::arch;
use crate::errors::{Result, UnwindError};
use crate::{FpWord, Word};

/// A snapshot of one thread's register file.
///
/// Produced by [`ExecutionContext::capture`] for the calling thread and
/// consumed by a [`Cursor`](crate::cursor::Cursor). The register banks are
/// interpreted only through an accessor capability set; the raw kernel
/// context stays pinned in its heap allocation for the lifetime of the
/// snapshot so it stays self-consistent for `resume`.
pub struct ExecutionContext {
    raw: Box<arch::RawContext>,
    gp: [Word; arch::GP_BANK],
    fp: [FpWord; arch::FP_BANK],
}

impl ExecutionContext {
    /// Captures the register file of the calling thread.
    ///
    /// This is the architecture-specific save primitive seeding a cursor. It
    /// is forced inline so the recorded frame belongs to the caller, not to a
    /// helper that has already returned by the time the walk starts.
    ///
    /// # Errors
    ///
    /// Fails with the underlying OS error if the kernel refuses to save the
    /// context.
    #[inline(always)]
    pub fn capture() -> Result<Self> {
        let mut raw = Box::new(MaybeUninit::<arch::RawContext>::zeroed());
        // SAFETY: getcontext fills the pointee and reports failure in its
        // return value.
        let rc = unsafe { libc::getcontext(raw.as_mut_ptr().cast()) };
        if rc != 0 {
            return Err(UnwindError::Os(Errno::last()));
        }
        // SAFETY: the allocation is fully initialized now; the cast keeps the
        // same heap location, which the fpstate pointer inside may refer to.
        let raw: Box<arch::RawContext> = unsafe { Box::from_raw(Box::into_raw(raw).cast()) };
        // SAFETY: freshly captured and never moved.
        let (gp, fp) = unsafe { arch::load_banks(&raw) };

        let ctx = Self { raw, gp, fp };
        trace!("captured context at ip {}", ctx.ip());
        Ok(ctx)
    }

    /// The program counter recorded in this snapshot.
    pub fn ip(&self) -> Addr {
        Addr::from(self.gp[arch::REG_IP as usize])
    }

    /// The stack pointer recorded in this snapshot.
    pub fn sp(&self) -> Addr {
        Addr::from(self.gp[arch::REG_SP as usize])
    }

    pub(crate) fn read_gp(&self, slot: usize) -> Word {
        self.gp[slot]
    }

    pub(crate) fn write_gp(&mut self, slot: usize, value: Word) {
        self.gp[slot] = value;
    }

    pub(crate) fn read_fp(&self, slot: usize) -> FpWord {
        self.fp[slot]
    }

    pub(crate) fn write_fp(&mut self, slot: usize, value: FpWord) {
        self.fp[slot] = value;
    }

    /// Flushes the general-purpose bank back into the pinned kernel context.
    pub(crate) fn sync_raw_for_resume(&mut self) {
        arch::store_gp_bank(&mut self.raw, &self.gp);
    }

    pub(crate) fn raw_ptr(&self) -> *const arch::RawContext {
        &*self.raw
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("ip", &self.ip())
            .field("sp", &self.sp())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_capture_records_live_code_and_stack() {
        let ctx = ExecutionContext::capture().expect("could not capture own context");
        // the captured pc points at code and the captured sp at the stack,
        // neither of which is ever address zero
        assert!(!ctx.ip().is_null());
        assert!(!ctx.sp().is_null());
    }

    #[test]
    fn test_bank_slots_roundtrip() {
        let mut ctx = ExecutionContext::capture().expect("could not capture own context");
        ctx.write_gp(0, 0xabcd_1234);
        assert_eq!(ctx.read_gp(0), 0xabcd_1234);
    }
}
