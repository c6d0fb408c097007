//! # framewalk
//!
//! Architecture-independent call-frame unwinding primitives.
//!
//! This crate reconstructs the logical call-frame sequence of a running (or
//! snapshotted) thread. It is the plumbing underneath exception propagation
//! and diagnostic backtraces: an address-space abstraction with pluggable
//! accessors, and a generic backtrace driver that steps a cursor through
//! frames until the stack ends, a step fails, or the caller aborts.
//!
//! Decoding of call-frame-information tables, instruction decoding, and full
//! symbolization are external collaborators reached through the accessor
//! seam; the built-in [`FramePointerStepper`] walks plain frame-pointer
//! chains.
//!
//! On platforms exposing a per-process region table, raw memory access is
//! validated against a lazily built [`ProcessMemoryMap`](memorymap::ProcessMemoryMap)
//! before any dereference, so a corrupted stack produces an error instead of
//! crashing the unwinder itself.
//!
//! ```no_run
//! use framewalk::{trace, FrameAction};
//!
//! let outcome = trace(|frame| {
//!     println!("{}", frame.ip());
//!     FrameAction::Continue
//! });
//! println!("walk finished: {outcome:?}");
//! ```

use std::fmt::Display;

use serde::Serialize;

pub mod accessors;
pub mod addr;
pub mod addrspace;
pub mod arch;
pub mod backtrace;
pub mod context;
pub mod cursor;
pub mod dyninfo;
pub mod errors;
pub mod memorymap;
pub mod stepper;

mod symbols;

pub use accessors::{Accessors, LocalAccessors, ProcInfo, ProcName};
pub use addr::Addr;
pub use addrspace::{AddressSpace, CachingPolicy, ValidateMemoryAccess};
pub use arch::RegNum;
pub use backtrace::{
    capture_backtrace, trace, Backtrace, BacktraceDriver, BacktraceFrame, BacktraceOutcome,
    FatalKind, FrameAction,
};
pub use context::ExecutionContext;
pub use cursor::{Cursor, Step, Stepper};
pub use errors::{Result, UnwindError};
pub use stepper::FramePointerStepper;

/// One machine word of the unwind target.
pub type Word = u64;

/// Size of one machine word in bytes.
pub const WORD_BYTES: usize = std::mem::size_of::<Word>();

/// The raw bits of one floating-point register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FpWord(pub u128);

impl Display for FpWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#034x}", { self.0 })
    }
}

impl Serialize for FpWord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<u128> for FpWord {
    fn from(value: u128) -> Self {
        FpWord(value)
    }
}

impl From<FpWord> for u128 {
    fn from(value: FpWord) -> Self {
        value.0
    }
}
