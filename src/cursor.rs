//! # Cursor Module
//!
//! The handle for "current frame" during a walk.
//!
//! A [`Cursor`] is produced from an [`ExecutionContext`] and an
//! [`AddressSpace`] and advanced outward, one frame per step, by a
//! [`Stepper`]. All register and memory traffic goes through the address
//! space's accessor capability set, so the same cursor code serves every
//! target an accessor implementation exists for.
//!
//! The stepping primitive itself is an external collaborator: anything that
//! can recover the caller's frame from the callee's (call-frame information,
//! frame-pointer chains, heuristics) plugs in through the [`Stepper`] trait.

use crate::accessors::{ProcInfo, ProcName};
use crate::addr::Addr;
use crate::addrspace::AddressSpace;
use crate::arch::RegNum;
use crate::context::ExecutionContext;
use crate::errors::{Result, UnwindError};
use crate::{FpWord, Word};

/// The result of one successful stepper invocation.
///
/// Errors travel separately through `Result`, so there is no sentinel value
/// to misread: a step either produced the caller's frame, hit the end of the
/// stack, or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The cursor now describes the caller's frame.
    Progressed,
    /// No more frames remain below this one.
    EndOfStack,
}

/// The external frame-stepping primitive.
///
/// Implementations advance the cursor to the previous (caller's) frame using
/// only the cursor's register and memory operations plus whatever unwind
/// metadata they can find through the address space.
pub trait Stepper {
    /// Advances `cursor` one frame outward.
    ///
    /// # Errors
    ///
    /// Fails when the caller's frame cannot be recovered: missing or invalid
    /// unwind metadata, a broken frame chain, or unreadable memory. A failed
    /// step leaves the cursor unusable for further stepping.
    fn step(&mut self, cursor: &mut Cursor<'_>) -> Result<Step>;
}

/// A cursor over the frames of one thread's stack.
///
/// Starts at the innermost (most recently captured) frame. Also the opaque
/// frame handle passed to the backtrace callback, where its register and
/// memory patch primitives allow an exception runtime to prepare a landing
/// frame.
#[derive(Debug)]
pub struct Cursor<'a> {
    space: &'a AddressSpace,
    ctx: ExecutionContext,
    depth: usize,
}

impl<'a> Cursor<'a> {
    /// Creates a cursor over `space` seeded with `ctx`.
    ///
    /// # Errors
    ///
    /// Fails with [`UnwindError::InvalidContext`] when the snapshot carries
    /// no usable instruction pointer.
    pub fn new(space: &'a AddressSpace, ctx: ExecutionContext) -> Result<Cursor<'a>> {
        if ctx.ip().is_null() {
            return Err(UnwindError::InvalidContext);
        }
        Ok(Cursor {
            space,
            ctx,
            depth: 0,
        })
    }

    /// The address space this cursor walks.
    pub fn space(&self) -> &'a AddressSpace {
        self.space
    }

    /// The instruction pointer of the current frame, read from the snapshot.
    pub fn ip(&self) -> Addr {
        self.ctx.ip()
    }

    /// The stack pointer of the current frame, read from the snapshot.
    pub fn sp(&self) -> Addr {
        self.ctx.sp()
    }

    /// How many frames this cursor has been stepped outward.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn bump_depth(&mut self) {
        self.depth += 1;
    }

    /// Reads a general-purpose register of the current frame.
    ///
    /// # Errors
    ///
    /// Fails with [`UnwindError::BadRegister`] for numbers outside the
    /// general-purpose bank.
    pub fn register(&mut self, reg: RegNum) -> Result<Word> {
        let mut value = 0;
        let Cursor { space, ctx, .. } = self;
        space.access_reg(ctx, reg, &mut value, false)?;
        Ok(value)
    }

    /// Writes a general-purpose register of the current frame.
    ///
    /// # Errors
    ///
    /// Fails with [`UnwindError::BadRegister`] for numbers outside the
    /// general-purpose bank.
    pub fn set_register(&mut self, reg: RegNum, mut value: Word) -> Result<()> {
        let Cursor { space, ctx, .. } = self;
        space.access_reg(ctx, reg, &mut value, true)
    }

    /// Reads a floating-point register of the current frame.
    ///
    /// # Errors
    ///
    /// Fails with [`UnwindError::BadRegister`] for numbers outside the
    /// floating bank.
    pub fn fp_register(&mut self, reg: RegNum) -> Result<FpWord> {
        let mut value = FpWord(0);
        let Cursor { space, ctx, .. } = self;
        space.access_fpreg(ctx, reg, &mut value, false)?;
        Ok(value)
    }

    /// Writes a floating-point register of the current frame.
    ///
    /// # Errors
    ///
    /// Fails with [`UnwindError::BadRegister`] for numbers outside the
    /// floating bank.
    pub fn set_fp_register(&mut self, reg: RegNum, mut value: FpWord) -> Result<()> {
        let Cursor { space, ctx, .. } = self;
        space.access_fpreg(ctx, reg, &mut value, true)
    }

    /// Reads one word of target memory through the address space.
    ///
    /// # Errors
    ///
    /// Propagates validation refusals and accessor failures.
    pub fn read_word(&self, addr: Addr) -> Result<Word> {
        self.space.read_word(addr)
    }

    /// Writes one word of target memory through the address space.
    ///
    /// # Errors
    ///
    /// Propagates validation refusals and accessor failures.
    pub fn write_word(&mut self, addr: Addr, value: Word) -> Result<()> {
        self.space.write_word(addr, value)
    }

    /// Bounds of the procedure containing the current instruction pointer.
    ///
    /// # Errors
    ///
    /// Fails when no unwind metadata covers the current frame.
    pub fn proc_info(&mut self) -> Result<ProcInfo> {
        self.space.find_proc_info(self.ip())
    }

    /// Name of the procedure containing the current instruction pointer.
    ///
    /// # Errors
    ///
    /// Fails when no symbol covers the current frame.
    pub fn proc_name(&mut self) -> Result<ProcName> {
        self.space.resolve_name(self.ip())
    }

    /// Transfers control into the current frame. One-shot and terminal; no
    /// further stepping may happen on this cursor.
    ///
    /// # Errors
    ///
    /// Returns only on failure to restore the context.
    ///
    /// # Safety
    ///
    /// See [`Accessors::resume`](crate::Accessors::resume).
    pub unsafe fn resume(&mut self) -> Result<()> {
        let Cursor { space, ctx, .. } = self;
        space.resume(ctx)
    }
}
