//! # Frame-Pointer Stepper Module
//!
//! The built-in stepping primitive.
//!
//! Walks the classic frame-pointer chain: each frame record holds the
//! caller's frame pointer at `[fp]` and the return address at `[fp + word]`,
//! on both supported architectures. This needs no unwind tables, at the cost
//! of requiring frame pointers in the unwound code; anything richer (CFI
//! interpretation) plugs in through the same [`Stepper`] seam.
//!
//! The stepper, not the driver, is responsible for noticing corruption: a
//! frame pointer that fails to move strictly toward the stack base is
//! reported as a cycle, and when the address space carries a memory map, a
//! return address outside executable memory is refused rather than walked
//! into.

use tracing::{trace, warn};

use crate::addr::Addr;
use crate::addrspace::ValidateMemoryAccess;
use crate::arch::RegNum;
use crate::cursor::{Cursor, Step, Stepper};
use crate::errors::{Result, UnwindError};
use crate::WORD_BYTES;

/// Steps through frame-pointer chains.
#[derive(Debug, Default, Clone, Copy)]
pub struct FramePointerStepper;

impl Stepper for FramePointerStepper {
    fn step(&mut self, cursor: &mut Cursor<'_>) -> Result<Step> {
        let fp = cursor.register(RegNum::FP)?;
        if fp == 0 {
            // the outermost frame record was reached on the previous step
            return Ok(Step::EndOfStack);
        }
        let frame = Addr::from(fp);

        let saved_fp = cursor.read_word(frame)?;
        let return_addr = cursor.read_word(frame + WORD_BYTES)?;
        if return_addr == 0 {
            return Ok(Step::EndOfStack);
        }

        if saved_fp != 0 && saved_fp <= fp {
            warn!("frame chain cycles at {frame}: saved fp {saved_fp:#x} <= fp {fp:#x}");
            return Err(UnwindError::FrameChainCycle(frame));
        }

        if cursor.space().validation() == ValidateMemoryAccess::Enabled
            && !cursor.space().map()?.is_executable(Addr::from(return_addr))
        {
            warn!("return address {return_addr:#x} at {frame} is not executable");
            return Err(UnwindError::NonExecutableReturn(Addr::from(return_addr)));
        }

        cursor.set_register(RegNum::FP, saved_fp)?;
        cursor.set_register(RegNum::SP, (frame + 2 * WORD_BYTES).into())?;
        cursor.set_register(RegNum::IP, return_addr)?;
        trace!(
            "stepped to frame {} at ip {:#x}",
            cursor.depth() + 1,
            return_addr
        );
        Ok(Step::Progressed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::accessors::LocalAccessors;
    use crate::addrspace::{AddressSpace, CachingPolicy};
    use crate::context::ExecutionContext;
    use crate::memorymap::{MemoryPermissions, MemoryRegion, ProcessMemoryMap};
    use crate::Word;
    use nix::unistd::Pid;

    /// Lays out `depth` frame records in owned memory, linked innermost to
    /// outermost, each with a distinct fake return address.
    ///
    /// The records sit at ascending addresses like real frames of a downward
    /// growing stack, and the outermost record carries a zero saved frame
    /// pointer like a thread entry point does.
    struct FakeStack {
        words: Box<[Word]>,
        depth: usize,
    }

    impl FakeStack {
        const RETURN_BASE: Word = 0x4000_0000;

        fn chain(depth: usize) -> Self {
            let mut words = vec![0 as Word; (depth.max(1)) * 2].into_boxed_slice();
            for frame in 0..depth {
                let next = if frame + 1 < depth {
                    std::ptr::addr_of!(words[(frame + 1) * 2]) as Word
                } else {
                    0
                };
                words[frame * 2] = next;
                words[frame * 2 + 1] = Self::RETURN_BASE + frame as Word;
            }
            Self { words, depth }
        }

        fn innermost_fp(&self) -> Word {
            if self.depth == 0 {
                0
            } else {
                self.words.as_ptr() as Word
            }
        }

        fn region(&self, execute_returns: bool) -> Vec<MemoryRegion> {
            let start = self.words.as_ptr() as usize;
            let mut regions = vec![MemoryRegion {
                start_address: Addr::from(start),
                end_address: Addr::from(start + std::mem::size_of_val(&*self.words)),
                permissions: MemoryPermissions {
                    read: true,
                    write: false,
                    execute: false,
                },
                offset: 0,
                path: None,
            }];
            if execute_returns {
                regions.push(MemoryRegion {
                    start_address: Addr::from(Self::RETURN_BASE as usize),
                    end_address: Addr::from(Self::RETURN_BASE as usize + 0x1000),
                    permissions: MemoryPermissions {
                        read: true,
                        write: false,
                        execute: true,
                    },
                    offset: 0,
                    path: None,
                });
            }
            regions
        }
    }

    fn unvalidated_space() -> AddressSpace {
        AddressSpace::new(
            Box::new(LocalAccessors),
            CachingPolicy::None,
            ValidateMemoryAccess::Disabled,
            Pid::this(),
        )
    }

    fn cursor_over<'a>(space: &'a AddressSpace, fp: Word) -> Cursor<'a> {
        let ctx = ExecutionContext::capture().unwrap();
        let mut cursor = Cursor::new(space, ctx).unwrap();
        cursor.set_register(RegNum::FP, fp).unwrap();
        cursor
    }

    #[test]
    fn test_walks_a_synthetic_chain_innermost_first() {
        let stack = FakeStack::chain(3);
        let space = unvalidated_space();
        let mut cursor = cursor_over(&space, stack.innermost_fp());
        let mut stepper = FramePointerStepper;

        let mut seen = Vec::new();
        loop {
            match stepper.step(&mut cursor).unwrap() {
                Step::Progressed => seen.push(cursor.ip()),
                Step::EndOfStack => break,
            }
        }

        let expected: Vec<Addr> = (0..3)
            .map(|frame| Addr::from(FakeStack::RETURN_BASE + frame as Word))
            .collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_zero_frame_pointer_ends_the_walk_immediately() {
        let space = unvalidated_space();
        let mut cursor = cursor_over(&space, 0);
        assert_eq!(
            FramePointerStepper.step(&mut cursor).unwrap(),
            Step::EndOfStack
        );
    }

    #[test]
    fn test_backward_pointing_chain_is_a_cycle_error() {
        let mut stack = FakeStack::chain(2);
        // make the second record point back at the first
        let first = stack.words.as_ptr() as Word;
        stack.words[2] = first;

        let space = unvalidated_space();
        let mut cursor = cursor_over(&space, stack.innermost_fp());
        let mut stepper = FramePointerStepper;
        assert_eq!(stepper.step(&mut cursor).unwrap(), Step::Progressed);
        assert!(matches!(
            stepper.step(&mut cursor),
            Err(UnwindError::FrameChainCycle(_))
        ));
    }

    #[test]
    fn test_return_into_non_executable_memory_is_refused() {
        let stack = FakeStack::chain(2);
        let space = AddressSpace::new(
            Box::new(LocalAccessors),
            CachingPolicy::None,
            ValidateMemoryAccess::Enabled,
            Pid::this(),
        );
        // the map knows the fake stack but marks no executable region, so
        // every return address is corrupt by definition
        space
            .attach_map(ProcessMemoryMap::from_regions(stack.region(false)))
            .unwrap();

        let mut cursor = cursor_over(&space, stack.innermost_fp());
        assert!(matches!(
            FramePointerStepper.step(&mut cursor),
            Err(UnwindError::NonExecutableReturn(_))
        ));
    }

    #[test]
    fn test_validated_walk_succeeds_with_executable_returns() {
        let stack = FakeStack::chain(2);
        let space = AddressSpace::new(
            Box::new(LocalAccessors),
            CachingPolicy::None,
            ValidateMemoryAccess::Enabled,
            Pid::this(),
        );
        space
            .attach_map(ProcessMemoryMap::from_regions(stack.region(true)))
            .unwrap();

        let mut cursor = cursor_over(&space, stack.innermost_fp());
        let mut stepper = FramePointerStepper;
        assert_eq!(stepper.step(&mut cursor).unwrap(), Step::Progressed);
        assert_eq!(stepper.step(&mut cursor).unwrap(), Step::Progressed);
        assert_eq!(stepper.step(&mut cursor).unwrap(), Step::EndOfStack);
    }
}
