//! # Backtrace Driver Module
//!
//! The state machine that turns cursor steps into a delivered backtrace.
//!
//! A walk moves `Init -> Stepping -> {EndOfStack, FatalError}`. Context
//! capture or cursor construction failing before any frame is produced is
//! reported as [`FatalKind::Init`], distinct from a mid-walk
//! [`FatalKind::Step`], so callers can tell "never started" from "started
//! then broke". Each successfully stepped frame is handed to the caller's
//! callback exactly once, innermost frame first, synchronously on the calling
//! thread; any verdict other than [`FrameAction::Continue`] is a hard abort.
//!
//! The driver never retries a failed step and never skips a frame to
//! recover: a broken chain cannot self-heal. It also imposes no bound of its
//! own on the number of steps; a corrupted frame chain that keeps reporting
//! progress without its stepper noticing will keep the walk running.

use serde::Serialize;
use tracing::debug;

use crate::addr::Addr;
use crate::addrspace::AddressSpace;
use crate::context::ExecutionContext;
use crate::cursor::{Cursor, Step, Stepper};
use crate::errors::{Result, UnwindError};
use crate::stepper::FramePointerStepper;

/// What the walk is doing, and finally how it ended.
///
/// The four-valued completion protocol shared with exception-handling
/// runtimes: a finished walk reports one of the three terminal values, and
/// only [`BacktraceOutcome::EndOfStack`] means the whole stack was seen.
/// [`BacktraceOutcome::Continue`] is the in-flight state and never the result
/// of a completed walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BacktraceOutcome {
    /// The walk is still in progress.
    Continue,
    /// Every frame was stepped and delivered.
    EndOfStack,
    /// The walk terminated early.
    FatalError(FatalKind),
}

/// Which phase of a walk failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FatalKind {
    /// Context capture or cursor construction failed; no frame was produced.
    Init,
    /// A step failed or the callback aborted after the walk had started.
    Step,
}

/// A callback's verdict on the frame it was just shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    /// Keep walking.
    Continue,
    /// Abort the walk; surfaced as a fatal step error.
    Abort,
}

/// Drives a stepper over an address space.
#[derive(Debug)]
pub struct BacktraceDriver<'a, S> {
    space: &'a AddressSpace,
    stepper: S,
}

impl<'a, S: Stepper> BacktraceDriver<'a, S> {
    pub fn new(space: &'a AddressSpace, stepper: S) -> Self {
        Self { space, stepper }
    }

    /// Walks the stack described by `ctx`, invoking `callback` once per
    /// stepped frame, and returns the terminal outcome.
    pub fn walk<F>(&mut self, ctx: ExecutionContext, mut callback: F) -> BacktraceOutcome
    where
        F: FnMut(&mut Cursor<'_>) -> FrameAction,
    {
        let mut cursor = match Cursor::new(self.space, ctx) {
            Ok(cursor) => cursor,
            Err(e) => {
                debug!("cursor construction failed: {e}");
                return BacktraceOutcome::FatalError(FatalKind::Init);
            }
        };

        let mut outcome = BacktraceOutcome::Continue;
        while outcome == BacktraceOutcome::Continue {
            match self.stepper.step(&mut cursor) {
                Ok(Step::Progressed) => {
                    cursor.bump_depth();
                    if callback(&mut cursor) != FrameAction::Continue {
                        outcome = BacktraceOutcome::FatalError(FatalKind::Step);
                    }
                }
                Ok(Step::EndOfStack) => outcome = BacktraceOutcome::EndOfStack,
                Err(e) => {
                    debug!("step failed after {} frames: {e}", cursor.depth());
                    outcome = BacktraceOutcome::FatalError(FatalKind::Step);
                }
            }
        }
        outcome
    }
}

/// Walks the calling thread's own stack.
///
/// Captures the thread's registers, builds a cursor over the process-local
/// address space, and steps it with the built-in frame-pointer stepper. The
/// callback sees one frame per invocation, innermost first, starting at the
/// caller of `trace`.
///
/// # Examples
///
/// ```no_run
/// use framewalk::{trace, FrameAction};
///
/// let outcome = trace(|frame| {
///     println!("{}", frame.ip());
///     FrameAction::Continue
/// });
/// println!("walk finished: {outcome:?}");
/// ```
#[inline(never)]
pub fn trace<F>(callback: F) -> BacktraceOutcome
where
    F: FnMut(&mut Cursor<'_>) -> FrameAction,
{
    let ctx = match ExecutionContext::capture() {
        Ok(ctx) => ctx,
        Err(e) => {
            debug!("context capture failed: {e}");
            return BacktraceOutcome::FatalError(FatalKind::Init);
        }
    };
    BacktraceDriver::new(AddressSpace::local(), FramePointerStepper).walk(ctx, callback)
}

/// One collected frame of a [`Backtrace`].
#[derive(Debug, Clone, Serialize)]
pub struct BacktraceFrame {
    /// Instruction pointer of the frame
    pub addr: Addr,
    /// Start of the containing procedure, when known
    pub start_addr: Option<Addr>,
    /// Demangled procedure name, when known
    pub name: Option<String>,
}

/// A fully collected walk of the calling thread's stack.
#[derive(Debug, Clone, Serialize)]
pub struct Backtrace {
    pub frames: Vec<BacktraceFrame>,
}

impl std::fmt::Display for Backtrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, frame) in self.frames.iter().enumerate() {
            writeln!(
                f,
                "#{idx}: {} {}",
                frame.addr,
                frame.name.as_deref().unwrap_or("????")
            )?;
        }
        Ok(())
    }
}

/// Collects the calling thread's backtrace with names resolved.
///
/// # Errors
///
/// Fails with [`UnwindError::InitFailure`] when the walk never started and
/// [`UnwindError::StepFailure`] when it broke mid-walk; frames delivered
/// before a mid-walk failure are discarded here, use [`trace`] directly to
/// keep them.
#[inline(never)]
pub fn capture_backtrace() -> Result<Backtrace> {
    let mut frames = Vec::new();
    let outcome = trace(|cursor| {
        let ip = cursor.ip();
        match (cursor.proc_info(), cursor.proc_name()) {
            (Ok(info), Ok(name)) => frames.push(BacktraceFrame {
                addr: ip,
                start_addr: Some(info.start_ip),
                name: Some(name.demangled()),
            }),
            _ => frames.push(BacktraceFrame {
                addr: ip,
                start_addr: None,
                name: None,
            }),
        }
        FrameAction::Continue
    });

    match outcome {
        BacktraceOutcome::EndOfStack => Ok(Backtrace { frames }),
        BacktraceOutcome::FatalError(FatalKind::Init) => Err(UnwindError::InitFailure),
        _ => Err(UnwindError::StepFailure),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::accessors::LocalAccessors;
    use crate::addrspace::{CachingPolicy, ValidateMemoryAccess};
    use crate::arch::RegNum;
    use crate::Word;
    use nix::unistd::Pid;

    /// A stepper that replays a scripted list of instruction pointers.
    struct ScriptedStepper {
        ips: Vec<Word>,
        pos: usize,
        fail_at: Option<usize>,
    }

    impl ScriptedStepper {
        fn frames(ips: Vec<Word>) -> Self {
            Self {
                ips,
                pos: 0,
                fail_at: None,
            }
        }

        fn failing_at(ips: Vec<Word>, fail_at: usize) -> Self {
            Self {
                ips,
                pos: 0,
                fail_at: Some(fail_at),
            }
        }
    }

    impl Stepper for ScriptedStepper {
        fn step(&mut self, cursor: &mut Cursor<'_>) -> Result<Step> {
            if self.fail_at == Some(self.pos) {
                return Err(UnwindError::NoUnwindInfo(cursor.ip()));
            }
            let Some(ip) = self.ips.get(self.pos) else {
                return Ok(Step::EndOfStack);
            };
            cursor.set_register(RegNum::IP, *ip)?;
            self.pos += 1;
            Ok(Step::Progressed)
        }
    }

    fn plain_space() -> AddressSpace {
        AddressSpace::new(
            Box::new(LocalAccessors),
            CachingPolicy::None,
            ValidateMemoryAccess::Disabled,
            Pid::this(),
        )
    }

    fn walk_scripted<F>(stepper: ScriptedStepper, callback: F) -> BacktraceOutcome
    where
        F: FnMut(&mut Cursor<'_>) -> FrameAction,
    {
        let space = plain_space();
        let ctx = ExecutionContext::capture().unwrap();
        BacktraceDriver::new(&space, stepper).walk(ctx, callback)
    }

    #[test]
    fn test_depth_n_chain_delivers_n_frames_innermost_first() {
        let ips: Vec<Word> = (1..=4).map(|n| 0x1000 * n).collect();
        let mut seen = Vec::new();

        let outcome = walk_scripted(ScriptedStepper::frames(ips.clone()), |cursor| {
            seen.push(Word::from(cursor.ip()));
            FrameAction::Continue
        });

        assert_eq!(outcome, BacktraceOutcome::EndOfStack);
        assert_eq!(seen, ips);
    }

    #[test]
    fn test_empty_chain_is_a_successful_walk_with_no_callbacks() {
        let mut invocations = 0;
        let outcome = walk_scripted(ScriptedStepper::frames(vec![]), |_| {
            invocations += 1;
            FrameAction::Continue
        });
        assert_eq!(outcome, BacktraceOutcome::EndOfStack);
        assert_eq!(invocations, 0);
    }

    #[test]
    fn test_abort_on_kth_frame_stops_after_k_invocations() {
        let ips: Vec<Word> = (1..=5).map(|n| 0x1000 * n).collect();
        let k = 3;
        let mut invocations = 0;

        let outcome = walk_scripted(ScriptedStepper::frames(ips), |_| {
            invocations += 1;
            if invocations == k {
                FrameAction::Abort
            } else {
                FrameAction::Continue
            }
        });

        assert_eq!(outcome, BacktraceOutcome::FatalError(FatalKind::Step));
        assert_eq!(invocations, k);
    }

    #[test]
    fn test_step_failure_is_fatal_with_no_further_frames() {
        let ips: Vec<Word> = (1..=5).map(|n| 0x1000 * n).collect();
        let mut invocations = 0;

        let outcome = walk_scripted(ScriptedStepper::failing_at(ips, 2), |_| {
            invocations += 1;
            FrameAction::Continue
        });

        assert_eq!(outcome, BacktraceOutcome::FatalError(FatalKind::Step));
        assert_eq!(invocations, 2);
    }

    #[test]
    fn test_failure_before_the_first_frame_invokes_nothing() {
        let mut invocations = 0;
        let outcome = walk_scripted(ScriptedStepper::failing_at(vec![0x1000], 0), |_| {
            invocations += 1;
            FrameAction::Continue
        });
        assert_eq!(outcome, BacktraceOutcome::FatalError(FatalKind::Step));
        assert_eq!(invocations, 0);
    }

    #[test]
    fn test_dead_context_fails_during_init() {
        let space = plain_space();
        let mut ctx = ExecutionContext::capture().unwrap();
        let mut zero = 0;
        space
            .access_reg(&mut ctx, RegNum::IP, &mut zero, true)
            .unwrap();

        let mut invocations = 0;
        let outcome =
            BacktraceDriver::new(&space, ScriptedStepper::frames(vec![0x1000])).walk(ctx, |_| {
                invocations += 1;
                FrameAction::Continue
            });

        assert_eq!(outcome, BacktraceOutcome::FatalError(FatalKind::Init));
        assert_eq!(invocations, 0);
    }

    #[test]
    fn test_outcomes_serialize_for_diagnostics() {
        let json = serde_json::to_string(&BacktraceOutcome::FatalError(FatalKind::Step)).unwrap();
        assert!(json.contains("Step"));
        assert_eq!(
            serde_json::to_string(&BacktraceOutcome::EndOfStack).unwrap(),
            "\"EndOfStack\""
        );
    }
}
