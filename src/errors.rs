use thiserror::Error;

use crate::addr::Addr;
use crate::arch::RegNum;

#[derive(Error, Debug)]
pub enum UnwindError {
    #[error("Os error: {0}")]
    Os(#[from] nix::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not parse object file: {0}")]
    Object(#[from] object::Error),
    #[error("Bad register number: {0}")]
    BadRegister(RegNum),
    #[error("Refusing read of unmapped or unreadable address: {0}")]
    UnreadableMemory(Addr),
    #[error("Refusing write to unmapped or unwritable address: {0}")]
    UnwritableMemory(Addr),
    #[error("No unwind information covers address: {0}")]
    NoUnwindInfo(Addr),
    #[error("No symbol found for address: {0}")]
    NoSymbolFound(Addr),
    #[error("Return address {0} does not point into executable memory")]
    NonExecutableReturn(Addr),
    #[error("Frame chain makes no progress at frame pointer {0}")]
    FrameChainCycle(Addr),
    #[error("Captured context has no usable instruction pointer")]
    InvalidContext,
    #[error("A memory map is already attached to this address space")]
    MapAlreadyAttached,
    #[error("Dynamic unwind info registration is only discoverable in-process")]
    RemoteDynInfoUnsupported,
    #[error("Could not capture a context or construct a cursor")]
    InitFailure,
    #[error("Stack walk failed before reaching the outermost frame")]
    StepFailure,
}

pub type Result<T> = std::result::Result<T, UnwindError>;
