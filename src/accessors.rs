//! # Accessor Capability Module
//!
//! The per-architecture/OS capability set behind an address space.
//!
//! Every unwind target is reached exclusively through the eight operations of
//! the [`Accessors`] trait: word-sized memory access, general and floating
//! register access, unwind-metadata lookup and release, dynamic-info-list
//! discovery, resume, and procedure-name lookup. The driver and the stepping
//! primitive depend only on this interface; porting to a new target means
//! supplying one new implementation at address-space construction time and
//! nothing else.
//!
//! [`LocalAccessors`] is the concrete implementation for the querying process
//! itself: registers come out of the captured snapshot, memory is read in
//! place, and metadata comes from the process's own symbol tables and its
//! dynamic-info registry.

use nix::errno::Errno;
use nix::libc;
use tracing::{trace, warn};

use serde::Serialize;

use crate::addr::Addr;
use crate::arch::{self, RegNum};
use crate::context::ExecutionContext;
use crate::errors::{Result, UnwindError};
use crate::memorymap::ProcessMemoryMap;
use crate::{dyninfo, symbols, FpWord, Word};

/// Bounds of the procedure containing an instruction pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcInfo {
    /// First instruction of the procedure
    pub start_ip: Addr,
    /// One past the last instruction, or equal to `start_ip` when unknown
    pub end_ip: Addr,
}

impl ProcInfo {
    pub fn contains(&self, ip: Addr) -> bool {
        self.start_ip <= ip && ip < self.end_ip
    }
}

/// The name of the procedure containing an instruction pointer.
#[derive(Debug, Clone, Serialize)]
pub struct ProcName {
    /// Raw (possibly mangled) symbol name
    pub name: String,
    /// Offset of the instruction pointer from the start of the procedure
    pub offset: u64,
}

impl ProcName {
    /// The name with compiler mangling stripped.
    pub fn demangled(&self) -> String {
        format!("{:#}", rustc_demangle::demangle(&self.name))
    }
}

/// The capability set of one unwind target.
///
/// Implementations are immutable once built; an address space calls them
/// concurrently from independent walks without further synchronization.
pub trait Accessors: Send + Sync {
    /// Locates unwind metadata for the procedure containing `ip`.
    fn find_proc_info(&self, ip: Addr) -> Result<ProcInfo>;

    /// Releases whatever `find_proc_info` allocated for one query. A no-op
    /// where the underlying metadata provider allocates nothing.
    fn put_proc_info(&self, info: ProcInfo);

    /// The address of the target's registry of runtime-generated unwind
    /// metadata.
    ///
    /// # Errors
    ///
    /// Remote targets cannot discover the registry and must report
    /// [`UnwindError::RemoteDynInfoUnsupported`].
    fn dyn_info_list_addr(&self) -> Result<Addr>;

    /// Reads or writes one word of target memory.
    fn access_mem(&self, addr: Addr, value: &mut Word, write: bool) -> Result<()>;

    /// Reads or writes one general-purpose register of the snapshot.
    ///
    /// Numbers outside the general-purpose bank are rejected with
    /// [`UnwindError::BadRegister`]; no out-of-bounds slot is ever touched.
    fn access_reg(
        &self,
        ctx: &mut ExecutionContext,
        reg: RegNum,
        value: &mut Word,
        write: bool,
    ) -> Result<()>;

    /// Reads or writes one floating-point register of the snapshot.
    ///
    /// Numbers outside the floating bank are rejected with
    /// [`UnwindError::BadRegister`].
    fn access_fpreg(
        &self,
        ctx: &mut ExecutionContext,
        reg: RegNum,
        value: &mut FpWord,
        write: bool,
    ) -> Result<()>;

    /// Transfers control into the frame described by `ctx`.
    ///
    /// One-shot and terminal: on success this does not return and the cursor
    /// that produced `ctx` must never be stepped again.
    ///
    /// # Safety
    ///
    /// The context must describe a frame of the current thread whose stack
    /// is still live. Resuming into anything else abandons the stack in an
    /// undefined state.
    unsafe fn resume(&self, ctx: &mut ExecutionContext) -> Result<()>;

    /// Resolves `ip` to a procedure name and offset.
    fn proc_name(&self, ip: Addr) -> Result<ProcName>;
}

/// Accessors for the querying process's own address space.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAccessors;

impl Accessors for LocalAccessors {
    fn find_proc_info(&self, ip: Addr) -> Result<ProcInfo> {
        if let Some(info) = dyninfo::lookup(ip) {
            return Ok(info);
        }
        symbols::proc_bounds(ProcessMemoryMap::shared_self()?, ip)
    }

    fn put_proc_info(&self, _info: ProcInfo) {
        // static tables and the dyn-info registry allocate nothing per query
    }

    fn dyn_info_list_addr(&self) -> Result<Addr> {
        Ok(dyninfo::list_head_addr())
    }

    fn access_mem(&self, addr: Addr, value: &mut Word, write: bool) -> Result<()> {
        if write {
            trace!("mem[{addr}] <- {:#018x}", *value);
            // SAFETY: the caller (or the address space gating this call) is
            // responsible for `addr` pointing at mapped memory; unaligned
            // word access is tolerated.
            unsafe { std::ptr::write_unaligned(addr.raw_pointer().cast::<Word>(), *value) };
        } else {
            // SAFETY: as above.
            *value = unsafe { std::ptr::read_unaligned(addr.raw_pointer().cast::<Word>()) };
            trace!("mem[{addr}] -> {:#018x}", *value);
        }
        Ok(())
    }

    fn access_reg(
        &self,
        ctx: &mut ExecutionContext,
        reg: RegNum,
        value: &mut Word,
        write: bool,
    ) -> Result<()> {
        let Some(slot) = arch::gp_slot(reg.0) else {
            warn!("bad register number {reg}");
            return Err(UnwindError::BadRegister(reg));
        };

        if write {
            trace!("{reg} <- {:#018x}", *value);
            ctx.write_gp(slot, *value);
        } else {
            *value = ctx.read_gp(slot);
            trace!("{reg} -> {:#018x}", *value);
        }
        Ok(())
    }

    fn access_fpreg(
        &self,
        ctx: &mut ExecutionContext,
        reg: RegNum,
        value: &mut FpWord,
        write: bool,
    ) -> Result<()> {
        let Some(slot) = arch::fp_slot(reg.0) else {
            warn!("bad register number {reg}");
            return Err(UnwindError::BadRegister(reg));
        };

        if write {
            trace!("{reg} <- {:#034x}", value.0);
            ctx.write_fp(slot, *value);
        } else {
            *value = ctx.read_fp(slot);
            trace!("{reg} -> {:#034x}", value.0);
        }
        Ok(())
    }

    unsafe fn resume(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.sync_raw_for_resume();
        // setcontext does not return on success
        libc::setcontext(ctx.raw_ptr());
        Err(UnwindError::Os(Errno::last()))
    }

    fn proc_name(&self, ip: Addr) -> Result<ProcName> {
        if let Some((name, offset)) = dyninfo::lookup_name(ip) {
            return Ok(ProcName { name, offset });
        }
        symbols::resolve_name(ProcessMemoryMap::shared_self()?, ip)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::GP_BANK;

    #[test]
    fn test_gp_registers_roundtrip_across_the_whole_bank() {
        let mut ctx = ExecutionContext::capture().unwrap();
        let acc = LocalAccessors;

        for reg in 0..GP_BANK as u16 {
            let mut value: Word = 0x1000 + Word::from(reg);
            acc.access_reg(&mut ctx, RegNum(reg), &mut value, true)
                .unwrap();
        }
        for reg in 0..GP_BANK as u16 {
            let mut value: Word = 0;
            acc.access_reg(&mut ctx, RegNum(reg), &mut value, false)
                .unwrap();
            assert_eq!(value, 0x1000 + Word::from(reg));
        }
    }

    #[test]
    fn test_out_of_bank_numbers_are_bad_registers() {
        let mut ctx = ExecutionContext::capture().unwrap();
        let acc = LocalAccessors;

        // a floating number presented to the general accessor
        let fp_number = RegNum(GP_BANK as u16);
        let mut word: Word = 0;
        assert!(matches!(
            acc.access_reg(&mut ctx, fp_number, &mut word, false),
            Err(UnwindError::BadRegister(_))
        ));

        // a general number presented to the floating accessor
        let mut fpword = FpWord(0);
        assert!(matches!(
            acc.access_fpreg(&mut ctx, RegNum(0), &mut fpword, false),
            Err(UnwindError::BadRegister(_))
        ));

        // a number beyond both banks, in both accessors
        let beyond = RegNum(4096);
        assert!(matches!(
            acc.access_reg(&mut ctx, beyond, &mut word, true),
            Err(UnwindError::BadRegister(_))
        ));
        assert!(matches!(
            acc.access_fpreg(&mut ctx, beyond, &mut fpword, true),
            Err(UnwindError::BadRegister(_))
        ));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_fp_registers_roundtrip() {
        let mut ctx = ExecutionContext::capture().unwrap();
        let acc = LocalAccessors;

        let xmm0 = RegNum(GP_BANK as u16);
        let mut value = FpWord(0xdead_beef_dead_beef_0123_4567_89ab_cdef);
        acc.access_fpreg(&mut ctx, xmm0, &mut value, true).unwrap();

        let mut back = FpWord(0);
        acc.access_fpreg(&mut ctx, xmm0, &mut back, false).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_access_mem_roundtrip_on_own_memory() {
        let acc = LocalAccessors;
        let mut slot: Word = 0;
        let addr = Addr::from(std::hint::black_box(std::ptr::addr_of_mut!(slot)) as usize);

        let mut value: Word = 0x4242_4242_4242_4242;
        acc.access_mem(addr, &mut value, true).unwrap();

        let mut read_back: Word = 0;
        acc.access_mem(addr, &mut read_back, false).unwrap();
        assert_eq!(read_back, 0x4242_4242_4242_4242);
        assert_eq!(std::hint::black_box(slot), 0x4242_4242_4242_4242);
    }

    #[test]
    fn test_local_dyn_info_list_is_discoverable() {
        assert!(!LocalAccessors.dyn_info_list_addr().unwrap().is_null());
    }
}
