//! # Address Space Module
//!
//! The descriptor of one unwindable target.
//!
//! An [`AddressSpace`] bundles an accessor capability set with the policies
//! that govern it: whether raw memory access is validated against the
//! target's memory map, and whether procedure metadata is cached globally,
//! per thread, or not at all. One instance exists per unwind target;
//! [`AddressSpace::local`] is the lazily initialized, never-torn-down
//! process-wide instance for the querying process itself.
//!
//! Both the singleton and its memory map follow an initialize-once-under-lock
//! discipline: after construction completes, accessor calls take no lock, so
//! concurrent walks from independent threads proceed without contention.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError, RwLock};

use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, warn};

use crate::accessors::{Accessors, LocalAccessors, ProcInfo, ProcName};
use crate::addr::Addr;
use crate::arch::RegNum;
use crate::context::ExecutionContext;
use crate::errors::{Result, UnwindError};
use crate::memorymap::ProcessMemoryMap;
use crate::{FpWord, Word};

/// How procedure metadata found by the accessors is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CachingPolicy {
    /// Every lookup goes to the accessors.
    None,
    /// One process-wide cache shared by all threads.
    Global,
    /// One cache per thread, no cross-thread sharing.
    PerThread,
}

/// Whether raw memory access is validated against the target's memory map.
///
/// An explicit construction-time strategy rather than a build-time branch:
/// platforms without an enumerable memory map run `Disabled` and accept that
/// a genuinely invalid address faults, while `Enabled` turns the same access
/// into an error. Either policy can be exercised on any host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValidateMemoryAccess {
    Enabled,
    Disabled,
}

static LOCAL_SPACE: OnceLock<AddressSpace> = OnceLock::new();
static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static PER_THREAD_PROC_CACHE: RefCell<HashMap<(u64, Addr), ProcInfo>> =
        RefCell::new(HashMap::new());
}

/// The descriptor of one unwind target.
pub struct AddressSpace {
    accessors: Box<dyn Accessors>,
    caching: CachingPolicy,
    validation: ValidateMemoryAccess,
    pid: Pid,
    id: u64,
    owned_map: OnceLock<ProcessMemoryMap>,
    map_lock: Mutex<()>,
    map_builds: AtomicUsize,
    global_proc_cache: RwLock<HashMap<Addr, ProcInfo>>,
}

impl AddressSpace {
    /// Creates an address space over an explicit capability set.
    ///
    /// `pid` names the process identity whose memory map gates raw access
    /// when `validation` is [`ValidateMemoryAccess::Enabled`]. The capability
    /// set is immutable from here on.
    pub fn new(
        accessors: Box<dyn Accessors>,
        caching: CachingPolicy,
        validation: ValidateMemoryAccess,
        pid: Pid,
    ) -> Self {
        Self {
            accessors,
            caching,
            validation,
            pid,
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            owned_map: OnceLock::new(),
            map_lock: Mutex::new(()),
            map_builds: AtomicUsize::new(0),
            global_proc_cache: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide address space of the querying process.
    ///
    /// Initialized on first use; racing threads observe a single winner and
    /// everyone gets the same instance. The instance lives for the rest of
    /// the process; there is no teardown.
    ///
    /// Mapping-based validation is wired in only on platforms exposing a
    /// per-process region table; elsewhere raw access stays best-effort.
    pub fn local() -> &'static AddressSpace {
        LOCAL_SPACE.get_or_init(|| {
            let validation = if cfg!(target_os = "linux") {
                ValidateMemoryAccess::Enabled
            } else {
                ValidateMemoryAccess::Disabled
            };
            debug!("initializing local address space, validation {validation:?}");
            AddressSpace::new(
                Box::new(LocalAccessors),
                CachingPolicy::Global,
                validation,
                Pid::this(),
            )
        })
    }

    pub fn caching(&self) -> CachingPolicy {
        self.caching
    }

    pub fn validation(&self) -> ValidateMemoryAccess {
        self.validation
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Attaches a prebuilt memory map, for snapshot targets that carry their
    /// own region table instead of a live `/proc` entry.
    ///
    /// # Errors
    ///
    /// Fails if a map is already attached or already lazily built.
    pub fn attach_map(&self, map: ProcessMemoryMap) -> Result<()> {
        self.owned_map
            .set(map)
            .map_err(|_| UnwindError::MapAlreadyAttached)
    }

    /// The memory map of the target, built lazily on first use.
    ///
    /// For the querying process itself this is the process-wide shared map;
    /// for other targets the map is built once per address space under a
    /// lock. The map is never invalidated by later remapping.
    ///
    /// # Errors
    ///
    /// Fails if the target's region table cannot be read.
    pub fn map(&self) -> Result<&ProcessMemoryMap> {
        if let Some(map) = self.owned_map.get() {
            return Ok(map);
        }
        if self.pid == Pid::this() {
            return ProcessMemoryMap::shared_self();
        }

        let _guard = self.map_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(map) = self.owned_map.get() {
            return Ok(map);
        }
        let map = ProcessMemoryMap::build(self.pid)?;
        self.map_builds.fetch_add(1, Ordering::Relaxed);
        Ok(self.owned_map.get_or_init(|| map))
    }

    /// How many times this address space built its own map. At most one
    /// regardless of contention.
    pub fn map_builds(&self) -> usize {
        self.map_builds.load(Ordering::Relaxed)
    }

    /// Reads or writes one word of target memory, gated by the memory map
    /// when validation is enabled.
    ///
    /// # Errors
    ///
    /// With validation enabled, an address outside a permitted region is
    /// refused with [`UnwindError::UnreadableMemory`] or
    /// [`UnwindError::UnwritableMemory`] before any dereference happens.
    pub fn access_mem(&self, addr: Addr, value: &mut Word, write: bool) -> Result<()> {
        if self.validation == ValidateMemoryAccess::Enabled {
            let map = self.map()?;
            if write && !map.is_writable(addr) {
                warn!("refusing write to unwritable memory at {addr}");
                return Err(UnwindError::UnwritableMemory(addr));
            }
            if !write && !map.is_readable(addr) {
                warn!("refusing read of unreadable memory at {addr}");
                return Err(UnwindError::UnreadableMemory(addr));
            }
        }
        self.accessors.access_mem(addr, value, write)
    }

    /// Reads one word of target memory.
    pub fn read_word(&self, addr: Addr) -> Result<Word> {
        let mut value = 0;
        self.access_mem(addr, &mut value, false)?;
        Ok(value)
    }

    /// Writes one word of target memory.
    pub fn write_word(&self, addr: Addr, mut value: Word) -> Result<()> {
        self.access_mem(addr, &mut value, true)
    }

    /// Reads or writes one general-purpose register of a snapshot.
    pub fn access_reg(
        &self,
        ctx: &mut ExecutionContext,
        reg: RegNum,
        value: &mut Word,
        write: bool,
    ) -> Result<()> {
        self.accessors.access_reg(ctx, reg, value, write)
    }

    /// Reads or writes one floating-point register of a snapshot.
    pub fn access_fpreg(
        &self,
        ctx: &mut ExecutionContext,
        reg: RegNum,
        value: &mut FpWord,
        write: bool,
    ) -> Result<()> {
        self.accessors.access_fpreg(ctx, reg, value, write)
    }

    /// Locates unwind metadata for `ip`, consulting the cache configured by
    /// the caching policy first.
    ///
    /// # Errors
    ///
    /// Propagates the accessor error when no metadata covers `ip`.
    pub fn find_proc_info(&self, ip: Addr) -> Result<ProcInfo> {
        match self.caching {
            CachingPolicy::None => self.accessors.find_proc_info(ip),
            CachingPolicy::Global => {
                if let Some(info) = self
                    .global_proc_cache
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&ip)
                {
                    return Ok(*info);
                }
                let info = self.accessors.find_proc_info(ip)?;
                self.global_proc_cache
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(ip, info);
                Ok(info)
            }
            CachingPolicy::PerThread => {
                let key = (self.id, ip);
                if let Some(info) =
                    PER_THREAD_PROC_CACHE.with(|cache| cache.borrow().get(&key).copied())
                {
                    return Ok(info);
                }
                let info = self.accessors.find_proc_info(ip)?;
                PER_THREAD_PROC_CACHE.with(|cache| cache.borrow_mut().insert(key, info));
                Ok(info)
            }
        }
    }

    /// Releases metadata returned by [`find_proc_info`](Self::find_proc_info).
    pub fn put_proc_info(&self, info: ProcInfo) {
        self.accessors.put_proc_info(info);
    }

    /// Drops all cached procedure metadata.
    ///
    /// Under [`CachingPolicy::PerThread`] only the calling thread's cache can
    /// be reached; other threads keep their entries until they flush
    /// themselves.
    pub fn flush_cache(&self) {
        self.global_proc_cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let id = self.id;
        PER_THREAD_PROC_CACHE.with(|cache| {
            cache.borrow_mut().retain(|(space, _), _| *space != id);
        });
    }

    /// The address of the target's registry of runtime-generated unwind
    /// metadata. A fixed process-local value; cross-process discovery is
    /// unsupported.
    ///
    /// # Errors
    ///
    /// Remote capability sets report
    /// [`UnwindError::RemoteDynInfoUnsupported`].
    pub fn dyn_info_list_addr(&self) -> Result<Addr> {
        self.accessors.dyn_info_list_addr()
    }

    /// Resolves `ip` against the querying process's own symbol tables.
    ///
    /// # Errors
    ///
    /// Fails when no mapping or symbol covers `ip`.
    pub fn resolve_name(&self, ip: Addr) -> Result<ProcName> {
        self.accessors.proc_name(ip)
    }

    /// Transfers control into the frame described by `ctx`. One-shot and
    /// terminal; see [`Accessors::resume`].
    ///
    /// # Errors
    ///
    /// Returns only on failure to restore the context.
    ///
    /// # Safety
    ///
    /// See [`Accessors::resume`].
    pub unsafe fn resume(&self, ctx: &mut ExecutionContext) -> Result<()> {
        self.accessors.resume(ctx)
    }
}

impl std::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pid", &self.pid)
            .field("caching", &self.caching)
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}
