//! # Memory Map Module
//!
//! Process-scoped tables of mapped-region permissions.
//!
//! A [`ProcessMemoryMap`] records which regions of a process's virtual
//! address space are mapped and with which permissions. The unwinder uses it
//! to gate raw memory access: before dereferencing an address pulled out of a
//! possibly corrupted stack, the accessor checks that the address falls into
//! a known-permitted region, so a bogus frame chain produces an error instead
//! of a fault.
//!
//! For the querying process itself the map is extracted from
//! `/proc/self/maps` through the [`proc_maps`] crate, built exactly once
//! under a lock, and shared for the remaining lifetime of the process. It is
//! deliberately never refreshed: a process that remaps memory after the first
//! walk sees stale permissions, which is an accepted trade-off.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use nix::unistd::Pid;
use serde::Serialize;
use tracing::debug;

use crate::addr::Addr;
use crate::errors::Result;

/// A single region in a process's memory map.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryRegion {
    /// Starting address of the region
    pub start_address: Addr,
    /// End address of the region (exclusive)
    pub end_address: Addr,
    /// Access permissions of the region
    pub permissions: MemoryPermissions,
    /// Offset within the mapped file, if any
    pub offset: usize,
    /// Path of the mapped file, if any
    pub path: Option<String>,
}

impl MemoryRegion {
    pub fn contains(&self, addr: Addr) -> bool {
        self.start_address <= addr && addr < self.end_address
    }
}

/// Access permissions of one memory region.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryPermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

/// The mapped regions of one process, ordered by start address.
///
/// Built once per process identity and read without locking thereafter.
///
/// # Examples
///
/// ```
/// use framewalk::memorymap::{MemoryPermissions, MemoryRegion, ProcessMemoryMap};
/// use framewalk::Addr;
///
/// let map = ProcessMemoryMap::from_regions(vec![MemoryRegion {
///     start_address: Addr::from(0x7f00_0000usize),
///     end_address: Addr::from(0x7f00_1000usize),
///     permissions: MemoryPermissions {
///         read: true,
///         write: false,
///         execute: true,
///     },
///     offset: 0,
///     path: Some("/lib/libc.so.6".to_string()),
/// }]);
///
/// assert!(map.is_readable(Addr::from(0x7f00_0800usize)));
/// assert!(!map.is_writable(Addr::from(0x7f00_0800usize)));
/// assert!(!map.is_readable(Addr::from(0x7f00_1000usize)));
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ProcessMemoryMap {
    regions: Vec<MemoryRegion>,
}

static SELF_MAP: OnceLock<ProcessMemoryMap> = OnceLock::new();
static SELF_MAP_LOCK: Mutex<()> = Mutex::new(());
pub(crate) static SELF_MAP_BUILDS: AtomicUsize = AtomicUsize::new(0);

impl ProcessMemoryMap {
    /// Builds the map for a process by parsing its OS-exposed region table.
    ///
    /// # Errors
    ///
    /// Fails if the region table of `pid` cannot be read, for example because
    /// the process does not exist or access is denied.
    pub fn build(pid: Pid) -> Result<Self> {
        let ranges = proc_maps::get_process_maps(pid.as_raw())?;
        let map = Self::from(ranges);
        debug!("built memory map of process {pid}: {} regions", map.regions.len());
        Ok(map)
    }

    /// Builds a map from an explicit region list, for snapshot targets that
    /// carry their own region table.
    pub fn from_regions(mut regions: Vec<MemoryRegion>) -> Self {
        regions.sort_by_key(|r| r.start_address);
        Self { regions }
    }

    /// The process-wide shared map of the querying process itself.
    ///
    /// The first call builds the map under a lock; racing initializers never
    /// construct duplicates. All later calls return the same instance for the
    /// life of the process, even if the process remaps memory in the
    /// meantime.
    ///
    /// # Errors
    ///
    /// Fails if `/proc/self/maps` cannot be read.
    pub fn shared_self() -> Result<&'static ProcessMemoryMap> {
        if let Some(map) = SELF_MAP.get() {
            return Ok(map);
        }

        let _guard = SELF_MAP_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(map) = SELF_MAP.get() {
            return Ok(map);
        }
        let map = Self::build(Pid::this())?;
        SELF_MAP_BUILDS.fetch_add(1, Ordering::Relaxed);
        Ok(SELF_MAP.get_or_init(|| map))
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// The region containing `addr`, if any.
    pub fn region_containing(&self, addr: Addr) -> Option<&MemoryRegion> {
        let idx = self
            .regions
            .partition_point(|r| r.start_address <= addr)
            .checked_sub(1)?;
        let region = &self.regions[idx];
        region.contains(addr).then_some(region)
    }

    pub fn is_readable(&self, addr: Addr) -> bool {
        self.region_containing(addr)
            .is_some_and(|r| r.permissions.read)
    }

    pub fn is_writable(&self, addr: Addr) -> bool {
        self.region_containing(addr)
            .is_some_and(|r| r.permissions.write)
    }

    pub fn is_executable(&self, addr: Addr) -> bool {
        self.region_containing(addr)
            .is_some_and(|r| r.permissions.execute)
    }
}

impl From<Vec<proc_maps::MapRange>> for ProcessMemoryMap {
    fn from(ranges: Vec<proc_maps::MapRange>) -> Self {
        let regions = ranges
            .iter()
            .map(|range| MemoryRegion {
                start_address: Addr::from(range.start()),
                end_address: Addr::from(range.start() + range.size()),
                permissions: MemoryPermissions {
                    read: range.is_read(),
                    write: range.is_write(),
                    execute: range.is_exec(),
                },
                offset: range.offset,
                path: range.filename().map(|p| p.to_string_lossy().to_string()),
            })
            .collect();

        Self::from_regions(regions)
    }
}

impl Display for ProcessMemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for region in &self.regions {
            writeln!(
                f,
                "{:016x}-{:016x} {}{}{} {}",
                region.start_address.usize(),
                region.end_address.usize(),
                if region.permissions.read { "r" } else { "-" },
                if region.permissions.write { "w" } else { "-" },
                if region.permissions.execute { "x" } else { "-" },
                region.path.as_deref().unwrap_or("[anonymous]")
            )?;
        }
        Ok(())
    }
}
