//! Registry of unwind metadata for code generated at runtime.
//!
//! Just-in-time compilers register the address ranges of their generated code
//! here so a walk can resolve frames that no static binary table covers. The
//! registry is a process-local list with a fixed address; only the process
//! itself can discover it. True cross-process discovery is unsupported, and a
//! remote accessor implementation is expected to report
//! [`UnwindError::RemoteDynInfoUnsupported`](crate::UnwindError::RemoteDynInfoUnsupported)
//! instead of guessing an address.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use tracing::debug;

use crate::accessors::ProcInfo;
use crate::addr::Addr;

/// One registered range of runtime-generated code.
#[derive(Debug, Clone, Serialize)]
pub struct DynInfo {
    /// First instruction covered by the entry
    pub start_ip: Addr,
    /// One past the last instruction covered by the entry
    pub end_ip: Addr,
    /// Human-readable name of the generated region, if the producer has one
    pub name: Option<String>,
}

/// Handle returned by [`register`], used to remove the entry again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "dropping the handle leaks the registration"]
pub struct DynInfoHandle(u64);

struct Registry {
    entries: RwLock<Vec<(u64, DynInfo)>>,
    next_id: AtomicU64,
}

static DYN_INFO_LIST: Registry = Registry {
    entries: RwLock::new(Vec::new()),
    next_id: AtomicU64::new(1),
};

/// Registers unwind metadata for a freshly generated code range.
pub fn register(info: DynInfo) -> DynInfoHandle {
    let id = DYN_INFO_LIST.next_id.fetch_add(1, Ordering::Relaxed);
    debug!(
        "registering dynamic unwind info {}..{}",
        info.start_ip, info.end_ip
    );
    DYN_INFO_LIST
        .entries
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .push((id, info));
    DynInfoHandle(id)
}

/// Removes a previously registered entry. Unknown handles are ignored.
pub fn cancel(handle: DynInfoHandle) {
    DYN_INFO_LIST
        .entries
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|(id, _)| *id != handle.0);
}

/// The fixed process-local address of the registry head.
pub(crate) fn list_head_addr() -> Addr {
    Addr::from(&DYN_INFO_LIST as *const Registry as usize)
}

pub(crate) fn lookup(ip: Addr) -> Option<ProcInfo> {
    DYN_INFO_LIST
        .entries
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .find(|(_, info)| info.start_ip <= ip && ip < info.end_ip)
        .map(|(_, info)| ProcInfo {
            start_ip: info.start_ip,
            end_ip: info.end_ip,
        })
}

pub(crate) fn lookup_name(ip: Addr) -> Option<(String, u64)> {
    DYN_INFO_LIST
        .entries
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .find(|(_, info)| info.start_ip <= ip && ip < info.end_ip)
        .and_then(|(_, info)| {
            let name = info.name.clone()?;
            Some((name, (ip - info.start_ip).u64()))
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_register_lookup_cancel() {
        let handle = register(DynInfo {
            start_ip: Addr::from(0x7000_0000usize),
            end_ip: Addr::from(0x7000_1000usize),
            name: Some("jit_block_17".to_string()),
        });

        let info = lookup(Addr::from(0x7000_0800usize)).expect("registered range not found");
        assert_eq!(info.start_ip, Addr::from(0x7000_0000usize));

        let (name, offset) = lookup_name(Addr::from(0x7000_0800usize)).unwrap();
        assert_eq!(name, "jit_block_17");
        assert_eq!(offset, 0x800);

        cancel(handle);
        assert!(lookup(Addr::from(0x7000_0800usize)).is_none());
    }

    #[test]
    fn test_list_head_is_a_fixed_process_local_address() {
        assert_eq!(list_head_addr(), list_head_addr());
        assert!(!list_head_addr().is_null());
    }

    #[test]
    fn test_lookup_misses_outside_registered_ranges() {
        let handle = register(DynInfo {
            start_ip: Addr::from(0x7100_0000usize),
            end_ip: Addr::from(0x7100_1000usize),
            name: None,
        });
        assert!(lookup(Addr::from(0x7100_1000usize)).is_none());
        cancel(handle);
    }
}
