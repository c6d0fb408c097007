//! Thin symbol-table lookup for the querying process's own images.
//!
//! This is deliberately not a symbolizer: it maps an instruction pointer to
//! the nearest enclosing symbol of the file backing the containing mapping,
//! which is enough for procedure bounds and diagnostic names. Anything
//! richer (inlining, source lines) belongs to external tooling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use object::{Object, ObjectSegment, ObjectSymbol};
use tracing::trace;

use crate::accessors::{ProcInfo, ProcName};
use crate::addr::Addr;
use crate::errors::{Result, UnwindError};
use crate::memorymap::{MemoryRegion, ProcessMemoryMap};

static IMAGE_CACHE: OnceLock<Mutex<HashMap<String, Arc<[u8]>>>> = OnceLock::new();

fn image_bytes(path: &str) -> Result<Arc<[u8]>> {
    let cache = IMAGE_CACHE.get_or_init(Default::default);
    if let Some(bytes) = cache
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(path)
    {
        return Ok(Arc::clone(bytes));
    }

    let bytes: Arc<[u8]> = std::fs::read(path)?.into();
    cache
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(path.to_string(), Arc::clone(&bytes));
    Ok(bytes)
}

/// Runtime address where the file's virtual address 0 is loaded, derived
/// from the mapping offset and the segment table of the image.
fn load_bias(file: &object::File<'_>, region: &MemoryRegion) -> u64 {
    let mapping_offset = region.offset as u64;
    for segment in file.segments() {
        let (file_start, file_size) = segment.file_range();
        // mappings are page-aligned, segment file offsets need not be
        let page_start = file_start & !0xfff;
        if (page_start..file_start + file_size).contains(&mapping_offset) {
            let segment_runtime = region
                .start_address
                .u64()
                .wrapping_add(file_start)
                .wrapping_sub(mapping_offset);
            return segment_runtime.wrapping_sub(segment.address());
        }
    }
    region.start_address.u64().wrapping_sub(mapping_offset)
}

struct NearestSymbol {
    name: String,
    runtime_addr: u64,
    size: u64,
}

fn nearest_symbol(map: &ProcessMemoryMap, ip: Addr) -> Result<NearestSymbol> {
    let region = map
        .region_containing(ip)
        .filter(|r| r.permissions.execute)
        .ok_or(UnwindError::NoSymbolFound(ip))?;
    let path = region
        .path
        .as_deref()
        .filter(|p| !p.starts_with('['))
        .ok_or(UnwindError::NoSymbolFound(ip))?;

    let bytes = image_bytes(path)?;
    let file = object::File::parse(&*bytes)?;
    let bias = load_bias(&file, region);

    let mut best: Option<NearestSymbol> = None;
    for symbol in file.symbols().chain(file.dynamic_symbols()) {
        if symbol.kind() != object::SymbolKind::Text {
            continue;
        }
        let runtime_addr = symbol.address().wrapping_add(bias);
        if runtime_addr > ip.u64() {
            continue;
        }
        let size = symbol.size();
        if size > 0 && ip.u64() >= runtime_addr + size {
            continue;
        }
        if best
            .as_ref()
            .is_some_and(|b| b.runtime_addr >= runtime_addr)
        {
            continue;
        }
        let Ok(name) = symbol.name() else { continue };
        best = Some(NearestSymbol {
            name: name.to_string(),
            runtime_addr,
            size,
        });
    }

    trace!(
        "symbol lookup for {ip} in {path}: {}",
        best.as_ref().map_or("<none>", |b| b.name.as_str())
    );
    best.ok_or(UnwindError::NoSymbolFound(ip))
}

pub(crate) fn resolve_name(map: &ProcessMemoryMap, ip: Addr) -> Result<ProcName> {
    let symbol = nearest_symbol(map, ip)?;
    Ok(ProcName {
        name: symbol.name,
        offset: ip.u64() - symbol.runtime_addr,
    })
}

pub(crate) fn proc_bounds(map: &ProcessMemoryMap, ip: Addr) -> Result<ProcInfo> {
    let symbol = nearest_symbol(map, ip).map_err(|_| UnwindError::NoUnwindInfo(ip))?;
    Ok(ProcInfo {
        start_ip: Addr::from(symbol.runtime_addr),
        end_ip: Addr::from(symbol.runtime_addr + symbol.size),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[inline(never)]
    fn probe_function() -> u64 {
        std::hint::black_box(42)
    }

    #[test]
    fn test_resolve_own_function() {
        let map = ProcessMemoryMap::shared_self().expect("no self map");
        let ip = Addr::from(probe_function as usize);

        let name = resolve_name(map, ip).expect("own function not resolvable");
        assert!(!name.name.is_empty());
        assert_eq!(name.offset, 0);
    }

    #[test]
    fn test_unmapped_ip_has_no_symbol() {
        let map = ProcessMemoryMap::from_regions(vec![]);
        let err = resolve_name(&map, Addr::from(0x1000usize)).unwrap_err();
        assert!(matches!(err, UnwindError::NoSymbolFound(_)));
    }
}
