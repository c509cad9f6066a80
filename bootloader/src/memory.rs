//! Page-granular allocation and UEFI memory-map bookkeeping.
//!
//! Every bulk allocation the loader makes goes through [`allocate_pages`]
//! under a typed `MemoryType` tag, never through the general allocator —
//! the ambient-stack note in `SPEC_FULL.md` §3 on memory discipline.

use uefi::table::boot::{AllocateType, BootServices, MemoryMapIter, MemoryType};

use crate::error::BootError;

pub const BASE_PAGE_SIZE: usize = boot_shared::BASE_PAGE_SIZE;

/// Number of extra descriptors to plan for beyond the firmware's own
/// estimate: `GetMemoryMap` can grow the map between the size query and
/// the real call (new descriptors appear from the allocations the query
/// itself triggers), so padding is mandatory, not defensive over-caution.
const MEMORY_MAP_SLACK_DESCRIPTORS: usize = 32;

/// Allocate `pages` contiguous 4 KiB pages under `typ` and zero them.
///
/// The UEFI specification does not guarantee `AllocatePages` returns
/// zeroed memory, so every allocation is explicitly zeroed before use.
pub fn allocate_pages(bs: &BootServices, pages: usize, typ: MemoryType) -> Result<u64, BootError> {
    if pages == 0 {
        return Ok(0);
    }
    let base = bs
        .allocate_pages(AllocateType::AnyPages, typ, pages)
        .map_err(|_| BootError::ResourceExhausted("page allocation failed"))?;
    unsafe {
        bs.set_mem(base as *mut u8, pages * BASE_PAGE_SIZE, 0u8);
    }
    Ok(base)
}

/// Estimate the byte size the real memory map will need once captured,
/// padded per [`MEMORY_MAP_SLACK_DESCRIPTORS`] and rounded to a whole
/// number of pages.
pub fn estimate_memory_map_size(bs: &BootServices) -> usize {
    let estimate = bs.memory_map_size();
    let padded = estimate.map_size + MEMORY_MAP_SLACK_DESCRIPTORS * estimate.entry_size;
    boot_shared::round_up(padded, BASE_PAGE_SIZE)
}

/// Capture the final memory map into `buf`. Must be the very last firmware
/// call that is not itself `ExitBootServices` — no allocation may happen
/// between this call and the exit call, or the captured map is already
/// stale by the time `exit_boot_services` re-validates it.
pub fn capture_memory_map<'buf>(
    bs: &BootServices,
    buf: &'buf mut [u8],
) -> Result<(usize, MemoryMapIter<'buf>), BootError> {
    bs.memory_map(buf)
        .map_err(|_| BootError::ResourceExhausted("memory map capture failed"))
}
