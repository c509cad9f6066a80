//! The direct map: identity-mapped low memory for the boot driver
//! (`kernel_offset = 0`) plus a linear `VA = PA + KERNEL_OFFSET` mapping
//! for everything the CPU driver touches, covering every RAM region the
//! UEFI memory map reports. Two-phase like the teacher's own
//! `map_physical_memory`/`VSpace` split: [`allocate`] runs before
//! `ExitBootServices` (the only point pages can still be requested from
//! firmware), [`install`] runs after (raw pointer writes into memory this
//! crate already owns).
//!
//! Descriptor bit layout and register values are taken from
//! `examples/other_examples`' `hanbings/alpheratz` AArch64 page-table
//! builder; this module generalizes its fixed 4 GiB identity range to
//! however much RAM the captured memory map actually reports, bounded at
//! 512 GiB (one L1 table's worth of 1 GiB blocks) — see `DESIGN.md` for
//! why that bound was judged sufficient for this research OS.

use boot_shared::BASE_PAGE_SIZE;
use uefi::table::boot::BootServices;

use crate::error::BootError;
use crate::memory;

const TABLE_DESC: u64 = 0b11;
const BLOCK_DESC: u64 = 0b01;
const PAGE_DESC: u64 = 0b11;

const AF: u64 = 1 << 10;
const SH_INNER: u64 = 0b11 << 8;
const ATTR_NORMAL: u64 = 0 << 2;
const NORMAL_MEM_ATTRS: u64 = AF | SH_INNER | ATTR_NORMAL;

/// `L0` index of the high-half direct map: bits `[47:39]` of
/// `KERNEL_OFFSET` (`0xffff_0000_0000_0000`) are zero, so the entire
/// mapping lives under `L0[0]` of `TTBR1`.
const KERNEL_L0_INDEX: usize = 0;

/// One `L1` table's reach: 512 entries of 1 GiB blocks.
const MAX_IDENTITY_BYTES: u64 = 512 * 1024 * 1024 * 1024;

pub const MAIR_VALUE: u64 = 0x0000_0000_0000_00FF;
pub const TCR_VALUE: u64 = {
    let t0sz: u64 = 16;
    let t1sz: u64 = 16 << 16;
    let tg0_4k: u64 = 0b00 << 14;
    let tg1_4k: u64 = 0b10 << 30;
    let sh0: u64 = 0b11 << 12;
    let sh1: u64 = 0b11 << 28;
    let orgn0: u64 = 0b01 << 10;
    let irgn0: u64 = 0b01 << 8;
    let orgn1: u64 = 0b01 << 26;
    let irgn1: u64 = 0b01 << 24;
    let ips_48: u64 = 0b101 << 32;
    t0sz | t1sz | tg0_4k | tg1_4k | sh0 | sh1 | orgn0 | irgn0 | orgn1 | irgn1 | ips_48
};

/// Page-table pages allocated under the page-table firmware tag,
/// pre-exit, and not yet initialized.
pub struct DirectMap {
    ttbr0_l0: u64,
    l1_identity: u64,
    ttbr1_l0: u64,
    l1_phys_map: u64,
    block_count: usize,
}

impl DirectMap {
    pub fn ttbr1(&self) -> u64 {
        self.ttbr1_l0
    }
}

/// Highest physical address (exclusive) described by any UEFI memory
/// descriptor, used to size the identity/direct map.
pub fn highest_ram_address(descriptors: impl Iterator<Item = (u64, u64)>) -> u64 {
    descriptors
        .map(|(base, size)| base + size)
        .max()
        .unwrap_or(0)
}

/// Allocate the page-table pages. Must run before `ExitBootServices`.
pub fn allocate(bs: &BootServices, highest_ram: u64) -> Result<DirectMap, BootError> {
    let block_count = {
        let bounded = core::cmp::min(highest_ram, MAX_IDENTITY_BYTES);
        let blocks = (bounded + (1 << 30) - 1) >> 30;
        core::cmp::max(blocks as usize, 1)
    };
    if (highest_ram as u64) > MAX_IDENTITY_BYTES {
        log::warn!(
            "RAM extends past {} GiB; direct map truncated to that bound",
            MAX_IDENTITY_BYTES >> 30
        );
    }

    let pages = memory::allocate_pages(
        bs,
        4,
        boot_shared::loader_memory_type(boot_shared::PAGE_TABLE_DATA),
    )?;
    let ttbr0_l0 = pages;
    let l1_identity = pages + BASE_PAGE_SIZE as u64;
    let ttbr1_l0 = pages + 2 * BASE_PAGE_SIZE as u64;
    let l1_phys_map = pages + 3 * BASE_PAGE_SIZE as u64;

    Ok(DirectMap {
        ttbr0_l0,
        l1_identity,
        ttbr1_l0,
        l1_phys_map,
        block_count,
    })
}

/// Fill in every descriptor. Must run after `ExitBootServices`; the
/// memory `map` points to is already owned by this loader and does not
/// require any further firmware call.
///
/// # Safety
/// `map`'s addresses must still be valid (boot services must have been
/// exited without any intervening allocation that could have reused
/// them).
pub unsafe fn install(map: &DirectMap) -> u64 {
    let ttbr0_l0 = map.ttbr0_l0 as *mut u64;
    let l1_identity = map.l1_identity as *mut u64;
    let ttbr1_l0 = map.ttbr1_l0 as *mut u64;
    let l1_phys_map = map.l1_phys_map as *mut u64;

    *ttbr0_l0.add(0) = map.l1_identity | TABLE_DESC;
    for i in 0..map.block_count {
        *l1_identity.add(i) = ((i as u64) << 30) | NORMAL_MEM_ATTRS | BLOCK_DESC;
    }

    *ttbr1_l0.add(KERNEL_L0_INDEX) = map.l1_phys_map | TABLE_DESC;
    for i in 0..map.block_count {
        *l1_phys_map.add(i) = ((i as u64) << 30) | NORMAL_MEM_ATTRS | BLOCK_DESC;
    }

    map.ttbr0_l0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_ram_address_picks_the_farthest_region() {
        let descriptors = [(0u64, 0x1000_0000u64), (0x4000_0000, 0x2000_0000)];
        assert_eq!(highest_ram_address(descriptors.into_iter()), 0x6000_0000);
    }

    #[test]
    fn highest_ram_address_of_empty_map_is_zero() {
        assert_eq!(highest_ram_address(core::iter::empty()), 0);
    }
}
