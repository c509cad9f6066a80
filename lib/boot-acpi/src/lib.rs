// SPDX-License-Identifier: Apache-2.0 OR MIT

//! ACPI root-table discovery and best-effort MADT parsing — the external
//! collaborator `spec.md` §6 names as `find_root_table(cfg)` /
//! `parse_madt(cfg)`. `Acpi.c` (Hagfish's own ACPI walker) was not part of
//! this crate's retrieval pack, so the RSDP lookup here is grounded in the
//! teacher's own `main.rs`, which already does the UEFI configuration
//! table scan for `ACPI_GUID`/`ACPI2_GUID` inline; this crate factors that
//! same scan out behind the interface `spec.md` names, and adds a minimal
//! MADT walk per the public ACPI specification's table layout. A missing
//! or unparseable MADT is a warning, never fatal, per `spec.md` §7's "no
//! error is recovered locally except a missing ACPI RSDP" — which this
//! crate treats identically for the MADT: diagnostic only.

#![no_std]

extern crate alloc;

use uefi::table::cfg::{ConfigTableEntry, ACPI2_GUID, ACPI_GUID};

use boot_shared::Configuration;

/// Scan the UEFI configuration table for ACPI 1.0 and 2.0+ RSDP entries
/// and fill them into `cfg`. Missing entries are left `None`; `spec.md`
/// §7 treats that as a warning, not a failure.
pub fn find_root_table<'a>(
    cfg: &mut Configuration,
    config_entries: impl Iterator<Item = &'a ConfigTableEntry>,
) {
    for entry in config_entries {
        if entry.guid == ACPI2_GUID {
            cfg.acpi2_rsdp = Some(entry.address as u64);
        } else if entry.guid == ACPI_GUID {
            cfg.acpi1_rsdp = Some(entry.address as u64);
        }
    }
    if cfg.acpi1_rsdp.is_none() && cfg.acpi2_rsdp.is_none() {
        log::warn!("no ACPI RSDP present in the UEFI configuration table; continuing without ACPI");
    }
}

#[repr(C, packed)]
struct TableHeader {
    signature: [u8; 4],
    length: u32,
    _revision: u8,
    _checksum: u8,
    _oem_id: [u8; 6],
    _oem_table_id: [u8; 8],
    _oem_revision: u32,
    _creator_id: u32,
    _creator_revision: u32,
}

const MADT_SIGNATURE: [u8; 4] = *b"APIC";
const GICC_ENTRY_TYPE: u8 = 0x0B;
const GICD_ENTRY_TYPE: u8 = 0x0C;
const GICR_ENTRY_TYPE: u8 = 0x0F;

/// Best-effort summary of a MADT walk: how many GIC CPU-interface entries
/// (one per core) and GIC redistributor entries were found.
#[derive(Debug, Default, Clone, Copy)]
pub struct MadtSummary {
    pub cpu_interfaces: usize,
    pub redistributors: usize,
    pub distributors: usize,
}

/// Best-effort: find the XSDT via `acpi2_rsdp` (falling back to nothing
/// for ACPI 1.0, whose RSDT this crate does not walk — MADT discovery is
/// diagnostic only and AArch64 systems are expected to publish ACPI 2.0+),
/// locate the MADT, and count GIC-related entries. Any inconsistency
/// along the way yields `None` and a warning rather than an error.
pub fn parse_madt(cfg: &Configuration) -> Option<MadtSummary> {
    let rsdp_addr = cfg.acpi2_rsdp?;

    // RSDPv2 layout: 8-byte signature, checksum, oem_id[6], revision,
    // rsdt_address (u32) at offset 16, length (u32) at 20, xsdt_address
    // (u64) at offset 24.
    let xsdt_addr = unsafe { core::ptr::read_unaligned((rsdp_addr + 24) as *const u64) };
    if xsdt_addr == 0 {
        log::warn!("ACPI 2.0 RSDP has no XSDT address; skipping MADT discovery");
        return None;
    }

    let xsdt_header = unsafe { core::ptr::read_unaligned(xsdt_addr as *const TableHeader) };
    if xsdt_header.signature != *b"XSDT" {
        log::warn!("table at XSDT address does not have an XSDT signature");
        return None;
    }

    let entry_count = (xsdt_header.length as usize - core::mem::size_of::<TableHeader>()) / 8;
    let entries_base = xsdt_addr + core::mem::size_of::<TableHeader>() as u64;

    for i in 0..entry_count {
        let table_addr = unsafe { core::ptr::read_unaligned((entries_base + (i * 8) as u64) as *const u64) };
        if table_addr == 0 {
            continue;
        }
        let header = unsafe { core::ptr::read_unaligned(table_addr as *const TableHeader) };
        if header.signature != MADT_SIGNATURE {
            continue;
        }
        return Some(walk_madt(table_addr, header.length));
    }

    log::warn!("XSDT present but no MADT (APIC) table found");
    None
}

fn walk_madt(base: u64, length: u32) -> MadtSummary {
    // MADT body starts after TableHeader (36 bytes) plus two reserved
    // u32s (local interrupt controller address, flags) = 44 bytes.
    const MADT_BODY_OFFSET: u64 = 44;
    let mut summary = MadtSummary::default();
    let mut offset = MADT_BODY_OFFSET;

    while offset + 2 <= length as u64 {
        let entry_addr = base + offset;
        let entry_type = unsafe { core::ptr::read_unaligned(entry_addr as *const u8) };
        let entry_len = unsafe { core::ptr::read_unaligned((entry_addr + 1) as *const u8) };
        if entry_len == 0 {
            break;
        }
        match entry_type {
            t if t == GICC_ENTRY_TYPE => summary.cpu_interfaces += 1,
            t if t == GICD_ENTRY_TYPE => summary.distributors += 1,
            t if t == GICR_ENTRY_TYPE => summary.redistributors += 1,
            _ => {}
        }
        offset += entry_len as u64;
    }

    summary
}
