//! CPU feature setup and the final, divergent control transfer.
//!
//! Every function here that touches real hardware state is `unsafe` and
//! runs only after `ExitBootServices` — by the time `jump_to_kernel` is
//! called there is, by construction, no way back into firmware, so it
//! returns `!` rather than `Result`, matching `spec.md` §4.5's framing of
//! the hand-off as a one-shot, irreversible operation.

use core::arch::asm;

use super::pagetable::{MAIR_VALUE, TCR_VALUE};

/// Disarm interrupts before the jump. `exit_boot_services` does not
/// specify whether interrupts are already masked, so this is done
/// explicitly rather than assumed.
pub unsafe fn disable_interrupts() {
    asm!("msr daifset, #0xf", options(nomem, nostack, preserves_flags));
}

/// Program `MAIR_EL1`/`TCR_EL1`, install both translation table base
/// registers, and enable the MMU — `arch_init(root_table)` from
/// `spec.md` §6.
pub unsafe fn arch_init(ttbr0: u64, ttbr1: u64) {
    asm!(
        "msr mair_el1, {mair}",
        "msr tcr_el1, {tcr}",
        "msr ttbr0_el1, {ttbr0}",
        "msr ttbr1_el1, {ttbr1}",
        "isb",
        "mrs {tmp}, sctlr_el1",
        "orr {tmp}, {tmp}, #1",
        "msr sctlr_el1, {tmp}",
        "isb",
        mair = in(reg) MAIR_VALUE,
        tcr = in(reg) TCR_VALUE,
        ttbr0 = in(reg) ttbr0,
        ttbr1 = in(reg) ttbr1,
        tmp = out(reg) _,
        options(nostack),
    );
}

/// A minimal readiness check before committing to the hand-off: AArch64
/// UEFI firmware always runs with the MMU enabled and a 4 KiB granule, so
/// there is little left to probe; this mirrors `arch_probe` in
/// `spec.md` §6 as a named seam rather than a load-bearing check.
pub fn arch_probe() -> Result<(), &'static str> {
    let mut id_aa64mmfr0: u64;
    unsafe {
        asm!("mrs {0}, id_aa64mmfr0_el1", out(reg) id_aa64mmfr0, options(nomem, nostack));
    }
    let tgran4 = (id_aa64mmfr0 >> 28) & 0xf;
    if tgran4 == 0xf {
        return Err("4 KiB translation granule is not supported by this CPU");
    }
    Ok(())
}

/// Set the stack pointer, place the Multiboot2 magic and info pointer in
/// the first two argument registers, and branch to `entry`. Never
/// returns: there is no firmware left to return to.
pub unsafe fn jump_to_kernel(stack: u64, entry: u64, multiboot_magic: u32, multiboot_info: u64) -> ! {
    asm!(
        "mov sp, {stack}",
        "mov w0, {magic:w}",
        "mov x1, {info}",
        "br {entry}",
        stack = in(reg) stack,
        magic = in(reg) multiboot_magic,
        info = in(reg) multiboot_info,
        entry = in(reg) entry,
        options(noreturn),
    );
}
