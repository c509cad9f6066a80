// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A UEFI-hosted second-stage bootloader for a capability-based research
//! operating system on AArch64.
//!
//! This loader looks for a small text configuration file (over PXE/TFTP or
//! a local FAT volume, whichever device it was itself loaded from), reads
//! the boot driver, the CPU driver, and any extra modules it names, relocates
//! each ELF64 image, builds an identity map and a high-half direct map,
//! assembles a Multiboot2-shaped boot-information structure describing all
//! of it, exits UEFI boot services, and transfers control to the boot
//! driver with the MMU already enabled.
//!
//! The boot driver runs identity-mapped (`kernel_offset = 0`); the CPU
//! driver is relocated into the high half at [`arch::KERNEL_OFFSET`] and is
//! handed off to afterward by the boot driver itself — this loader's job
//! ends at the boot driver's entry point.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate alloc;

use alloc::vec::Vec;

use uefi::prelude::*;

#[cfg(target_arch = "aarch64")]
#[path = "arch/aarch64/mod.rs"]
pub mod arch;

mod component;
mod elf;
mod error;
mod handoff;
mod image;
mod loader;
mod memory;
mod multiboot;

use boot_shared::{loader_memory_type, Configuration, CPU_DRIVER_STACK, MULTIBOOT_DATA, UEFI_MEMORY_MAP};
use error::BootError;
use handoff::State;
use image::OwnImage;
use loader::Loader;

/// Where to look for the configuration file when this loader was started
/// from a local volume rather than over the network, matching the
/// `spec.md` §4.1 "local-volume variant" framing: a single well-known path
/// rather than a name derived from anything else on the volume.
const DEFAULT_LOCAL_CONFIG_PATH: &str = "/loader.cfg";

/// Disarm the firmware's five-minute watchdog before doing anything else —
/// this loader can legitimately take longer than that over a slow TFTP
/// link, and a watchdog reset mid-boot is indistinguishable from a crash.
fn disarm_watchdog(bs: &uefi::table::boot::BootServices) {
    if let Err(e) = bs.set_watchdog_timer(0, 0x10000, None) {
        warn!("failed to disarm the firmware watchdog: {:?}", e.status());
    }
}

/// Open the network transport if this image's device exposes PXE base
/// code; otherwise fall back to the local-volume transport at
/// [`DEFAULT_LOCAL_CONFIG_PATH`]. `spec.md` §4.1 names both transports but
/// leaves transport selection itself unspecified; trying the network first
/// matches `Loader.c`'s own boot order (PXE images carry a PXE base-code
/// protocol on their own device handle, local-media images never do).
fn open_loader<'a>(
    bs: &'a uefi::table::boot::BootServices,
    device_handle: uefi::Handle,
) -> Result<Loader<'a>, BootError> {
    match Loader::new_net(bs, device_handle) {
        Ok(loader) => Ok(loader),
        Err(e) => {
            debug!("no usable network transport ({}); trying local volume", e);
            Loader::new_local_fs(bs, DEFAULT_LOCAL_CONFIG_PATH)
        }
    }
}

/// Read a file fully into a freshly allocated `Vec<u8>` using the general
/// allocator — configuration and bookkeeping data, never component images,
/// which always go through [`memory::allocate_pages`] under a typed tag.
fn read_to_vec(loader: &mut Loader, path: &str) -> Result<Vec<u8>, BootError> {
    let size = loader.size(path)?;
    let mut buf = vec![0u8; size];
    let read = loader.read(path, &mut buf)?;
    if read != size {
        return Err(BootError::ConfigUnreachable("partial read of configuration file"));
    }
    Ok(buf)
}

/// Runs the whole boot sequence. The only way out of this function is
/// `Err` (something before `ExitBootServices` failed) or the final,
/// diverging call to `arch::cpu::jump_to_kernel` — there is no `Ok`
/// return once boot services are gone.
fn run(handle: uefi::Handle, st: &SystemTable<Boot>) -> Result<(), BootError> {
    let bs = st.boot_services();
    handoff::log_state(State::Init);

    let own_image = OwnImage::open(bs, handle)?;
    let mut loader = open_loader(bs, own_image.device_handle())?;

    let config_name = loader.config_name()?;
    info!("reading configuration from {}", config_name);
    let config_buf = read_to_vec(&mut loader, &config_name)?;
    let mut cfg: Configuration =
        boot_config::parse(config_buf).map_err(|_| BootError::ConfigUnreachable("malformed configuration file"))?;
    handoff::log_state(State::ConfigLoaded);

    boot_acpi::find_root_table(&mut cfg, st.config_table().iter());
    if let Some(madt) = boot_acpi::parse_madt(&cfg) {
        info!(
            "MADT: {} CPU interface(s), {} distributor(s), {} redistributor(s)",
            madt.cpu_interfaces, madt.distributors, madt.redistributors
        );
    }

    // `components_mut` borrows all of `cfg`, including `buf`, so the path
    // bytes each component needs are read through a raw slice built from
    // `buf`'s own pointer/length rather than `&cfg.buf` directly — `buf`
    // itself is never mutated while components load.
    let cfg_buf_ptr = cfg.buf.as_ptr();
    let cfg_buf_len = cfg.buf.len();
    for component in cfg.components_mut() {
        let cfg_buf = unsafe { core::slice::from_raw_parts(cfg_buf_ptr, cfg_buf_len) };
        component::load(bs, &mut loader, component, cfg_buf)?;
    }
    handoff::log_state(State::ComponentsLoaded);

    // Build the direct map before preparing the drivers: the ELF preparer's
    // allocations and the page-table's own bookkeeping pages both come out
    // of the same firmware pool, but the direct map only needs to cover
    // physical memory, not any particular allocation, so its sizing can run
    // first off an interim snapshot of the memory map.
    let probe_size = memory::estimate_memory_map_size(bs);
    let probe_base =
        memory::allocate_pages(bs, probe_size / boot_shared::BASE_PAGE_SIZE, loader_memory_type(UEFI_MEMORY_MAP))?;
    let probe_buf = unsafe { core::slice::from_raw_parts_mut(probe_base as *mut u8, probe_size) };
    let (_, probe_iter) = memory::capture_memory_map(bs, probe_buf)?;
    let highest_ram = arch::pagetable::highest_ram_address(
        probe_iter.map(|d| (d.phys_start, d.page_count * boot_shared::BASE_PAGE_SIZE as u64)),
    );
    let direct_map = arch::pagetable::allocate(bs, highest_ram)?;
    handoff::log_state(State::PageTablesBuilt);

    {
        let boot_image_bytes = unsafe {
            core::slice::from_raw_parts(
                cfg.boot_driver.image_address as *const u8,
                cfg.boot_driver.image_size,
            )
        };
        let mut alloc = FirmwarePageSource { bs };
        cfg.boot_driver_image = elf::prepare(boot_image_bytes, 0, &mut alloc)?;
    }
    {
        let cpu_image_bytes = unsafe {
            core::slice::from_raw_parts(
                cfg.cpu_driver.image_address as *const u8,
                cfg.cpu_driver.image_size,
            )
        };
        let mut alloc = FirmwarePageSource { bs };
        cfg.cpu_driver_image = elf::prepare(cpu_image_bytes, arch::KERNEL_OFFSET, &mut alloc)?;
    }
    handoff::log_state(State::DriversPrepared);

    let stack_pages = handoff::stack_pages(cfg.stack_size);
    let stack_base = memory::allocate_pages(bs, stack_pages, loader_memory_type(CPU_DRIVER_STACK))?;
    cfg.kernel_stack_base = stack_base;

    let cmdline = core::str::from_utf8(cfg.cpu_driver.args(&cfg.buf)).unwrap_or("<non-UTF-8>");
    info!("cpu driver cmdline: \"{}\"", cmdline);
    info!(
        "boot driver entry {:#x}, cpu driver entry {:#x}, kernel stack {:#x}..{:#x}, page tables at {:#x}",
        cfg.boot_driver_image.entry_point,
        cfg.cpu_driver_image.entry_point,
        stack_base,
        stack_base + (stack_pages * boot_shared::BASE_PAGE_SIZE) as u64,
        direct_map.ttbr1(),
    );

    let dhcp_payload = loader.prepare_net_tag();
    let plan = multiboot::plan(&cfg, dhcp_payload.len());
    let mb_pages = boot_shared::pages_for(plan.total);
    let mb_base = memory::allocate_pages(bs, mb_pages, loader_memory_type(MULTIBOOT_DATA))?;
    let mb_slice = unsafe { core::slice::from_raw_parts_mut(mb_base as *mut u8, mb_pages * boot_shared::BASE_PAGE_SIZE) };
    let layout = multiboot::assemble(mb_slice, &cfg, &plan, &dhcp_payload, |component| {
        let bytes = unsafe {
            core::slice::from_raw_parts(component.image_address as *const u8, component.image_size)
        };
        bytes.to_vec()
    })?;
    cfg.multiboot_base = mb_base;
    cfg.multiboot_size = plan.total;
    cfg.mmap_tag_offset = layout.mmap_tag_offset;
    cfg.mmap_payload_offset = layout.mmap_payload_offset;
    handoff::log_state(State::MultibootAssembled);

    loader.done();
    handoff::log_state(State::LoaderRetired);
    drop(own_image);
    handoff::log_state(State::ImageRetired);

    let mm_size = memory::estimate_memory_map_size(bs);
    // `entry_size` is queried now, while `bs` is still valid -- nothing
    // allocates between here and `exit_boot_services`, so the firmware has
    // no opportunity to change its descriptor stride in between.
    let descriptor_size = bs.memory_map_size().entry_size;
    let mm_pages = mm_size / boot_shared::BASE_PAGE_SIZE;
    let mm_base = memory::allocate_pages(bs, mm_pages, loader_memory_type(UEFI_MEMORY_MAP))?;
    let mm_buf = unsafe { core::slice::from_raw_parts_mut(mm_base as *mut u8, mm_size) };

    info!("exiting UEFI boot services; no further diagnostics until the kernel serial driver is up");
    let (_rt, mmap_iter) = st
        .exit_boot_services(handle, &mut *mm_buf)
        .map_err(|_| BootError::ResourceExhausted("exit_boot_services failed"))?;
    handoff::log_state(State::MemoryMapCaptured);

    // The UEFI specification has fixed EFI_MEMORY_DESCRIPTOR_VERSION at 1
    // since UEFI 2.0; no accessor on the iterator reports it.
    const EFI_MEMORY_DESCRIPTOR_VERSION: u32 = 1;
    let descriptor_count = mmap_iter.count();

    handoff::relocate_memory_map(mm_buf, descriptor_size, descriptor_count, arch::KERNEL_OFFSET);
    handoff::log_state(State::MmapRelocated);

    let mb_buf =
        unsafe { core::slice::from_raw_parts_mut(cfg.multiboot_base as *mut u8, cfg.multiboot_size) };
    multiboot::fill_memory_map_tag(
        mb_buf,
        &multiboot::AssembledLayout {
            mmap_tag_offset: cfg.mmap_tag_offset,
            mmap_payload_offset: cfg.mmap_payload_offset,
            total_length: cfg.multiboot_size,
        },
        mm_buf,
        descriptor_size,
        EFI_MEMORY_DESCRIPTOR_VERSION,
    );
    handoff::log_state(State::MmapTagFilled);
    handoff::log_state(State::BootServicesExited);

    unsafe {
        arch::cpu::disable_interrupts();
        let ttbr0 = arch::pagetable::install(&direct_map);
        arch::cpu::arch_init(ttbr0, direct_map.ttbr1());
        handoff::log_state(State::MmuReconfigured);

        // The boot driver runs identity-mapped (kernel_offset = 0), so the
        // stack and multiboot pointers handed to it must be physical
        // addresses, not high-half ones.
        let sp = handoff::kernel_stack_pointer(
            cfg.kernel_stack_base,
            stack_pages * boot_shared::BASE_PAGE_SIZE,
        );
        handoff::log_state(State::ControlTransferred);
        arch::cpu::jump_to_kernel(
            sp,
            cfg.boot_driver_image.entry_point,
            multiboot::MULTIBOOT2_BOOTLOADER_MAGIC,
            cfg.multiboot_base,
        );
    }
}

/// Adapts [`memory::allocate_pages`] and raw pointer writes to
/// [`elf::PageSource`] so `run` can call the same preparer the
/// host-side unit tests exercise against a bump allocator.
struct FirmwarePageSource<'a> {
    bs: &'a uefi::table::boot::BootServices,
}

impl<'a> elf::PageSource for FirmwarePageSource<'a> {
    fn allocate_zeroed(&mut self, pages: usize) -> Result<u64, BootError> {
        memory::allocate_pages(self.bs, pages, loader_memory_type(boot_shared::CPU_DRIVER_CODE))
    }

    unsafe fn write(&mut self, at: u64, bytes: &[u8]) {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), at as *mut u8, bytes.len());
    }

    unsafe fn read_u64(&self, at: u64) -> u64 {
        core::ptr::read_unaligned(at as *const u64)
    }

    unsafe fn write_u64(&mut self, at: u64, value: u64) {
        core::ptr::write_unaligned(at as *mut u64, value);
    }
}

/// Start function of the bootloader.
/// The symbol name is defined through `/Entry:uefi_start` in the AArch64
/// UEFI target's linker configuration.
#[no_mangle]
pub extern "C" fn uefi_start(handle: uefi::Handle, mut st: SystemTable<Boot>) -> Status {
    uefi_services::init(&mut st).expect("failed to initialize UEFI services");
    log::set_max_level(log::LevelFilter::Info);

    info!(
        "capability-kernel bootloader starting (UEFI {}.{})",
        st.uefi_revision().major(),
        st.uefi_revision().minor()
    );

    disarm_watchdog(st.boot_services());

    if let Err(e) = arch::cpu::arch_probe() {
        error!("CPU is unsuitable for this loader: {}", e);
        return Status::UNSUPPORTED;
    }

    match run(handle, &st) {
        // Unreachable in practice: `run` only returns once boot services
        // and this loader's own ability to report a `Status` are gone.
        Ok(()) => Status::SUCCESS,
        Err(e) => {
            error!("boot aborted: {}", e);
            match e {
                BootError::FirmwareRefused(_, status) => status,
                BootError::ConfigUnreachable(_) => Status::NOT_FOUND,
                BootError::ImageInvalid(_) => Status::LOAD_ERROR,
                BootError::ResourceExhausted(_) => Status::OUT_OF_RESOURCES,
            }
        }
    }
}
