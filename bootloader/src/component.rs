//! C2 — the component loader.
//!
//! Straight line, no retries: query size, allocate exactly that many
//! pages under the ELF-image tag, read the file in, record the result.
//! Every failure aborts the boot, per `spec.md` §4.2.

extern crate alloc;

use uefi::table::boot::BootServices;

use boot_shared::{loader_memory_type, ComponentDescriptor, ELF_IMAGE_DATA};

use crate::error::BootError;
use crate::loader::Loader;
use crate::memory;

/// Build a null-terminated path from `cfg_buf[path_start..path_start +
/// path_len]`, then load the named component through `loader`.
pub fn load(
    bs: &BootServices,
    loader: &mut Loader,
    component: &mut ComponentDescriptor,
    cfg_buf: &[u8],
) -> Result<(), BootError> {
    let path_bytes = component.path(cfg_buf);
    let path = core::str::from_utf8(path_bytes)
        .map_err(|_| BootError::ConfigUnreachable("component path is not valid UTF-8"))?;

    let size = loader.size(path)?;
    let pages = boot_shared::pages_for(size);
    let base = memory::allocate_pages(bs, pages, loader_memory_type(ELF_IMAGE_DATA))?;

    if size > 0 {
        let dest = unsafe { core::slice::from_raw_parts_mut(base as *mut u8, size) };
        let read = loader.read(path, dest)?;
        if read != size {
            return Err(BootError::ConfigUnreachable("partial component read"));
        }
    }

    component.image_address = base;
    component.image_size = size;
    Ok(())
}
