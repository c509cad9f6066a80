//! C1 — the file-transport abstraction.
//!
//! A tagged variant over PXE/TFTP and local-FAT state, exposing the five
//! capabilities `spec.md` §4.1 names, per the "tagged variant carrying
//! variant-specific state plus a dispatch table — not inheritance" design
//! note in §9. Grounded directly in `Loader.c`'s `hagfish_loader_pxe_init`
//! and `hagfish_loader_local_fs_init`: the network variant reads the
//! cached DHCPv4 ACK off the PXE protocol and formats a per-host config
//! filename from the station IP; the local-volume variant opens the first
//! handle exposing `SimpleFileSystem` and converts ASCII paths to UTF-16
//! with `/` translated to `\`.
//!
//! Both variants bind their protocol with `handle_protocol` rather than
//! `open_protocol_exclusive`, so `done()` has no `CloseProtocol` call to
//! make where `Loader.c`'s `pxe_done()` has one — see the comment on
//! `done()` itself.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use uefi::data_types::CStr16;
use uefi::proto::media::file::{File, FileAttribute, FileInfo, FileMode, RegularFile};
use uefi::proto::media::fs::SimpleFileSystem;
use uefi::proto::network::pxe::{BaseCode, DhcpV4Packet};
use uefi::table::boot::BootServices;
use uefi::Handle;

use crate::error::BootError;

/// State specific to network boot.
pub struct NetState<'a> {
    base_code: &'a mut BaseCode,
    station_ip: [u8; 4],
}

/// State specific to local-volume boot.
pub struct LocalFsState<'a> {
    volume_root: uefi::proto::media::file::Directory,
    image_path: &'a str,
    bs: &'a BootServices,
}

pub enum Loader<'a> {
    Net(NetState<'a>),
    LocalFs(LocalFsState<'a>),
}

fn ascii_path_to_u16(path: &str, buf: &mut [u16]) -> Result<usize, BootError> {
    if path.len() + 1 > buf.len() {
        return Err(BootError::ConfigUnreachable("path too long"));
    }
    let mut i = 0;
    for byte in path.bytes() {
        buf[i] = if byte == b'/' { b'\\' as u16 } else { byte as u16 };
        i += 1;
    }
    buf[i] = 0;
    Ok(i)
}

impl<'a> Loader<'a> {
    /// Bind the network transport to the PXE protocol on `device_handle`.
    /// Fails with `NOT_READY`-equivalent if DHCP has not completed, and
    /// rejects IPv6, matching `Loader.c`'s `net_config`.
    pub fn new_net(bs: &'a BootServices, device_handle: Handle) -> Result<Self, BootError> {
        let base_code = unsafe {
            &mut *bs
                .handle_protocol::<BaseCode>(device_handle)
                .map_err(|_| BootError::ConfigUnreachable("no PXE base-code protocol on boot device"))?
                .get()
        };

        let mode = base_code.mode();
        if !mode.dhcp_ack_received {
            return Err(BootError::ConfigUnreachable("DHCP handshake not complete"));
        }
        if mode.using_ipv6 {
            return Err(BootError::ConfigUnreachable("IPv6 network boot is unsupported"));
        }

        let ack: &DhcpV4Packet = unsafe { &*(&mode.dhcp_ack.dhcpv4 as *const _) };
        let station_ip = ack.bootp_yi_addr;

        Ok(Loader::Net(NetState {
            base_code,
            station_ip,
        }))
    }

    /// Bind the local-volume transport to the first handle exposing
    /// `SimpleFileSystem`, matching `Loader.c`'s unconditional `handles[0]`
    /// — a known limitation documented in `spec.md` §9's open questions.
    pub fn new_local_fs(bs: &'a BootServices, image_path: &'a str) -> Result<Self, BootError> {
        let handles = bs
            .find_handles::<SimpleFileSystem>()
            .map_err(|_| BootError::ConfigUnreachable("no SimpleFileSystem handles present"))?;
        let handle = *handles
            .first()
            .ok_or(BootError::ConfigUnreachable("no SimpleFileSystem handles present"))?;

        let sfs = unsafe {
            &mut *bs
                .handle_protocol::<SimpleFileSystem>(handle)
                .map_err(|_| BootError::ConfigUnreachable("failed to open SimpleFileSystem"))?
                .get()
        };
        let volume_root = sfs
            .open_volume()
            .map_err(|_| BootError::ConfigUnreachable("failed to open volume root"))?;

        Ok(Loader::LocalFs(LocalFsState {
            volume_root,
            image_path,
            bs,
        }))
    }

    /// Query the size in bytes of `path`, leaving no open file handle on
    /// return.
    pub fn size(&mut self, path: &str) -> Result<usize, BootError> {
        match self {
            Loader::Net(net) => {
                let mut size = 0u64;
                net.base_code
                    .mtftp_get_file_size(path, &mut size)
                    .map_err(|_| BootError::ConfigUnreachable("TFTP size query failed"))?;
                Ok(size as usize)
            }
            Loader::LocalFs(fs) => {
                let mut path_buf = [0u16; 256];
                let len = ascii_path_to_u16(path, &mut path_buf)?;
                let cpath = unsafe { CStr16::from_u16_with_nul_unchecked(&path_buf[..=len]) };
                let handle = fs
                    .volume_root
                    .open(cpath, FileMode::Read, FileAttribute::empty())
                    .map_err(|_| BootError::ConfigUnreachable("failed to open file"))?;
                let mut file = unsafe { RegularFile::new(handle) };
                let mut info_buf = [0u8; 512];
                let info = file
                    .get_info::<FileInfo>(&mut info_buf)
                    .map_err(|_| BootError::ConfigUnreachable("failed to stat file"))?;
                let size = info.file_size() as usize;
                file.close();
                Ok(size)
            }
        }
    }

    /// Read `path` fully into `buf`. Partial reads are a failure, per
    /// `spec.md` §4.2.
    pub fn read(&mut self, path: &str, buf: &mut [u8]) -> Result<usize, BootError> {
        match self {
            Loader::Net(net) => {
                let mut size = buf.len() as u64;
                net.base_code
                    .mtftp_read_file(path, buf, &mut size)
                    .map_err(|_| BootError::ConfigUnreachable("TFTP read failed"))?;
                if size as usize != buf.len() {
                    return Err(BootError::ConfigUnreachable("partial TFTP read"));
                }
                Ok(size as usize)
            }
            Loader::LocalFs(fs) => {
                let mut path_buf = [0u16; 256];
                let len = ascii_path_to_u16(path, &mut path_buf)?;
                let cpath = unsafe { CStr16::from_u16_with_nul_unchecked(&path_buf[..=len]) };
                let handle = fs
                    .volume_root
                    .open(cpath, FileMode::Read, FileAttribute::empty())
                    .map_err(|_| BootError::ConfigUnreachable("failed to open file"))?;
                let mut file = unsafe { RegularFile::new(handle) };
                let read = file
                    .read(buf)
                    .map_err(|_| BootError::ConfigUnreachable("failed to read file"))?;
                file.close();
                if read != buf.len() {
                    return Err(BootError::ConfigUnreachable("partial local-volume read"));
                }
                Ok(read)
            }
        }
    }

    /// The configuration file's name/path, per variant.
    pub fn config_name(&self) -> Result<String, BootError> {
        match self {
            Loader::Net(net) => Ok(alloc::format!(
                "{}.{}.{}.{}.cfg",
                net.station_ip[0],
                net.station_ip[1],
                net.station_ip[2],
                net.station_ip[3]
            )),
            Loader::LocalFs(fs) => Ok(String::from(fs.image_path)),
        }
    }

    /// Emit the network tag: a byte-exact DHCPv4 ACK for the network
    /// variant, or an empty payload (still full reserved size) for the
    /// local-volume variant — `spec.md` §8's boundary behavior.
    pub fn prepare_net_tag(&self) -> Vec<u8> {
        match self {
            Loader::Net(net) => {
                let ack: &DhcpV4Packet = unsafe { &*(&net.base_code.mode().dhcp_ack.dhcpv4 as *const _) };
                let bytes = unsafe {
                    core::slice::from_raw_parts(
                        ack as *const DhcpV4Packet as *const u8,
                        core::mem::size_of::<DhcpV4Packet>(),
                    )
                };
                bytes.to_vec()
            }
            Loader::LocalFs(_) => Vec::new(),
        }
    }

    /// Release the underlying firmware protocol handle. The loader handle
    /// is invalid after this call, per `spec.md` §4.1.
    pub fn done(self) {
        match self {
            // `Loader.c`'s `pxe_done()` closes the PXE base-code interface
            // it opened via `OpenProtocol`; `new_net` instead binds it with
            // `handle_protocol`, the legacy lock-free API, which hands out
            // no reference to release — same rationale as `OwnImage`'s
            // `Drop` impl in `image.rs`. Nothing to do here deliberately.
            Loader::Net(_) => {}
            Loader::LocalFs(fs) => {
                let _ = fs.bs;
            }
        }
    }
}
