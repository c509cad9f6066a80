//! The error taxonomy for everything before `ExitBootServices`.
//!
//! Every fallible operation in C1–C4 returns `Result<T, BootError>`. C5
//! propagates with `?` up to `uefi_start`, which logs the diagnostic and
//! hands a `Status` back to firmware. Nothing after `ExitBootServices` can
//! fail recoverably, so that stage never constructs a `BootError` — the
//! final hand-off in `main.rs::run` diverges instead.

use core::fmt;

use uefi::Status;

#[derive(Debug, Clone, Copy)]
pub enum BootError {
    /// No network, no volume, or the configuration parser rejected the buffer.
    ConfigUnreachable(&'static str),
    /// Wrong ELF class/endianness/machine, unsupported relocation, missing entry.
    ImageInvalid(&'static str),
    /// A firmware allocation failed.
    ResourceExhausted(&'static str),
    /// A UEFI call returned an error status.
    FirmwareRefused(&'static str, Status),
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::ConfigUnreachable(m) => write!(f, "configuration unreachable: {}", m),
            BootError::ImageInvalid(m) => write!(f, "image invalid: {}", m),
            BootError::ResourceExhausted(m) => write!(f, "resource exhausted: {}", m),
            BootError::FirmwareRefused(m, status) => {
                write!(f, "firmware refused ({:?}): {}", status, m)
            }
        }
    }
}

/// Lift a UEFI `Result` into a `BootError`, tagging it with a human-readable
/// description of what was being attempted.
pub fn firmware<T>(result: uefi::Result<T>, what: &'static str) -> Result<T, BootError> {
    result.map_err(|e| BootError::FirmwareRefused(what, e.status()))
}
