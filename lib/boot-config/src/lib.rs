// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The configuration file parser `spec.md` §6 names as an external
//! collaborator: `parse(buffer) -> configuration`. `spec.md` leaves the
//! grammar itself out of scope, and the original Hagfish loader's own
//! `Config.c`/`Config.h` were not part of the retrieval pack this crate
//! was built from, so this module defines a small line-oriented grammar
//! in the spirit of a classic Barrelfish/Hagfish `menu.lst` — see
//! `SPEC_FULL.md` §3 for the full grammar description.
//!
//! ```text
//! # comment lines start with '#'
//! stack <bytes>
//! bootdriver <path> [args...]
//! cpudriver <path> [args...]
//! module <path> [args...]
//! ```
//!
//! `parse` takes ownership of the raw buffer, per `spec.md` §3's "Owns the
//! raw configuration buffer (strings are slices into it)" — every
//! `ComponentDescriptor`'s `path`/`args` fields are offsets into the exact
//! `Vec<u8>` returned inside the `Configuration`, never copies.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

use boot_shared::{ComponentDescriptor, Configuration};

#[derive(Debug, Clone, Copy)]
pub enum ConfigError {
    /// A `stack` line's byte count did not parse as an integer.
    BadStackSize,
    /// A line did not start with a recognized keyword.
    UnknownDirective,
    /// A `bootdriver`/`cpudriver`/`module` line named no path.
    MissingPath,
    /// The configuration named no boot driver.
    NoBootDriver,
    /// The configuration named no CPU driver.
    NoCpuDriver,
    /// More than one `bootdriver` or `cpudriver` line was present.
    DuplicateDirective,
}

struct Line {
    /// Byte offset of the first non-whitespace token.
    start: usize,
    /// Byte offset one past the last non-whitespace byte.
    end: usize,
}

/// Find word boundaries on `buf[start..]` up to (excluding) the first
/// `\n`/buffer end, returning byte ranges relative to `buf`, trimmed of
/// surrounding ASCII whitespace.
fn trimmed_line(buf: &[u8], start: usize) -> (Line, usize) {
    let mut end = start;
    while end < buf.len() && buf[end] != b'\n' {
        end += 1;
    }
    let next_line_start = if end < buf.len() { end + 1 } else { end };

    let mut s = start;
    while s < end && (buf[s] as char).is_ascii_whitespace() {
        s += 1;
    }
    let mut e = end;
    while e > s && (buf[e - 1] as char).is_ascii_whitespace() {
        e -= 1;
    }
    (Line { start: s, end: e }, next_line_start)
}

/// Split a trimmed line into `(keyword, rest)`, where `rest` is the
/// remainder of the line after the first run of whitespace, itself
/// trimmed. Both are returned as byte ranges into `buf`.
fn split_keyword(buf: &[u8], line: &Line) -> ((usize, usize), Option<(usize, usize)>) {
    let mut kw_end = line.start;
    while kw_end < line.end && !(buf[kw_end] as char).is_ascii_whitespace() {
        kw_end += 1;
    }
    let keyword = (line.start, kw_end);

    let mut rest_start = kw_end;
    while rest_start < line.end && (buf[rest_start] as char).is_ascii_whitespace() {
        rest_start += 1;
    }
    if rest_start >= line.end {
        (keyword, None)
    } else {
        (keyword, Some((rest_start, line.end)))
    }
}

/// Split `rest` into `(path, args)`: the first whitespace-delimited token
/// is the path, everything after the following run of whitespace (trimmed
/// at the end already by `trimmed_line`) is the argument string.
fn split_path_args(buf: &[u8], rest: (usize, usize)) -> ((usize, usize), (usize, usize)) {
    let (start, end) = rest;
    let mut path_end = start;
    while path_end < end && !(buf[path_end] as char).is_ascii_whitespace() {
        path_end += 1;
    }
    let path = (start, path_end);

    let mut args_start = path_end;
    while args_start < end && (buf[args_start] as char).is_ascii_whitespace() {
        args_start += 1;
    }
    (path, (args_start, end))
}

/// Parse a decimal byte count, e.g. the argument of a `stack` line.
fn parse_decimal(buf: &[u8], range: (usize, usize)) -> Option<usize> {
    let (start, end) = range;
    if start == end {
        return None;
    }
    let mut value: usize = 0;
    for &b in &buf[start..end] {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as usize)?;
    }
    Some(value)
}

/// Parse `buf` into a populated [`Configuration`], taking ownership of the
/// buffer. Unknown or malformed lines are a [`ConfigError`].
pub fn parse(buf: Vec<u8>) -> Result<Configuration, ConfigError> {
    let mut boot_driver: Option<ComponentDescriptor> = None;
    let mut cpu_driver: Option<ComponentDescriptor> = None;
    let mut modules: Vec<ComponentDescriptor> = Vec::new();
    let mut stack_size: usize = boot_shared::BASE_PAGE_SIZE * 16;

    let mut pos = 0usize;
    while pos < buf.len() {
        let (line, next) = trimmed_line(&buf, pos);
        pos = next;

        if line.start == line.end || buf[line.start] == b'#' {
            continue;
        }

        let ((kw_start, kw_end), rest) = split_keyword(&buf, &line);
        let keyword = &buf[kw_start..kw_end];

        match keyword {
            b"stack" => {
                let rest = rest.ok_or(ConfigError::BadStackSize)?;
                stack_size = parse_decimal(&buf, rest).ok_or(ConfigError::BadStackSize)?;
            }
            b"bootdriver" => {
                if boot_driver.is_some() {
                    return Err(ConfigError::DuplicateDirective);
                }
                let rest = rest.ok_or(ConfigError::MissingPath)?;
                let (path, args) = split_path_args(&buf, rest);
                boot_driver = Some(ComponentDescriptor::new(
                    path.0,
                    path.1 - path.0,
                    args.0,
                    args.1 - args.0,
                ));
            }
            b"cpudriver" => {
                if cpu_driver.is_some() {
                    return Err(ConfigError::DuplicateDirective);
                }
                let rest = rest.ok_or(ConfigError::MissingPath)?;
                let (path, args) = split_path_args(&buf, rest);
                cpu_driver = Some(ComponentDescriptor::new(
                    path.0,
                    path.1 - path.0,
                    args.0,
                    args.1 - args.0,
                ));
            }
            b"module" => {
                let rest = rest.ok_or(ConfigError::MissingPath)?;
                let (path, args) = split_path_args(&buf, rest);
                modules.push(ComponentDescriptor::new(
                    path.0,
                    path.1 - path.0,
                    args.0,
                    args.1 - args.0,
                ));
            }
            _ => return Err(ConfigError::UnknownDirective),
        }
    }

    let boot_driver = boot_driver.ok_or(ConfigError::NoBootDriver)?;
    let cpu_driver = cpu_driver.ok_or(ConfigError::NoCpuDriver)?;

    Ok(Configuration::new(buf, boot_driver, cpu_driver, modules, stack_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    fn cfg_text(s: &str) -> Vec<u8> {
        String::from(s).into_bytes()
    }

    #[test]
    fn parses_minimal_configuration() {
        let buf = cfg_text(
            "# a comment\nbootdriver /boot/bootdriver.elf\ncpudriver /boot/cpudriver.elf loglevel=3\n",
        );
        let cfg = parse(buf).unwrap();
        assert_eq!(cfg.boot_driver.path(&cfg.buf), b"/boot/bootdriver.elf");
        assert_eq!(cfg.boot_driver.args(&cfg.buf), b"");
        assert_eq!(cfg.cpu_driver.path(&cfg.buf), b"/boot/cpudriver.elf");
        assert_eq!(cfg.cpu_driver.args(&cfg.buf), b"loglevel=3");
        assert!(cfg.modules.is_empty());
    }

    #[test]
    fn parses_modules_in_file_order() {
        let buf = cfg_text(
            "bootdriver /b\ncpudriver /c\nmodule /m1 one\nmodule /m2 two\nmodule /m3\n",
        );
        let cfg = parse(buf).unwrap();
        assert_eq!(cfg.modules.len(), 3);
        assert_eq!(cfg.modules[0].path(&cfg.buf), b"/m1");
        assert_eq!(cfg.modules[1].path(&cfg.buf), b"/m2");
        assert_eq!(cfg.modules[2].path(&cfg.buf), b"/m3");
        assert_eq!(cfg.modules[2].args(&cfg.buf), b"");
    }

    #[test]
    fn parses_stack_directive() {
        let buf = cfg_text("stack 1048576\nbootdriver /b\ncpudriver /c\n");
        let cfg = parse(buf).unwrap();
        assert_eq!(cfg.stack_size, 1_048_576);
    }

    #[test]
    fn rejects_unknown_directive() {
        let buf = cfg_text("frobnicate /x\n");
        assert!(matches!(parse(buf), Err(ConfigError::UnknownDirective)));
    }

    #[test]
    fn rejects_missing_boot_driver() {
        let buf = cfg_text("cpudriver /c\n");
        assert!(matches!(parse(buf), Err(ConfigError::NoBootDriver)));
    }

    #[test]
    fn rejects_duplicate_cpu_driver() {
        let buf = cfg_text("bootdriver /b\ncpudriver /c1\ncpudriver /c2\n");
        assert!(matches!(parse(buf), Err(ConfigError::DuplicateDirective)));
    }
}
