// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Host C-library detection. Which tier catalog applies depends on whether
//! the system links against glibc or musl, and for musl on the exact version
//! baked into the libc binary.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// The C library family the host system is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Libc {
    Gnu,
    Musl,
}

impl Libc {
    /// Detect the host C library. Musl installs exactly one
    /// `/lib/libc.musl-<arch>.so.1`; anything else is treated as glibc.
    #[must_use]
    pub fn detect() -> Libc {
        if find_musl_libc().is_some() {
            Libc::Musl
        } else {
            Libc::Gnu
        }
    }
}

impl fmt::Display for Libc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Libc::Gnu => "glibc",
            Libc::Musl => "musl",
        })
    }
}

/// A musl version as embedded in the libc binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MuslVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// The single musl libc on the host, if there is exactly one.
#[must_use]
pub fn find_musl_libc() -> Option<PathBuf> {
    let mut matches = glob::glob("/lib/libc.musl-*.so.1").ok()?.flatten();
    let first = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    Some(first)
}

/// Read the version out of a musl libc binary. Musl embeds its version as a
/// NUL-terminated `major.minor.patch` string.
#[must_use]
pub fn musl_version(libc_path: &Path) -> Option<MuslVersion> {
    let bytes = fs::read(libc_path).ok()?;
    scan_version(&bytes)
}

/// The version of the detected host musl libc.
#[must_use]
pub fn host_musl_version() -> Option<MuslVersion> {
    musl_version(&find_musl_libc()?)
}

/// Find the first `<digits>.<digits>.<digits>\0` sequence that is not part
/// of a longer dotted run.
fn scan_version(bytes: &[u8]) -> Option<MuslVersion> {
    let mut offset = 0;
    while offset < bytes.len() {
        let preceded_by_part = offset > 0
            && (bytes[offset - 1] == b'.' || bytes[offset - 1].is_ascii_digit());
        if bytes[offset].is_ascii_digit() && !preceded_by_part {
            if let Some(version) = parse_version_at(&bytes[offset..]) {
                return Some(version);
            }
        }
        offset += 1;
    }
    None
}

fn parse_version_at(bytes: &[u8]) -> Option<MuslVersion> {
    let mut rest = bytes;
    let mut parts = [0u32; 3];
    for (index, part) in parts.iter_mut().enumerate() {
        let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        *part = std::str::from_utf8(&rest[..digits]).ok()?.parse().ok()?;
        rest = &rest[digits..];
        let expected = if index < 2 { b'.' } else { b'\0' };
        if rest.first() != Some(&expected) {
            return None;
        }
        rest = &rest[1..];
    }
    Some(MuslVersion {
        major: parts[0],
        minor: parts[1],
        patch: parts[2],
    })
}
