// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Test helpers: builds minimal but valid x86-64 shared objects (header,
//! load segment, dynamic section, optional interpreter, string table) so
//! dependency graphs can be fabricated without compiler fixtures.

use std::path::Path;

pub use package_auditor::patcher::testing::RecordingPatcher;

const EHSIZE: usize = 64;
const PHENTSIZE: usize = 56;

const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;

const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_STRTAB: u64 = 5;
const DT_STRSZ: u64 = 10;
const DT_SONAME: u64 = 14;
const DT_RPATH: u64 = 15;
const DT_RUNPATH: u64 = 29;

/// Builds a minimal dynamically linked x86-64 shared object. With an
/// interpreter it is what a PIE executable looks like on disk: ET_DYN plus
/// a PT_INTERP segment.
#[derive(Default)]
pub struct ElfBuilder {
    soname: Option<String>,
    needed: Vec<String>,
    rpath: Option<String>,
    runpath: Option<String>,
    interp: Option<String>,
}

impl ElfBuilder {
    pub fn shared_object() -> Self {
        Self::default()
    }

    pub fn soname(mut self, soname: &str) -> Self {
        self.soname = Some(soname.to_string());
        self
    }

    pub fn needs(mut self, soname: &str) -> Self {
        self.needed.push(soname.to_string());
        self
    }

    pub fn rpath(mut self, rpath: &str) -> Self {
        self.rpath = Some(rpath.to_string());
        self
    }

    pub fn runpath(mut self, runpath: &str) -> Self {
        self.runpath = Some(runpath.to_string());
        self
    }

    pub fn interpreter(mut self, interp: &str) -> Self {
        self.interp = Some(interp.to_string());
        self
    }

    pub fn write_to(&self, path: &Path) {
        std::fs::write(path, self.build()).expect("should write synthetic object");
    }

    fn build(&self) -> Vec<u8> {
        // String table: leading NUL, then every referenced string.
        let mut strtab = vec![0u8];
        let mut offset_of = |s: &str| {
            let offset = strtab.len() as u64;
            strtab.extend_from_slice(s.as_bytes());
            strtab.push(0);
            offset
        };

        let mut dyns: Vec<(u64, u64)> = Vec::new();
        for needed in &self.needed {
            dyns.push((DT_NEEDED, offset_of(needed)));
        }
        if let Some(soname) = &self.soname {
            dyns.push((DT_SONAME, offset_of(soname)));
        }
        if let Some(rpath) = &self.rpath {
            dyns.push((DT_RPATH, offset_of(rpath)));
        }
        if let Some(runpath) = &self.runpath {
            dyns.push((DT_RUNPATH, offset_of(runpath)));
        }

        // The interpreter string sits between the program headers and the
        // dynamic entries, NUL-terminated and padded to keep the entries
        // 8-byte aligned.
        let mut interp_bytes = Vec::new();
        if let Some(interp) = &self.interp {
            interp_bytes.extend_from_slice(interp.as_bytes());
            interp_bytes.push(0);
            interp_bytes.resize(interp_bytes.len().div_ceil(8) * 8, 0);
        }

        let phnum = 2 + usize::from(self.interp.is_some());
        let interp_off = (EHSIZE + phnum * PHENTSIZE) as u64;
        let dyn_off = interp_off + interp_bytes.len() as u64;
        // DT_STRTAB, DT_STRSZ, and the terminator come on top.
        let dyn_size = ((dyns.len() + 3) * 16) as u64;
        let strtab_off = dyn_off + dyn_size;
        dyns.push((DT_STRTAB, strtab_off));
        dyns.push((DT_STRSZ, strtab.len() as u64));
        dyns.push((DT_NULL, 0));

        let total = strtab_off + strtab.len() as u64;
        let mut bytes = Vec::with_capacity(total as usize);

        // ELF header: 64-bit, little-endian, SYSV, ET_DYN, x86-64.
        bytes.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.extend_from_slice(&ET_DYN.to_le_bytes());
        bytes.extend_from_slice(&EM_X86_64.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes()); // e_version
        bytes.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        bytes.extend_from_slice(&(EHSIZE as u64).to_le_bytes()); // e_phoff
        bytes.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        bytes.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        bytes.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
        bytes.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
        bytes.extend_from_slice(&(phnum as u16).to_le_bytes());
        bytes.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
        bytes.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        bytes.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(bytes.len(), EHSIZE);

        // PT_LOAD mapping the whole file at vaddr 0, so virtual addresses
        // equal file offsets.
        Self::program_header(&mut bytes, PT_LOAD, 5, 0, total, 0x1000);
        // PT_DYNAMIC covering the dynamic entries.
        Self::program_header(&mut bytes, PT_DYNAMIC, 6, dyn_off, dyn_size, 8);
        if let Some(interp) = &self.interp {
            Self::program_header(
                &mut bytes,
                PT_INTERP,
                4,
                interp_off,
                (interp.len() + 1) as u64,
                1,
            );
        }

        bytes.extend_from_slice(&interp_bytes);
        for (tag, value) in &dyns {
            bytes.extend_from_slice(&tag.to_le_bytes());
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.extend_from_slice(&strtab);
        assert_eq!(bytes.len() as u64, total);
        bytes
    }

    fn program_header(
        bytes: &mut Vec<u8>,
        p_type: u32,
        p_flags: u32,
        offset: u64,
        size: u64,
        align: u64,
    ) {
        bytes.extend_from_slice(&p_type.to_le_bytes());
        bytes.extend_from_slice(&p_flags.to_le_bytes());
        bytes.extend_from_slice(&offset.to_le_bytes()); // p_offset
        bytes.extend_from_slice(&offset.to_le_bytes()); // p_vaddr
        bytes.extend_from_slice(&offset.to_le_bytes()); // p_paddr
        bytes.extend_from_slice(&size.to_le_bytes()); // p_filesz
        bytes.extend_from_slice(&size.to_le_bytes()); // p_memsz
        bytes.extend_from_slice(&align.to_le_bytes());
    }
}
