// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Parses ELF files to extract dynamic linkage facts: `DT_NEEDED`, `RPATH`/`RUNPATH`,
//! soname, interpreter, versioned-symbol requirements, and symbol tables. Uses the
//! `goblin` crate for ELF parsing.

use goblin::elf::Elf as GoblinElf;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::arch::Architecture;

type Result<T> = std::result::Result<T, ElfError>;

/// Errors that can occur when parsing ELF files.
#[derive(Debug, Error)]
pub enum ElfError {
    #[error("File is too small to be an ELF file: {path:?}")]
    FileTooSmall { path: PathBuf },
    #[error("File is not an ELF file: {path:?}")]
    NotElfFile { path: PathBuf },
    #[error("Failed to open file: {path:?}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read file: {path:?}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse ELF file: {path:?}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: goblin::error::Error,
    },
    #[error("Unknown ELF type in file: {path:?}")]
    UnknownElfType { path: PathBuf },
}

/// ELF file type (wrapper around `goblin::elf::header::e_type`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ElfType {
    None,
    Relocatable,
    Executable,
    SharedObject,
    Core,
}

// e_machine values not exported by goblin.
const EM_LOONGARCH: u16 = 258;

// GNU property note constants, see the Linux gABI extensions.
const NT_GNU_PROPERTY_TYPE_0: u32 = 5;
const GNU_PROPERTY_X86_ISA_1_NEEDED: u32 = 0xc000_8002;

// ARM e_flags bits used to validate armv7l objects.
const EF_ARM_EABIMASK: u32 = 0xff00_0000;
const EF_ARM_EABI_VER5: u32 = 0x0500_0000;
const EF_ARM_ABI_FLOAT_HARD: u32 = 0x0000_0400;

/// ELF identity facts used to decide whether two objects can link together
/// at run time: OS/ABI, word size, endianness, and machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Platform {
    osabi: u8,
    is_64: bool,
    little_endian: bool,
    machine: u16,
    base_arch: Option<Architecture>,
    ext_arch: Option<Architecture>,
}

impl Platform {
    /// Whether a library with platform `other` could be loaded alongside `self`.
    ///
    /// OS/ABI `NONE`/`SYSV` (0) and `GNU`/`LINUX` (3) are mutually compatible;
    /// word size, endianness, and machine must match exactly.
    #[must_use]
    pub fn is_compatible(&self, other: &Platform) -> bool {
        let abi_compatible = self.osabi == other.osabi
            || (matches!(self.osabi, 0 | 3) && matches!(other.osabi, 0 | 3));
        abi_compatible
            && self.is_64 == other.is_64
            && self.little_endian == other.little_endian
            && self.machine == other.machine
    }

    /// The baseline architecture, if the machine/class/endianness triple maps
    /// to one we support.
    #[must_use]
    pub fn baseline_architecture(&self) -> Option<Architecture> {
        self.base_arch
    }

    /// The extended instruction-set architecture required by the object, read
    /// from the GNU property note. `None` means the baseline suffices.
    #[must_use]
    pub fn extended_architecture(&self) -> Option<Architecture> {
        self.ext_arch
    }
}

/// Parsed dynamic-linkage information for one ELF file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Elf {
    kind: ElfType,
    soname: Option<String>,
    interpreter: Option<String>,
    needed: Vec<String>,
    rpath: Vec<String>,
    runpath: Vec<String>,
    platform: Platform,
    is_dynamic: bool,
    versioned_symbols: Vec<(String, String)>,
    undefined_symbols: HashSet<String>,
    undefined_functions: HashSet<String>,
    defined_functions: HashSet<String>,
}

impl Elf {
    /// Parse an ELF file from a path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not an ELF file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = Self::read(path)?;
        Self::parse(path, &bytes)
    }

    /// Get the ELF file type (executable, shared object, etc.).
    #[must_use]
    pub fn kind(&self) -> &ElfType {
        &self.kind
    }

    /// The soname the object advertises (`DT_SONAME`), if any.
    #[must_use]
    pub fn soname(&self) -> Option<&str> {
        self.soname.as_deref()
    }

    /// The runtime interpreter path (`PT_INTERP`), if any.
    #[must_use]
    pub fn interpreter(&self) -> Option<&str> {
        self.interpreter.as_deref()
    }

    /// Get the list of dynamic dependencies (`DT_NEEDED` entries).
    #[must_use]
    pub fn needed(&self) -> &[String] {
        &self.needed
    }

    /// Get the raw RPATH entries (colon-split, unexpanded).
    #[must_use]
    pub fn rpath(&self) -> &[String] {
        &self.rpath
    }

    /// Get the raw RUNPATH entries (colon-split, unexpanded).
    #[must_use]
    pub fn runpath(&self) -> &[String] {
        &self.runpath
    }

    /// Get the ELF platform identity.
    #[must_use]
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Whether the object carries a dynamic section at all.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }

    /// Versioned-symbol requirements as `(dependency, version)` pairs, e.g.
    /// `("libc.so.6", "GLIBC_2.17")`. Requirements against the loader itself
    /// are filtered out.
    #[must_use]
    pub fn versioned_symbols(&self) -> &[(String, String)] {
        &self.versioned_symbols
    }

    /// Undefined dynamic symbols (all types).
    #[must_use]
    pub fn undefined_symbols(&self) -> &HashSet<String> {
        &self.undefined_symbols
    }

    /// Undefined dynamic symbols of function (or untyped) kind.
    #[must_use]
    pub fn undefined_functions(&self) -> &HashSet<String> {
        &self.undefined_functions
    }

    /// Whether this object defines the extension-module entry point for the
    /// given module stem (the file name up to the first dot).
    #[must_use]
    pub fn is_extension_module(&self, stem: &str) -> bool {
        [
            format!("PyInit_{stem}"),
            format!("init{stem}"),
            format!("_cffi_pypyinit_{stem}"),
        ]
        .iter()
        .any(|entry| self.defined_functions.contains(entry))
    }

    /// Whether the object references narrow-unicode (UCS-2) runtime symbols.
    #[must_use]
    pub fn uses_narrow_unicode(&self) -> bool {
        self.undefined_functions
            .iter()
            .any(|name| name.starts_with("PyUnicodeUCS2_"))
    }

    /// Whether the object references the legacy FPE guard symbols.
    #[must_use]
    pub fn references_fpe_guard(&self) -> bool {
        ["PyFPE_jbuf", "PyFPE_dummy", "PyFPE_counter"]
            .iter()
            .any(|name| self.undefined_functions.contains(*name))
    }

    /// Whether a soname names the dynamic loader itself.
    #[must_use]
    pub fn is_loader_soname(soname: &str) -> bool {
        soname.contains("ld-linux")
            || soname.starts_with("ld-musl-")
            || soname == "ld64.so.2"
            || soname == "ld64.so.1"
    }

    /// Whether a soname names the managed-runtime library (always assumed
    /// present, never grafted).
    #[must_use]
    pub fn is_runtime_soname(soname: &str) -> bool {
        // libpythonX.Y[m].so[.N]
        let Some(rest) = soname.strip_prefix("libpython") else {
            return false;
        };
        let Some(dot) = rest.find(".so") else {
            return false;
        };
        let version = rest[..dot].trim_end_matches('m');
        let mut parts = version.splitn(2, '.');
        let major_minor_numeric = |s: Option<&str>| {
            s.is_some_and(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
        };
        major_minor_numeric(parts.next()) && major_minor_numeric(parts.next())
    }

    /// Reads the entire file at path into bytes if the file is an ELF file.
    ///
    /// # Errors
    /// Returns an error if the file is not an ELF file or cannot be read.
    fn read(path: &Path) -> Result<Vec<u8>> {
        // ELF magic bytes: 0x7f followed by ASCII "ELF".
        const ELF_MAGIC: [u8; 4] = [0x7f, 0x45, 0x4c, 0x46];

        let metadata = fs::metadata(path).map_err(|e| ElfError::OpenFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        // Skip files that are too small to be ELF (must be at least ELF header size)
        if metadata.len() < 64 {
            return Err(ElfError::FileTooSmall {
                path: path.to_path_buf(),
            });
        }

        let mut file = fs::File::open(path).map_err(|e| ElfError::OpenFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|e| ElfError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        if bytes[..4] != ELF_MAGIC {
            return Err(ElfError::NotElfFile {
                path: path.to_path_buf(),
            });
        }

        Ok(bytes)
    }

    fn parse(path: &Path, bytes: &[u8]) -> Result<Self> {
        let elf = GoblinElf::parse(bytes).map_err(|e| ElfError::ParseFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        let kind = match elf.header.e_type {
            goblin::elf::header::ET_NONE => ElfType::None,
            goblin::elf::header::ET_REL => ElfType::Relocatable,
            goblin::elf::header::ET_EXEC => ElfType::Executable,
            goblin::elf::header::ET_DYN => ElfType::SharedObject,
            goblin::elf::header::ET_CORE => ElfType::Core,
            _ => {
                return Err(ElfError::UnknownElfType {
                    path: path.to_path_buf(),
                });
            }
        };

        let mut soname = None;
        let mut needed = Vec::new();
        let mut rpath = Vec::new();
        let mut runpath = Vec::new();

        if let Some(dynamic) = &elf.dynamic {
            for dyn_entry in &dynamic.dyns {
                let Ok(strtab_idx) = usize::try_from(dyn_entry.d_val) else {
                    continue;
                };
                match dyn_entry.d_tag {
                    goblin::elf::dynamic::DT_NEEDED => {
                        if let Some(dep_name) = elf.dynstrtab.get_at(strtab_idx) {
                            needed.push(dep_name.to_string());
                        }
                    }
                    goblin::elf::dynamic::DT_SONAME => {
                        if let Some(name) = elf.dynstrtab.get_at(strtab_idx) {
                            soname = Some(name.to_string());
                        }
                    }
                    goblin::elf::dynamic::DT_RPATH => {
                        if let Some(rpath_str) = elf.dynstrtab.get_at(strtab_idx) {
                            rpath.extend(
                                rpath_str
                                    .split(':')
                                    .filter(|s| !s.is_empty())
                                    .map(str::to_string),
                            );
                        }
                    }
                    goblin::elf::dynamic::DT_RUNPATH => {
                        if let Some(runpath_str) = elf.dynstrtab.get_at(strtab_idx) {
                            runpath.extend(
                                runpath_str
                                    .split(':')
                                    .filter(|s| !s.is_empty())
                                    .map(str::to_string),
                            );
                        }
                    }
                    _ => {}
                }
            }
        }

        let platform = Self::parse_platform(&elf, bytes);
        let versioned_symbols = Self::parse_versioned_symbols(&elf);
        let (undefined_symbols, undefined_functions, defined_functions) =
            Self::parse_symbols(&elf);

        Ok(Self {
            kind,
            soname,
            interpreter: elf.interpreter.map(str::to_string),
            needed,
            rpath,
            runpath,
            platform,
            is_dynamic: elf.dynamic.is_some(),
            versioned_symbols,
            undefined_symbols,
            undefined_functions,
            defined_functions,
        })
    }

    fn parse_platform(elf: &GoblinElf, bytes: &[u8]) -> Platform {
        let machine = elf.header.e_machine;
        let is_64 = elf.is_64;
        let little_endian = elf.little_endian;
        let flags = elf.header.e_flags;

        use goblin::elf::header::{EM_386, EM_AARCH64, EM_ARM, EM_PPC64, EM_RISCV, EM_S390, EM_X86_64};
        let mut base_arch = match (machine, is_64, little_endian) {
            (EM_386, false, true) => Some(Architecture::I686),
            (EM_X86_64, true, true) => Some(Architecture::X86_64),
            (EM_PPC64, true, true) => Some(Architecture::Ppc64le),
            (EM_PPC64, true, false) => Some(Architecture::Ppc64),
            (EM_RISCV, true, true) => Some(Architecture::Riscv64),
            (EM_AARCH64, true, true) => Some(Architecture::Aarch64),
            (EM_S390, true, false) => Some(Architecture::S390x),
            (EM_ARM, false, true) => Some(Architecture::Armv7l),
            (EM_LOONGARCH, true, true) => Some(Architecture::Loongarch64),
            _ => None,
        };

        let mut ext_arch = None;
        match base_arch {
            Some(Architecture::X86_64) => {
                ext_arch = Self::parse_x86_isa_needed(elf, bytes);
            }
            Some(Architecture::Armv7l) => {
                // armv7l objects must be EABI v5 hard-float.
                if (flags & EF_ARM_EABIMASK) != EF_ARM_EABI_VER5
                    || (flags & EF_ARM_ABI_FLOAT_HARD) != EF_ARM_ABI_FLOAT_HARD
                {
                    base_arch = None;
                }
            }
            _ => {}
        }

        Platform {
            osabi: elf.header.e_ident[goblin::elf::header::EI_OSABI],
            is_64,
            little_endian,
            machine,
            base_arch,
            ext_arch,
        }
    }

    /// Read the x86-64 microarchitecture level the object requires from the
    /// `GNU_PROPERTY_X86_ISA_1_NEEDED` property note, if present.
    fn parse_x86_isa_needed(elf: &GoblinElf, bytes: &[u8]) -> Option<Architecture> {
        let notes = elf.iter_note_sections(bytes, Some(".note.gnu.property"))?;
        for note in notes.flatten() {
            if note.n_type != NT_GNU_PROPERTY_TYPE_0 || note.name != "GNU" {
                continue;
            }
            // The descriptor is a sequence of (pr_type, pr_datasz, data)
            // records, each padded to an 8-byte boundary on 64-bit.
            let desc = note.desc;
            let mut offset = 0;
            while offset + 8 <= desc.len() {
                let pr_type = u32::from_le_bytes(desc[offset..offset + 4].try_into().ok()?);
                let pr_datasz =
                    u32::from_le_bytes(desc[offset + 4..offset + 8].try_into().ok()?) as usize;
                let data_start = offset + 8;
                if data_start + pr_datasz > desc.len() {
                    break;
                }
                if pr_type == GNU_PROPERTY_X86_ISA_1_NEEDED && pr_datasz == 4 {
                    let mut isa =
                        u32::from_le_bytes(desc[data_start..data_start + 4].try_into().ok()?);
                    isa &= !1; // clear the baseline bit
                    if isa & 8 == 8 {
                        return Some(Architecture::X86_64V4);
                    }
                    if isa & 4 == 4 {
                        return Some(Architecture::X86_64V3);
                    }
                    if isa & 2 == 2 {
                        return Some(Architecture::X86_64V2);
                    }
                }
                offset = data_start + pr_datasz.div_ceil(8) * 8;
            }
        }
        None
    }

    fn parse_versioned_symbols(elf: &GoblinElf) -> Vec<(String, String)> {
        let mut result = Vec::new();
        if let Some(verneed) = &elf.verneed {
            for need in verneed.iter() {
                let Some(dep) = elf.dynstrtab.get_at(need.vn_file) else {
                    continue;
                };
                if Self::is_loader_soname(dep) {
                    continue;
                }
                for aux in need.iter() {
                    if let Some(version) = elf.dynstrtab.get_at(aux.vna_name) {
                        result.push((dep.to_string(), version.to_string()));
                    }
                }
            }
        }
        result
    }

    fn parse_symbols(elf: &GoblinElf) -> (HashSet<String>, HashSet<String>, HashSet<String>) {
        const STT_NOTYPE: u8 = 0;
        const STT_FUNC: u8 = 2;

        let mut undefined = HashSet::new();
        let mut undefined_functions = HashSet::new();
        let mut defined_functions = HashSet::new();
        for sym in elf.dynsyms.iter() {
            let Some(name) = elf.dynstrtab.get_at(sym.st_name) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let st_type = sym.st_info & 0xf;
            if sym.st_shndx == 0 {
                undefined.insert(name.to_string());
                if st_type == STT_FUNC || st_type == STT_NOTYPE {
                    undefined_functions.insert(name.to_string());
                }
            } else if st_type == STT_FUNC {
                defined_functions.insert(name.to_string());
            }
        }
        (undefined, undefined_functions, defined_functions)
    }
}
