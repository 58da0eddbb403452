// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! A tool for auditing and repairing binary packages for cross-system
//! compatibility.
//!
//! This crate provides functionality to:
//! - Parse ELF binaries and resolve their dependency trees the way the
//!   runtime loader would
//! - Classify a package against an ordered catalog of compatibility tiers
//! - Graft external libraries into the package and relink consumers so a
//!   higher tier can be claimed

pub mod arch;
pub mod console;
pub mod elf;
pub mod package;
pub mod patcher;
pub mod policy;
pub mod repair;
pub mod resolver;

// Re-export key types for convenience
pub use arch::Architecture;
pub use elf::{Elf, ElfType};
pub use package::Package;
pub use patcher::{Patchelf, Patcher};
pub use policy::audit::{AuditResult, Auditor};
pub use policy::{Policy, PolicyCatalog};
pub use repair::{repair, RepairOptions};
pub use resolver::{DynamicExecutable, DynamicLibrary, ResolveContext};
