// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Repair engine: grafts the libraries a target tier still considers
//! external into the package and relinks every consumer, including the
//! grafted copies themselves, to the new identities.

mod graft;

use dashmap::DashMap;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::elf::{Elf, ElfError};
use crate::package::Package;
use crate::patcher::{strip_symbols, Patcher, PatcherError};
use crate::policy::audit::{Auditor, AuditError, BinaryAudit};
use crate::policy::{Policy, PolicyError};
use crate::resolver::expand_path_entry;

/// Result type for repair operations.
pub type RepairResult<T> = std::result::Result<T, RepairError>;

/// Errors that can occur while repairing a package. All of these abort the
/// repair with no partial output promise.
#[derive(Debug, Error)]
pub enum RepairError {
    #[error("Audit failed: {0}")]
    Audit(#[from] AuditError),
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),
    #[error("Patcher error: {0}")]
    Patcher(#[from] PatcherError),
    #[error("Elf error: {0}")]
    Elf(#[from] ElfError),
    /// Grafting cannot copy a file that was never found.
    #[error("Cannot repair {consumer:?}: {soname} could not be resolved to any real path")]
    UnresolvedLibrary { soname: String, consumer: PathBuf },
    #[error("Failed to copy {src:?} to {dest:?}")]
    CopyFailed {
        src: PathBuf,
        dest: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to relocate script executable: {path:?}")]
    ShimFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to update package tags: {path:?}")]
    TagUpdateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Options controlling a repair run.
#[derive(Debug, Clone, Default)]
pub struct RepairOptions {
    /// Strip symbol tables from grafted copies and processed consumers.
    pub strip: bool,
    /// Rewrite the package tag metadata to claim the target tier.
    pub update_tags: bool,
}

/// Repair a package to the target tier.
///
/// Returns `None` without touching anything when the tier's external
/// reference set is already empty, the package root otherwise.
///
/// # Errors
/// Returns an error if an external library is unresolved or a delegated tool
/// fails; both abort the whole repair.
pub fn repair(
    auditor: &mut Auditor,
    package: &Package,
    target: &str,
    patcher: &dyn Patcher,
    options: &RepairOptions,
) -> RepairResult<Option<PathBuf>> {
    let policy = auditor.catalog().find(target)?.clone();
    let scan = auditor.scan(package)?;

    let consumers: Vec<&BinaryAudit> = scan
        .binaries
        .iter()
        .filter(|binary| {
            binary
                .external_refs
                .get(policy.name())
                .is_some_and(|reference| !reference.libs.is_empty())
        })
        .collect();
    if consumers.is_empty() {
        return Ok(None);
    }

    // Check resolvability up front so a doomed repair does not graft half a
    // package first.
    for binary in &consumers {
        if let Some(reference) = binary.external_refs.get(policy.name()) {
            for (soname, realpath) in &reference.libs {
                if realpath.is_none() {
                    return Err(RepairError::UnresolvedLibrary {
                        soname: soname.clone(),
                        consumer: binary.path.clone(),
                    });
                }
            }
        }
    }

    let libs_dir = package.libs_dir();
    // Keyed by source path: two consumers needing the same library share one
    // copy, and the second caller waits for the first to finish.
    let copies: DashMap<PathBuf, (String, PathBuf)> = DashMap::new();
    let renames: DashMap<String, String> = DashMap::new();

    let processed = consumers
        .par_iter()
        .map(|binary| process_consumer(binary, &policy, package, &libs_dir, &copies, &renames, patcher))
        .collect::<RepairResult<Vec<PathBuf>>>()?;

    // All renames are known only now; grafted libraries may depend on each
    // other and get their references fixed as a second pass.
    fix_cross_references(&copies, &renames, patcher)?;

    if options.strip {
        let grafted = copies.iter().map(|entry| entry.value().1.clone());
        for file in processed.iter().cloned().chain(grafted) {
            if let Err(e) = strip_symbols(&file) {
                eprintln!("Warning: failed to strip {}: {e}", file.display());
            }
        }
    }

    if options.update_tags {
        update_tags(package, &policy)?;
    }

    Ok(Some(package.root().to_path_buf()))
}

/// Graft one consumer's external libraries and relink it. Returns the path
/// of the processed binary, which differs from the input when the consumer
/// was a script-layout executable and had to move behind a shim.
fn process_consumer(
    binary: &BinaryAudit,
    policy: &Policy,
    package: &Package,
    libs_dir: &Path,
    copies: &DashMap<PathBuf, (String, PathBuf)>,
    renames: &DashMap<String, String>,
    patcher: &dyn Patcher,
) -> RepairResult<PathBuf> {
    let mut consumer = binary.path.clone();
    // Anything with an interpreter in the script layout moves behind a shim;
    // PIE executables are ET_DYN, so the ELF type is no signal here.
    let is_script = binary.tree.interpreter.is_some()
        && package
            .data_scripts_dir()
            .is_some_and(|scripts| consumer.starts_with(&scripts));
    if is_script {
        consumer = graft::relocate_script(&consumer, package)?;
    }

    let mut replacements = Vec::new();
    if let Some(reference) = binary.external_refs.get(policy.name()) {
        for (soname, realpath) in &reference.libs {
            let Some(src) = realpath else {
                return Err(RepairError::UnresolvedLibrary {
                    soname: soname.clone(),
                    consumer: binary.path.clone(),
                });
            };
            let copy = copies
                .entry(src.clone())
                .or_try_insert_with(|| graft::copylib(src, libs_dir, patcher))?;
            let new_soname = copy.value().0.clone();
            drop(copy);
            renames.insert(soname.clone(), new_soname.clone());
            replacements.push((soname.clone(), new_soname));
        }
    }

    patcher.replace_needed(&consumer, &replacements)?;
    append_rpath(&consumer, libs_dir, package, patcher)?;
    Ok(consumer)
}

/// Append a `$ORIGIN`-relative entry pointing at the library directory,
/// preserving existing entries that still resolve inside the package.
/// Duplicates collapse, order is kept, the new entry goes last.
fn append_rpath(
    consumer: &Path,
    libs_dir: &Path,
    package: &Package,
    patcher: &dyn Patcher,
) -> RepairResult<()> {
    let origin = consumer.parent().unwrap_or_else(|| Path::new("/"));
    let existing = patcher.get_rpath(consumer)?;

    let mut entries: Vec<String> = Vec::new();
    for entry in existing.split(':').filter(|entry| !entry.is_empty()) {
        let Some(expanded) = expand_path_entry(entry, Some(origin)) else {
            continue;
        };
        if package.contains(&expanded) && !entries.iter().any(|kept| kept == entry) {
            entries.push(entry.to_string());
        }
    }
    let new_entry = origin_relative_entry(origin, libs_dir, package.root());
    if !entries.contains(&new_entry) {
        entries.push(new_entry);
    }
    patcher.set_rpath(consumer, &entries.join(":"))?;
    Ok(())
}

/// `$ORIGIN/..{/..}/<libs dir>` from a binary's directory, both under root.
fn origin_relative_entry(origin: &Path, libs_dir: &Path, root: &Path) -> String {
    let ups = origin
        .strip_prefix(root)
        .map(|rest| rest.components().count())
        .unwrap_or(0);
    let mut entry = PathBuf::from("$ORIGIN");
    for _ in 0..ups {
        entry.push("..");
    }
    match libs_dir.strip_prefix(root) {
        Ok(down) => entry.push(down),
        Err(_) => entry.push(libs_dir),
    }
    entry.to_string_lossy().to_string()
}

/// Rewrite the NEEDED tables of the grafted copies themselves wherever they
/// reference another library that was renamed during this repair.
fn fix_cross_references(
    copies: &DashMap<PathBuf, (String, PathBuf)>,
    renames: &DashMap<String, String>,
    patcher: &dyn Patcher,
) -> RepairResult<()> {
    for copy in copies.iter() {
        let (_, copy_path) = copy.value();
        let elf = Elf::from_path(copy_path)?;
        let replacements: Vec<(String, String)> = elf
            .needed()
            .iter()
            .filter_map(|needed| {
                renames
                    .get(needed)
                    .map(|new_soname| (needed.clone(), new_soname.value().clone()))
            })
            .collect();
        patcher.replace_needed(copy_path, &replacements)?;
    }
    Ok(())
}

/// Replace the platform component of every tag line in the metadata file
/// with the achieved tier name and its aliases.
fn update_tags(package: &Package, policy: &Policy) -> RepairResult<()> {
    let Some(dist_info) = package.dist_info_dir() else {
        return Ok(());
    };
    let wheel_file = dist_info.join("WHEEL");
    if !wheel_file.exists() {
        return Ok(());
    }
    let tag_err = |e| RepairError::TagUpdateFailed {
        path: wheel_file.clone(),
        source: e,
    };
    let content = fs::read_to_string(&wheel_file).map_err(tag_err)?;

    let mut platforms: Vec<&str> = vec![policy.name()];
    platforms.extend(policy.aliases().iter().map(String::as_str));

    let mut lines = Vec::new();
    let mut seen = BTreeSet::new();
    for line in content.lines() {
        match line.strip_prefix("Tag: ") {
            Some(tag) => {
                let mut parts = tag.splitn(3, '-');
                let (Some(py), Some(abi), Some(_)) = (parts.next(), parts.next(), parts.next())
                else {
                    lines.push(line.to_string());
                    continue;
                };
                for platform in &platforms {
                    let tagged = format!("Tag: {py}-{abi}-{platform}");
                    if seen.insert(tagged.clone()) {
                        lines.push(tagged);
                    }
                }
            }
            None => lines.push(line.to_string()),
        }
    }
    fs::write(&wheel_file, lines.join("\n") + "\n").map_err(tag_err)?;
    Ok(())
}
