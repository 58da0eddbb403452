// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Classifies a package's resolved dependency graphs against the tier
//! catalog, producing one sub-tier per axis and the overall claimable tier.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::elf::{Elf, ElfType};
use crate::package::Package;
use crate::policy::{Policy, PolicyCatalog};
use crate::resolver::{DynamicExecutable, LdPaths, ResolveContext, ResolveError};

type Result<T> = std::result::Result<T, AuditError>;

/// Errors that can occur while auditing a package.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Not even the unconstrained baseline matched an axis. The catalog is
    /// broken; never silently default.
    #[error("No policy matches the {axis} axis")]
    NoMatchingPolicy { axis: &'static str },
    #[error("Failed to resolve dependencies of {path:?}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: ResolveError,
    },
}

/// A tier reference by name and priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tier {
    pub name: String,
    pub priority: i32,
}

impl Tier {
    fn of(policy: &Policy) -> Self {
        Self {
            name: policy.name().to_string(),
            priority: policy.priority(),
        }
    }
}

/// What one tier would still consider external: libraries that would need
/// grafting (soname to resolved real path, `None` if unresolved) and
/// forbidden symbols actually referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalReference {
    pub policy: Tier,
    pub libs: BTreeMap<String, Option<PathBuf>>,
    pub blacklist: BTreeMap<String, BTreeSet<String>>,
}

/// Audit facts for one dynamically linked object in the package.
#[derive(Debug, Clone, Serialize)]
pub struct BinaryAudit {
    pub path: PathBuf,
    pub kind: ElfType,
    /// Whether the object defines the extension-module entry point for its
    /// own name.
    pub is_extension: bool,
    pub tree: DynamicExecutable,
    /// Keyed by policy name, one entry per catalog tier.
    pub external_refs: BTreeMap<String, ExternalReference>,
    /// Required versioned symbols, family to full version strings.
    pub versioned_symbols: BTreeMap<String, BTreeSet<String>>,
    pub uses_narrow_unicode: bool,
    pub references_fpe_guard: bool,
}

/// The scan of one package: every dynamic object with its resolved graph.
/// Expensive to compute, so the [`Auditor`] memoizes it per package root.
#[derive(Debug, Clone, Serialize)]
pub struct PackageScan {
    pub binaries: Vec<BinaryAudit>,
}

/// The outcome of auditing one package.
#[derive(Debug, Clone, Serialize)]
pub struct AuditResult {
    pub overall: Tier,
    pub external_tier: Tier,
    pub symbol_tier: Tier,
    pub encoding_tier: Tier,
    pub forbidden_tier: Tier,
    pub machine_tier: Tier,
    /// Aggregated per policy across all binaries, so a caller can ask what
    /// repairing to any tier would leave external.
    pub external_refs: BTreeMap<String, ExternalReference>,
}

/// Audits packages against one catalog, memoizing the per-package scan.
pub struct Auditor {
    catalog: PolicyCatalog,
    exclude: Vec<String>,
    scans: HashMap<PathBuf, PackageScan>,
}

impl Auditor {
    #[must_use]
    pub fn new(catalog: PolicyCatalog, exclude: Vec<String>) -> Self {
        Self {
            catalog,
            exclude,
            scans: HashMap::new(),
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &PolicyCatalog {
        &self.catalog
    }

    /// The memoized scan of a package. Computed once per package root.
    ///
    /// # Errors
    /// Returns an error if a dynamic object in the package fails to resolve.
    pub fn scan(&mut self, package: &Package) -> Result<&PackageScan> {
        let root = package.root().to_path_buf();
        if !self.scans.contains_key(&root) {
            let scan = scan_package(&self.catalog, &self.exclude, package)?;
            self.scans.insert(root.clone(), scan);
        }
        Ok(&self.scans[&root])
    }

    /// Audit a package: compute all five axis sub-tiers and the overall tier.
    ///
    /// # Errors
    /// Returns an error if the scan fails or no policy matches an axis.
    pub fn audit(&mut self, package: &Package) -> Result<AuditResult> {
        self.scan(package)?;
        let scan = &self.scans[package.root()];
        classify(&self.catalog, scan)
    }
}

fn scan_package(
    catalog: &PolicyCatalog,
    exclude: &[String],
    package: &Package,
) -> Result<PackageScan> {
    let ldpaths = LdPaths::load();
    let mut binaries = package
        .files()
        .par_iter()
        .map(|path| scan_binary(catalog, exclude, &ldpaths, package, path))
        .collect::<Result<Vec<Option<BinaryAudit>>>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    binaries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(PackageScan { binaries })
}

fn scan_binary(
    catalog: &PolicyCatalog,
    exclude: &[String],
    ldpaths: &LdPaths,
    package: &Package,
    path: &Path,
) -> Result<Option<BinaryAudit>> {
    let map_err = |source| AuditError::Resolve {
        path: path.to_path_buf(),
        source,
    };
    let elf = match Elf::from_path(path) {
        Ok(elf) => elf,
        // Most files in a package are not binaries.
        Err(_) => return Ok(None),
    };
    let mut ctx = ResolveContext::with_ld_paths(exclude, ldpaths.clone()).map_err(map_err)?;
    let tree = match ctx.resolve(path) {
        Ok(tree) => tree,
        Err(ResolveError::NotObjectFile { .. }) => return Ok(None),
        Err(e) => return Err(map_err(e)),
    };

    let mut versioned_symbols: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (_, version) in elf.versioned_symbols() {
        let family = version.split('_').next().unwrap_or(version).to_string();
        versioned_symbols.entry(family).or_default().insert(version.clone());
    }

    let external_refs = external_references(catalog, &tree, elf.undefined_symbols(), package);

    let stem = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = stem.split('.').next().unwrap_or(&stem).to_string();

    Ok(Some(BinaryAudit {
        path: path.to_path_buf(),
        kind: elf.kind().clone(),
        is_extension: elf.is_extension_module(&stem),
        external_refs,
        versioned_symbols,
        uses_narrow_unicode: elf.uses_narrow_unicode(),
        references_fpe_guard: elf.references_fpe_guard(),
        tree,
    }))
}

/// Per policy: which libraries in the graph the policy would still consider
/// external, and which forbidden symbols the binary actually references.
fn external_references(
    catalog: &PolicyCatalog,
    tree: &DynamicExecutable,
    undefined_symbols: &HashSet<String>,
    package: &Package,
) -> BTreeMap<String, ExternalReference> {
    let mut refs = BTreeMap::new();
    for policy in catalog.policies() {
        let mut libs = BTreeMap::new();
        let mut blacklist = BTreeMap::new();
        if !policy.is_unconstrained() {
            for soname in transitive_external(tree, policy) {
                let realpath = tree
                    .libraries
                    .get(&soname)
                    .and_then(|library| library.realpath.clone());
                match realpath {
                    // A dependency already shipped inside the package is not
                    // external.
                    Some(realpath) if package.contains(&realpath) => {}
                    other => {
                        libs.insert(soname, other);
                    }
                }
            }
            for (soname, forbidden) in policy.blacklist() {
                if !tree.libraries.contains_key(soname) {
                    continue;
                }
                let offending: BTreeSet<String> = forbidden
                    .iter()
                    .filter(|symbol| undefined_symbols.contains(*symbol))
                    .cloned()
                    .collect();
                if !offending.is_empty() {
                    blacklist.insert(soname.clone(), offending);
                }
            }
        }
        refs.insert(
            policy.name().to_string(),
            ExternalReference {
                policy: Tier::of(policy),
                libs,
                blacklist,
            },
        );
    }
    refs
}

/// The transitive closure of NEEDED libraries the policy does not assume
/// present: starts from the root's direct set, filters out the loader, the
/// managed-runtime library, and the whitelist, and recurses into the
/// survivors' own needed sets.
fn transitive_external(tree: &DynamicExecutable, policy: &Policy) -> BTreeSet<String> {
    let keep = |soname: &str| {
        !Elf::is_loader_soname(soname)
            && !Elf::is_runtime_soname(soname)
            && !policy.whitelist().contains(soname)
    };
    let mut external = BTreeSet::new();
    let mut queue: VecDeque<String> = tree.needed.iter().filter(|s| keep(s)).cloned().collect();
    while let Some(soname) = queue.pop_front() {
        if !external.insert(soname.clone()) {
            continue;
        }
        if let Some(library) = tree.libraries.get(&soname) {
            queue.extend(library.needed.iter().filter(|s| keep(s)).cloned());
        }
    }
    external
}

fn classify(catalog: &PolicyCatalog, scan: &PackageScan) -> Result<AuditResult> {
    let external_tier = external_library_axis(catalog, scan)?;
    let symbol_tier = versioned_symbol_axis(catalog, scan)?;
    let encoding_tier = boolean_axis(catalog, scan.binaries.iter().any(|b| b.uses_narrow_unicode));
    let forbidden_tier = forbidden_symbol_axis(catalog, scan)?;
    let machine_tier = instruction_set_axis(catalog, scan);

    let tiers = [
        &external_tier,
        &symbol_tier,
        &encoding_tier,
        &forbidden_tier,
        &machine_tier,
    ];
    // The package can only claim the weakest guarantee among all axes.
    let overall = tiers
        .iter()
        .min_by_key(|tier| tier.priority)
        .map(|tier| (*tier).clone())
        .ok_or(AuditError::NoMatchingPolicy { axis: "overall" })?;

    Ok(AuditResult {
        overall,
        external_tier,
        symbol_tier,
        encoding_tier,
        forbidden_tier,
        machine_tier,
        external_refs: aggregate_refs(catalog, scan),
    })
}

/// Union of the per-binary external references, per policy.
fn aggregate_refs(catalog: &PolicyCatalog, scan: &PackageScan) -> BTreeMap<String, ExternalReference> {
    let mut refs: BTreeMap<String, ExternalReference> = catalog
        .policies()
        .iter()
        .map(|policy| {
            (
                policy.name().to_string(),
                ExternalReference {
                    policy: Tier::of(policy),
                    libs: BTreeMap::new(),
                    blacklist: BTreeMap::new(),
                },
            )
        })
        .collect();
    for binary in &scan.binaries {
        for (name, reference) in &binary.external_refs {
            let Some(merged) = refs.get_mut(name) else {
                continue;
            };
            for (soname, realpath) in &reference.libs {
                // A resolved path wins over an unresolved sighting of the
                // same soname, whichever binary reported it first.
                match merged.libs.get_mut(soname) {
                    Some(existing) => {
                        if existing.is_none() {
                            existing.clone_from(realpath);
                        }
                    }
                    None => {
                        merged.libs.insert(soname.clone(), realpath.clone());
                    }
                }
            }
            for (soname, symbols) in &reference.blacklist {
                merged
                    .blacklist
                    .entry(soname.clone())
                    .or_default()
                    .extend(symbols.iter().cloned());
            }
        }
    }
    refs
}

fn external_library_axis(catalog: &PolicyCatalog, scan: &PackageScan) -> Result<Tier> {
    catalog
        .policies()
        .iter()
        .find(|policy| {
            scan.binaries.iter().all(|binary| {
                binary
                    .external_refs
                    .get(policy.name())
                    .is_some_and(|reference| reference.libs.is_empty())
            })
        })
        .map(Tier::of)
        .ok_or(AuditError::NoMatchingPolicy {
            axis: "external-library",
        })
}

fn versioned_symbol_axis(catalog: &PolicyCatalog, scan: &PackageScan) -> Result<Tier> {
    let mut required: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for binary in &scan.binaries {
        for (family, versions) in &binary.versioned_symbols {
            required
                .entry(family.clone())
                .or_default()
                .extend(versions.iter().cloned());
        }
    }
    catalog
        .policies()
        .iter()
        .find(|policy| policy.satisfies_symbol_versions(&required))
        .map(Tier::of)
        .ok_or(AuditError::NoMatchingPolicy {
            axis: "versioned-symbol",
        })
}

/// Presence of the offending usage pins the sub-tier to the unconstrained
/// baseline; absence allows the most restrictive tier.
fn boolean_axis(catalog: &PolicyCatalog, offends: bool) -> Tier {
    if offends {
        Tier::of(catalog.baseline())
    } else {
        Tier::of(catalog.highest())
    }
}

fn forbidden_symbol_axis(catalog: &PolicyCatalog, scan: &PackageScan) -> Result<Tier> {
    if scan.binaries.iter().any(|binary| binary.references_fpe_guard) {
        return Ok(Tier::of(catalog.baseline()));
    }
    catalog
        .policies()
        .iter()
        .find(|policy| {
            scan.binaries.iter().all(|binary| {
                binary
                    .external_refs
                    .get(policy.name())
                    .is_some_and(|reference| reference.blacklist.is_empty())
            })
        })
        .map(Tier::of)
        .ok_or(AuditError::NoMatchingPolicy {
            axis: "forbidden-symbol",
        })
}

fn instruction_set_axis(catalog: &PolicyCatalog, scan: &PackageScan) -> Tier {
    let target = catalog.architecture();
    let compatible = |platform: &crate::elf::Platform| {
        let baseline_ok = platform
            .baseline_architecture()
            .is_none_or(|arch| arch == target.baseline());
        let extension_ok = platform
            .extended_architecture()
            .is_none_or(|arch| target.is_superset(arch));
        baseline_ok && extension_ok
    };
    let offends = scan.binaries.iter().any(|binary| {
        !compatible(&binary.tree.platform)
            || binary.tree.libraries.values().any(|library| {
                library
                    .platform
                    .as_ref()
                    .is_some_and(|platform| !compatible(platform))
            })
    });
    boolean_axis(catalog, offends)
}
