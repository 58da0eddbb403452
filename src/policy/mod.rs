// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Compatibility-tier catalog: loads the policy JSON, narrows it to one
//! architecture, and validates the containment invariant between tiers.

pub mod audit;
pub mod libc;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::arch::Architecture;
use libc::{Libc, MuslVersion};

const DEFAULT_CATALOG: &str = include_str!("manylinux-policy.json");
const MUSL_CATALOG: &str = include_str!("musllinux-policy.json");

type Result<T> = std::result::Result<T, PolicyError>;

/// Errors that can occur while loading or querying the policy catalog.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Failed to read policy catalog: {path:?}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse policy catalog")]
    ParseFailed {
        #[source]
        source: serde_json::Error,
    },
    #[error("Policy catalog has no unconstrained baseline tier (priority 0)")]
    MissingBaseline,
    #[error("Could not determine the musl libc version")]
    UnknownMuslVersion,
    #[error("Policy catalog defines no tiers for architecture {architecture}")]
    NoPoliciesForArchitecture { architecture: Architecture },
    #[error(
        "Policy catalog violates containment: {lower} must include everything {higher} allows \
         ({detail})"
    )]
    ContainmentViolation {
        higher: String,
        lower: String,
        detail: String,
    },
    #[error("Unknown policy: {name}")]
    UnknownPolicy { name: String },
}

/// One tier record as stored in the catalog file, covering all architectures.
#[derive(Debug, Deserialize)]
struct RawPolicy {
    name: String,
    #[serde(default)]
    aliases: Vec<String>,
    priority: i32,
    #[serde(default)]
    symbol_versions: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    #[serde(default)]
    lib_whitelist: BTreeSet<String>,
    #[serde(default)]
    blacklist: BTreeMap<String, BTreeSet<String>>,
}

/// One compatibility tier, narrowed to a single architecture. Higher priority
/// means a more portable, more restrictive tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    name: String,
    aliases: Vec<String>,
    priority: i32,
    /// Symbol-version ceilings in full form, e.g. `"GLIBC"` mapping to
    /// `{"GLIBC_2.5", "GLIBC_2.17"}`.
    ceilings: BTreeMap<String, BTreeSet<String>>,
    whitelist: BTreeSet<String>,
    blacklist: BTreeMap<String, BTreeSet<String>>,
}

impl Policy {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// The priority-0 baseline accepts anything; its whitelist and ceilings
    /// are vacuous.
    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        self.priority == 0
    }

    #[must_use]
    pub fn whitelist(&self) -> &BTreeSet<String> {
        &self.whitelist
    }

    #[must_use]
    pub fn blacklist(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.blacklist
    }

    #[must_use]
    pub fn matches_name(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|alias| alias == name)
    }

    /// Whether the required versioned symbols stay within this tier's
    /// ceilings. Only symbol families the tier has an opinion on are checked.
    #[must_use]
    pub fn satisfies_symbol_versions(
        &self,
        required: &BTreeMap<String, BTreeSet<String>>,
    ) -> bool {
        required.iter().all(|(family, versions)| {
            self.ceilings
                .get(family)
                .is_none_or(|allowed| versions.is_subset(allowed))
        })
    }
}

/// The ordered tier catalog for one architecture, most restrictive first.
#[derive(Debug, Clone)]
pub struct PolicyCatalog {
    architecture: Architecture,
    policies: Vec<Policy>,
}

impl PolicyCatalog {
    /// Load the embedded catalog matching the host C library: the glibc
    /// tiers on glibc systems, the musl tiers on musl systems.
    ///
    /// # Errors
    /// Returns an error if the catalog defines no tiers for the architecture,
    /// violates the containment invariant, or (on musl) the libc version
    /// cannot be determined.
    pub fn load_default(architecture: Architecture) -> Result<Self> {
        match Libc::detect() {
            Libc::Musl => {
                let version =
                    libc::host_musl_version().ok_or(PolicyError::UnknownMuslVersion)?;
                Self::load_default_musl(architecture, version)
            }
            Libc::Gnu => Self::parse(DEFAULT_CATALOG, architecture, None),
        }
    }

    /// Load the embedded musl catalog. Musl guarantees no cross-version ABI,
    /// so only the tier matching the given musl version survives, next to
    /// the baseline.
    ///
    /// # Errors
    /// Returns an error if no tier matches the version and architecture.
    pub fn load_default_musl(architecture: Architecture, version: MuslVersion) -> Result<Self> {
        Self::parse(MUSL_CATALOG, architecture, Some(version))
    }

    /// Load a catalog from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or fails the
    /// same validation as the default catalog.
    pub fn load_from(path: &std::path::Path, architecture: Architecture) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| PolicyError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&text, architecture, None)
    }

    fn parse(text: &str, architecture: Architecture, musl: Option<MuslVersion>) -> Result<Self> {
        let raw: Vec<RawPolicy> =
            serde_json::from_str(text).map_err(|e| PolicyError::ParseFailed { source: e })?;

        let musl_tier = musl.map(|version| format!("musllinux_{}_{}", version.major, version.minor));
        let arch_key = architecture.baseline().as_str();
        let suffix = architecture.as_str();
        let mut policies = Vec::new();
        for record in raw {
            if record.priority != 0 {
                if let Some(keep) = &musl_tier {
                    if record.name != *keep {
                        continue;
                    }
                }
            }
            let ceilings = if record.priority == 0 {
                BTreeMap::new()
            } else {
                match record.symbol_versions.get(arch_key) {
                    Some(per_arch) => per_arch
                        .iter()
                        .map(|(family, versions)| {
                            let full = versions
                                .iter()
                                .map(|version| format!("{family}_{version}"))
                                .collect();
                            (family.clone(), full)
                        })
                        .collect(),
                    // A tier that predates this architecture does not apply.
                    None => continue,
                }
            };
            policies.push(Policy {
                name: format!("{}_{}", record.name, suffix),
                aliases: record
                    .aliases
                    .iter()
                    .map(|alias| format!("{alias}_{suffix}"))
                    .collect(),
                priority: record.priority,
                ceilings,
                whitelist: if musl.is_some() {
                    fixup_musl_whitelist(record.lib_whitelist, architecture)
                } else {
                    record.lib_whitelist
                },
                blacklist: record.blacklist,
            });
        }

        policies.sort_by_key(|policy| std::cmp::Reverse(policy.priority));

        if !policies.iter().any(Policy::is_unconstrained) {
            return Err(PolicyError::MissingBaseline);
        }
        if policies.len() < 2 {
            return Err(PolicyError::NoPoliciesForArchitecture { architecture });
        }
        Self::validate_containment(&policies)?;

        Ok(Self {
            architecture,
            policies,
        })
    }

    /// As priority decreases, a tier assumes a newer system, so its whitelist
    /// and ceilings must include everything the more restrictive tier allows.
    /// The baseline is unconstrained and exempt. Checked once at load time.
    fn validate_containment(policies: &[Policy]) -> Result<()> {
        let constrained: Vec<&Policy> = policies
            .iter()
            .filter(|policy| !policy.is_unconstrained())
            .collect();
        for pair in constrained.windows(2) {
            let (higher, lower) = (pair[0], pair[1]);
            if !higher.whitelist.is_subset(&lower.whitelist) {
                return Err(PolicyError::ContainmentViolation {
                    higher: higher.name.clone(),
                    lower: lower.name.clone(),
                    detail: "library whitelist".to_string(),
                });
            }
            for (family, versions) in &higher.ceilings {
                let contained = lower
                    .ceilings
                    .get(family)
                    .is_some_and(|allowed| versions.is_subset(allowed));
                if !contained {
                    return Err(PolicyError::ContainmentViolation {
                        higher: higher.name.clone(),
                        lower: lower.name.clone(),
                        detail: format!("symbol family {family}"),
                    });
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// All tiers, most restrictive (highest priority) first.
    #[must_use]
    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    /// The most restrictive tier.
    #[must_use]
    pub fn highest(&self) -> &Policy {
        &self.policies[0]
    }

    /// The unconstrained baseline tier.
    #[must_use]
    pub fn baseline(&self) -> &Policy {
        self.policies
            .iter()
            .find(|policy| policy.is_unconstrained())
            .unwrap_or_else(|| &self.policies[self.policies.len() - 1])
    }

    /// Look up a tier by name or alias.
    ///
    /// # Errors
    /// Returns `UnknownPolicy` if no tier matches.
    pub fn find(&self, name: &str) -> Result<&Policy> {
        self.policies
            .iter()
            .find(|policy| policy.matches_name(name))
            .ok_or_else(|| PolicyError::UnknownPolicy {
                name: name.to_string(),
            })
    }

    #[must_use]
    pub fn by_priority(&self, priority: i32) -> Option<&Policy> {
        self.policies
            .iter()
            .find(|policy| policy.priority == priority)
    }
}

/// The soname of the musl C library for an architecture.
fn musl_libc_soname(architecture: Architecture) -> String {
    let arch = match architecture.baseline() {
        Architecture::I686 => "x86",
        Architecture::Armv7l => "armv7",
        other => other.as_str(),
    };
    format!("libc.musl-{arch}.so.1")
}

/// Musl catalogs whitelist the generic `libc.so`; the on-disk soname is
/// architecture-specific.
fn fixup_musl_whitelist(
    whitelist: BTreeSet<String>,
    architecture: Architecture,
) -> BTreeSet<String> {
    whitelist
        .into_iter()
        .map(|soname| {
            if soname == "libc.so" {
                musl_libc_soname(architecture)
            } else {
                soname
            }
        })
        .collect()
}
