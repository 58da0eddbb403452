// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Builds dynamic-loader search paths: `RPATH`/`RUNPATH` token expansion,
//! `LD_LIBRARY_PATH`, and `ld.so.conf` parsing with nested `include` globs.

use path_clean::PathClean;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// System- and environment-supplied search paths, loaded once per resolver
/// context. `interp` is filled in lazily from the root binary's interpreter.
#[derive(Debug, Clone, Default)]
pub(crate) struct LdPaths {
    pub(crate) env: Vec<PathBuf>,
    pub(crate) conf: Vec<PathBuf>,
    pub(crate) interp: Vec<PathBuf>,
    /// The root binary's rpath entries, propagated to every transitive
    /// resolution the way the runtime loader does.
    pub(crate) root_rpath: Vec<PathBuf>,
    /// The root binary's runpath entries, likewise propagated.
    pub(crate) root_runpath: Vec<PathBuf>,
}

impl LdPaths {
    /// Load `LD_LIBRARY_PATH` and the system library-cache configuration.
    pub(crate) fn load() -> Self {
        let env = std::env::var("LD_LIBRARY_PATH")
            .map(|value| parse_ld_paths(&value, None))
            .unwrap_or_default();
        let mut conf = parse_ld_so_conf(Path::new("/etc/ld.so.conf"));
        // The trusted directories are not necessarily listed in ld.so.conf.
        for trusted in ["/lib", "/lib64", "/usr/lib", "/usr/lib64"] {
            conf.push(PathBuf::from(trusted));
        }
        Self {
            env,
            conf: existing_dirs(conf),
            ..Self::default()
        }
    }
}

/// Expand the loader's path tokens in a single search-path entry.
///
/// `$ORIGIN` (and `${ORIGIN}`) becomes the directory containing the binary;
/// `$LIB` and `$PLATFORM` become the platform library directory and processor
/// type of the host. Entries that stay relative after expansion are dropped:
/// the loader would resolve them against the process working directory, which
/// is unknown at analysis time.
pub(crate) fn expand_path_entry(entry: &str, origin: Option<&Path>) -> Option<PathBuf> {
    let lib_dir = if cfg!(target_pointer_width = "64") {
        "lib64"
    } else {
        "lib"
    };
    let mut resolved = entry.to_string();
    if let Some(origin) = origin {
        let origin = origin.to_string_lossy();
        resolved = resolved
            .replace("${ORIGIN}", &origin)
            .replace("$ORIGIN", &origin);
    }
    resolved = resolved
        .replace("${LIB}", lib_dir)
        .replace("$LIB", lib_dir)
        .replace("${PLATFORM}", std::env::consts::ARCH)
        .replace("$PLATFORM", std::env::consts::ARCH);

    if resolved.starts_with('/') {
        return Some(PathBuf::from(resolved).clean());
    }
    None
}

/// Parse a colon-delimited search-path list, expanding tokens against
/// `origin`, dropping entries that stay relative, deduplicating while keeping
/// order, and retaining only directories that exist.
pub(crate) fn parse_ld_paths(value: &str, origin: Option<&Path>) -> Vec<PathBuf> {
    let expanded = value
        .split(':')
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| expand_path_entry(entry, origin))
        .collect();
    existing_dirs(dedupe(expanded))
}

/// Load all paths from a loader configuration file, following `include`
/// directives (with glob expansion) and ignoring comments and blank lines.
pub(crate) fn parse_ld_so_conf(path: &Path) -> Vec<PathBuf> {
    dedupe(parse_ld_so_conf_inner(path))
}

fn parse_ld_so_conf_inner(path: &Path) -> Vec<PathBuf> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    let mut paths = Vec::new();
    for input_line in content.lines() {
        let line = input_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if let Some(pattern) = line.strip_prefix("include ") {
            let pattern = pattern.trim();
            let pattern = if pattern.starts_with('/') {
                PathBuf::from(pattern)
            } else {
                // Relative includes are resolved next to the including file.
                path.parent().unwrap_or_else(|| Path::new("/")).join(pattern)
            };
            if let Ok(matches) = glob::glob(&pattern.to_string_lossy()) {
                for included in matches.flatten() {
                    paths.extend(parse_ld_so_conf_inner(&included));
                }
            }
        } else {
            paths.push(PathBuf::from(line).clean());
        }
    }
    paths
}

/// Remove duplicates while preserving order.
fn dedupe(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    paths.into_iter().filter(|p| seen.insert(p.clone())).collect()
}

fn existing_dirs(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths.into_iter().filter(|p| p.is_dir()).collect()
}
