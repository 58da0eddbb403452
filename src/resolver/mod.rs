// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Resolves the transitive dynamic dependency tree of an ELF binary the way
//! the runtime loader would, without executing any code. Only reads files on
//! disk.

mod search;

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::elf::{Elf, ElfError, ElfType, Platform};
pub(crate) use search::{expand_path_entry, LdPaths};

type Result<T> = std::result::Result<T, ResolveError>;

/// Errors that can occur while resolving a dependency tree.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The input is not a dynamically linked ELF object. This is an expected,
    /// common outcome for package files and is skipped by callers.
    #[error("Not a dynamically linked object file: {path:?}")]
    NotObjectFile { path: PathBuf },
    #[error("Invalid exclusion pattern: {pattern}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("Elf error: {0}")]
    Elf(#[from] ElfError),
}

/// One resolved (or unresolvable) shared library in a dependency tree.
/// Immutable once the tree is built; one instance per distinct soname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DynamicLibrary {
    pub soname: String,
    /// Where the library was found in search order, or `None` if unresolved.
    pub path: Option<PathBuf>,
    /// Symlink-resolved absolute path, or `None` if unresolved.
    pub realpath: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// The library's own first-level dependencies, after exclusions.
    pub needed: BTreeSet<String>,
}

/// The resolved dependency tree rooted at one binary. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DynamicExecutable {
    /// Runtime loader path; present only for the root binary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    pub path: PathBuf,
    pub realpath: PathBuf,
    #[serde(skip)]
    pub platform: Platform,
    /// Direct dependencies of the root, after exclusions.
    pub needed: BTreeSet<String>,
    pub rpath: Vec<PathBuf>,
    pub runpath: Vec<PathBuf>,
    /// Full transitive closure, keyed by soname.
    pub libraries: BTreeMap<String, DynamicLibrary>,
}

/// Resolver state for one package: loaded system search paths and exclusion
/// patterns. Create one per package; it is not shared across threads.
pub struct ResolveContext {
    ldpaths: LdPaths,
    exclude: Vec<glob::Pattern>,
}

impl ResolveContext {
    /// Create a context with system search paths loaded from the environment
    /// and `/etc/ld.so.conf`.
    ///
    /// # Errors
    /// Returns an error if an exclusion pattern is not valid glob syntax.
    pub fn new(exclude: &[String]) -> Result<Self> {
        Self::with_ld_paths(exclude, LdPaths::load())
    }

    /// Create a context reusing already loaded search paths. Loading them once
    /// per package and cloning per binary avoids re-reading `ld.so.conf` for
    /// every file in the tree.
    pub(crate) fn with_ld_paths(exclude: &[String], ldpaths: LdPaths) -> Result<Self> {
        let exclude = exclude
            .iter()
            .map(|pattern| {
                glob::Pattern::new(pattern).map_err(|e| ResolveError::InvalidPattern {
                    pattern: pattern.clone(),
                    source: e,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ldpaths, exclude })
    }

    /// Resolve the full dependency tree of `path`.
    ///
    /// # Errors
    /// Returns `NotObjectFile` if the input is not a dynamically linked ELF
    /// object; unresolvable libraries are recorded with no path, not errors.
    pub fn resolve(&mut self, path: &Path) -> Result<DynamicExecutable> {
        let elf = Self::read_object(path)?;
        let realpath = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let origin = realpath.parent().unwrap_or_else(|| Path::new("/"));

        // The interpreter's own directory (and its /usr twin) is the loader's
        // very last fallback.
        if let Some(interpreter) = elf.interpreter() {
            let interp_dir = Path::new(interpreter)
                .parent()
                .unwrap_or_else(|| Path::new("/"));
            self.ldpaths.interp = vec![
                interp_dir.to_path_buf(),
                Path::new("/usr").join(interp_dir.strip_prefix("/").unwrap_or(interp_dir)),
            ];
        } else {
            self.ldpaths.interp.clear();
        }

        let (rpath, runpath) = Self::binary_search_paths(&elf, origin);
        // The root's rpath/runpath apply to every transitive resolution, the
        // same way the runtime loader propagates them.
        self.ldpaths.root_rpath = rpath.clone();
        self.ldpaths.root_runpath = runpath.clone();

        let mut libraries = BTreeMap::new();
        let mut excluded = HashSet::new();
        let needed = self.walk(&realpath, &elf, &mut libraries, &mut excluded);

        if let Some(interpreter) = elf.interpreter() {
            let soname = Path::new(interpreter)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| interpreter.to_string());
            let interp_path = PathBuf::from(interpreter);
            let interp_real = interp_path.canonicalize().ok();
            libraries.insert(
                soname.clone(),
                DynamicLibrary {
                    soname,
                    path: Some(interp_path),
                    realpath: interp_real,
                    platform: Some(elf.platform().clone()),
                    needed: BTreeSet::new(),
                },
            );
        }

        let mut executable = DynamicExecutable {
            interpreter: elf.interpreter().map(str::to_string),
            path: path.to_path_buf(),
            realpath,
            platform: elf.platform().clone(),
            needed,
            rpath,
            runpath,
            libraries,
        };
        Self::purge_excluded(&mut executable, &excluded);
        Ok(executable)
    }

    /// Parse the file at `path`, mapping non-objects to the skip condition.
    fn read_object(path: &Path) -> Result<Elf> {
        let elf = match Elf::from_path(path) {
            Ok(elf) => elf,
            Err(ElfError::NotElfFile { path } | ElfError::FileTooSmall { path }) => {
                return Err(ResolveError::NotObjectFile { path });
            }
            Err(e) => return Err(e.into()),
        };
        let is_object = matches!(elf.kind(), ElfType::Executable | ElfType::SharedObject);
        if !is_object || !elf.is_dynamic() {
            return Err(ResolveError::NotObjectFile {
                path: path.to_path_buf(),
            });
        }
        Ok(elf)
    }

    /// This binary's own expanded search paths. If both `RPATH` and `RUNPATH`
    /// are present, the loader only uses `RUNPATH`.
    fn binary_search_paths(elf: &Elf, origin: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let expand = |entries: &[String]| {
            entries
                .iter()
                .filter_map(|entry| expand_path_entry(entry, Some(origin)))
                .collect::<Vec<_>>()
        };
        if !elf.runpath().is_empty() {
            (Vec::new(), expand(elf.runpath()))
        } else {
            (expand(elf.rpath()), Vec::new())
        }
    }

    /// Depth-first walk of one binary's dependencies. Returns the binary's
    /// effective needed set (exclusions removed). A soname is inserted into
    /// `libraries` before recursing into it, which breaks cycles.
    fn walk(
        &self,
        binary_path: &Path,
        elf: &Elf,
        libraries: &mut BTreeMap<String, DynamicLibrary>,
        excluded: &mut HashSet<String>,
    ) -> BTreeSet<String> {
        let origin = binary_path.parent().unwrap_or_else(|| Path::new("/"));
        let (rpath, runpath) = Self::binary_search_paths(elf, origin);
        let search_order: Vec<&PathBuf> = self
            .ldpaths
            .root_rpath
            .iter()
            .chain(rpath.iter())
            .chain(runpath.iter())
            .chain(self.ldpaths.env.iter())
            .chain(self.ldpaths.root_runpath.iter())
            .chain(self.ldpaths.conf.iter())
            .chain(self.ldpaths.interp.iter())
            .collect();

        let mut needed = BTreeSet::new();
        for soname in elf.needed() {
            if excluded.contains(soname) {
                continue;
            }
            if self.matches_exclusion(soname) {
                excluded.insert(soname.clone());
                continue;
            }
            needed.insert(soname.clone());
            if libraries.contains_key(soname) {
                continue;
            }
            let Some((found_path, found_real)) =
                Self::find_lib(elf.platform(), soname, &search_order)
            else {
                libraries.insert(
                    soname.clone(),
                    DynamicLibrary {
                        soname: soname.clone(),
                        path: None,
                        realpath: None,
                        platform: None,
                        needed: BTreeSet::new(),
                    },
                );
                continue;
            };
            if self.matches_exclusion(&found_real.to_string_lossy()) {
                excluded.insert(soname.clone());
                needed.remove(soname);
                continue;
            }
            libraries.insert(
                soname.clone(),
                DynamicLibrary {
                    soname: soname.clone(),
                    path: Some(found_path),
                    realpath: Some(found_real.clone()),
                    platform: None,
                    needed: BTreeSet::new(),
                },
            );
            if let Ok(child) = Self::read_object(&found_real) {
                let child_needed = self.walk(&found_real, &child, libraries, excluded);
                if let Some(entry) = libraries.get_mut(soname) {
                    entry.platform = Some(child.platform().clone());
                    entry.needed = child_needed;
                }
            }
        }
        needed
    }

    /// Locate a platform-compatible `soname` in the given search order.
    /// The first directory containing a compatible candidate wins; candidates
    /// with an incompatible word size, endianness, or OS/ABI are treated as
    /// not found.
    fn find_lib(
        platform: &Platform,
        soname: &str,
        search_order: &[&PathBuf],
    ) -> Option<(PathBuf, PathBuf)> {
        for dir in search_order {
            let candidate = dir.join(soname);
            let Ok(realpath) = candidate.canonicalize() else {
                continue;
            };
            let Ok(lib) = Elf::from_path(&realpath) else {
                continue;
            };
            if platform.is_compatible(lib.platform()) {
                return Some((candidate, realpath));
            }
        }
        None
    }

    fn matches_exclusion(&self, name: &str) -> bool {
        self.exclude.iter().any(|pattern| pattern.matches(name))
    }

    /// An excluded library must not appear anywhere in the output tree,
    /// including in the needed sets of libraries resolved before the
    /// exclusion was discovered.
    fn purge_excluded(executable: &mut DynamicExecutable, excluded: &HashSet<String>) {
        if excluded.is_empty() {
            return;
        }
        executable.needed.retain(|soname| !excluded.contains(soname));
        for library in executable.libraries.values_mut() {
            library.needed.retain(|soname| !excluded.contains(soname));
        }
        executable
            .libraries
            .retain(|soname, _| !excluded.contains(soname));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn empty_context(exclude: &[String]) -> ResolveContext {
        ResolveContext::with_ld_paths(exclude, LdPaths::default()).unwrap()
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = ResolveContext::with_ld_paths(&["lib[foo.so".to_string()], LdPaths::default());
        assert!(matches!(result, Err(ResolveError::InvalidPattern { .. })));
    }

    #[test]
    fn test_not_object_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 256]).unwrap();
        file.flush().unwrap();

        let mut ctx = empty_context(&[]);
        let result = ctx.resolve(file.path());
        assert!(matches!(result, Err(ResolveError::NotObjectFile { .. })));
    }

    #[test]
    fn test_exclusion_matching() {
        let ctx = empty_context(&["libfoo.so.*".to_string(), "libbar.so.1".to_string()]);
        assert!(ctx.matches_exclusion("libfoo.so.1"));
        assert!(ctx.matches_exclusion("libfoo.so.1.2.3"));
        assert!(ctx.matches_exclusion("libbar.so.1"));
        assert!(!ctx.matches_exclusion("libbar.so.2"));
        assert!(!ctx.matches_exclusion("libbaz.so.1"));
    }

    #[test]
    fn test_purge_excluded_removes_needed_entries() {
        let mut executable = DynamicExecutable {
            interpreter: None,
            path: PathBuf::from("/pkg/ext.so"),
            realpath: PathBuf::from("/pkg/ext.so"),
            platform: host_platform(),
            needed: BTreeSet::from(["libfoo.so.1".to_string(), "libbar.so.1".to_string()]),
            rpath: Vec::new(),
            runpath: Vec::new(),
            libraries: BTreeMap::from([
                (
                    "libfoo.so.1".to_string(),
                    DynamicLibrary {
                        soname: "libfoo.so.1".to_string(),
                        path: None,
                        realpath: None,
                        platform: None,
                        needed: BTreeSet::new(),
                    },
                ),
                (
                    "libbar.so.1".to_string(),
                    DynamicLibrary {
                        soname: "libbar.so.1".to_string(),
                        path: None,
                        realpath: None,
                        platform: None,
                        needed: BTreeSet::from(["libfoo.so.1".to_string()]),
                    },
                ),
            ]),
        };
        let excluded = HashSet::from(["libfoo.so.1".to_string()]);
        ResolveContext::purge_excluded(&mut executable, &excluded);

        assert!(!executable.needed.contains("libfoo.so.1"));
        assert!(!executable.libraries.contains_key("libfoo.so.1"));
        assert!(!executable.libraries["libbar.so.1"]
            .needed
            .contains("libfoo.so.1"));
    }

    fn host_platform() -> Platform {
        let exe = std::env::current_exe().unwrap();
        Elf::from_path(&exe).unwrap().platform().clone()
    }

    #[test]
    fn test_resolve_host_binary() {
        // The test binary is a real dynamic executable and its dependencies
        // resolve through the system configuration.
        let exe = std::env::current_exe().unwrap();
        let mut ctx = ResolveContext::new(&[]).unwrap();
        let tree = ctx.resolve(&exe).unwrap();
        assert!(!tree.needed.is_empty());
        for soname in &tree.needed {
            assert!(tree.libraries.contains_key(soname), "missing {soname}");
        }
    }

    #[test]
    fn test_resolve_host_binary_with_exclusion() {
        let exe = std::env::current_exe().unwrap();
        let mut ctx = ResolveContext::new(&["libc.so.*".to_string()]).unwrap();
        let tree = ctx.resolve(&exe).unwrap();
        assert!(!tree.needed.contains("libc.so.6"));
        assert!(!tree.libraries.contains_key("libc.so.6"));
        for library in tree.libraries.values() {
            assert!(!library.needed.contains("libc.so.6"));
        }
    }
}
