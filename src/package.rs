// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Directory-backed view of an unpacked package: the file inventory, the
//! distribution name parsed from the metadata layout, and the package-private
//! directories used by repair. Archive packing and the hash ledger stay with
//! external collaborators.

use path_clean::PathClean;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

type Result<T> = std::result::Result<T, PackageError>;

/// Errors that can occur when opening a package directory.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("Package path is not a directory: {path:?}")]
    NotADirectory { path: PathBuf },
    #[error("Failed to canonicalize package path: {path:?}")]
    CanonicalizeFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to walk package directory: {path:?}")]
    WalkFailed {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// An unpacked package rooted at a directory.
#[derive(Debug, Clone)]
pub struct Package {
    root: PathBuf,
    name: String,
    /// `<name>-<version>`, from the `.dist-info` directory, if present.
    dist_info_stem: Option<String>,
    files: Vec<PathBuf>,
}

impl Package {
    /// Open an unpacked package directory and inventory its files.
    ///
    /// # Errors
    /// Returns an error if the path is not a readable directory.
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.is_dir() {
            return Err(PackageError::NotADirectory {
                path: path.to_path_buf(),
            });
        }
        let root = path
            .canonicalize()
            .map_err(|e| PackageError::CanonicalizeFailed {
                path: path.to_path_buf(),
                source: e,
            })?;

        let mut files = Vec::new();
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = entry.map_err(|e| PackageError::WalkFailed {
                path: root.clone(),
                source: e,
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        files.sort();

        let dist_info_stem = Self::find_dist_info_stem(&root);
        let name = dist_info_stem
            .as_deref()
            .map(|stem| stem.split('-').next().unwrap_or(stem).to_string())
            .or_else(|| {
                root.file_name()
                    .map(|file_name| file_name.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "package".to_string());

        Ok(Self {
            root,
            name,
            dist_info_stem,
            files,
        })
    }

    /// `<name>-<version>` from the first `*.dist-info` directory at the root.
    fn find_dist_info_stem(root: &Path) -> Option<String> {
        let mut stems: Vec<String> = std::fs::read_dir(root)
            .ok()?
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .strip_suffix(".dist-info")
                    .map(str::to_string)
            })
            .collect();
        stems.sort();
        stems.into_iter().next()
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The distribution name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All regular files in the package, sorted, as absolute paths.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Whether an absolute path points inside the package root.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        let resolved = path.canonicalize().unwrap_or_else(|_| path.clean());
        resolved.starts_with(&self.root)
    }

    /// The package-private directory grafted libraries are placed in.
    #[must_use]
    pub fn libs_dir(&self) -> PathBuf {
        self.root.join(format!("{}.libs", self.name))
    }

    /// Where relocated script executables are placed.
    #[must_use]
    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join(format!("{}.scripts", self.name))
    }

    /// The metadata directory, if the package carries one.
    #[must_use]
    pub fn dist_info_dir(&self) -> Option<PathBuf> {
        self.dist_info_stem
            .as_deref()
            .map(|stem| self.root.join(format!("{stem}.dist-info")))
    }

    /// The script directory of the data layout, whose entries cannot carry a
    /// reliable relative search path.
    #[must_use]
    pub fn data_scripts_dir(&self) -> Option<PathBuf> {
        self.dist_info_stem
            .as_deref()
            .map(|stem| self.root.join(format!("{stem}.data")).join("scripts"))
    }
}
