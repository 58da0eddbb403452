// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Grafting primitives: content-hash named library copies and the launcher
//! shim for relocated script executables.

use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::{RepairError, RepairResult};
use crate::elf::Elf;
use crate::package::Package;
use crate::patcher::Patcher;

/// Copy an external library into `dest_dir` under a content-hash name.
///
/// The new identity is `<stem>-<hash>.so<ext>` where `<hash>` is the first
/// eight hex digits of the SHA-256 of the source bytes, so the same source
/// grafted for two consumers collapses to one file. If the destination
/// already exists the copy is skipped, which makes re-repair a no-op.
///
/// The copy advertises the new identity as its soname. If the source carried
/// a run-time search path it is replaced by `$ORIGIN`, so the copy finds its
/// own grafted dependencies beside itself.
pub(super) fn copylib(
    src: &Path,
    dest_dir: &Path,
    patcher: &dyn Patcher,
) -> RepairResult<(String, PathBuf)> {
    let bytes = fs::read(src).map_err(|e| RepairError::CopyFailed {
        src: src.to_path_buf(),
        dest: dest_dir.to_path_buf(),
        source: e,
    })?;
    let digest = Sha256::digest(&bytes);
    let shorthash: String = digest
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect();

    let src_name = src
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let new_soname = match src_name.split_once(".so") {
        Some((stem, ext)) => format!("{stem}-{shorthash}.so{ext}"),
        None => format!("{src_name}-{shorthash}"),
    };

    let dest = dest_dir.join(&new_soname);
    if dest.exists() {
        return Ok((new_soname, dest));
    }

    let copy_err = |e| RepairError::CopyFailed {
        src: src.to_path_buf(),
        dest: dest.clone(),
        source: e,
    };
    fs::create_dir_all(dest_dir).map_err(copy_err)?;
    fs::write(&dest, &bytes).map_err(copy_err)?;
    fs::set_permissions(&dest, fs::Permissions::from_mode(0o755)).map_err(copy_err)?;

    patcher.set_soname(&dest, &new_soname)?;

    let source_elf = Elf::from_path(src)?;
    if !source_elf.rpath().is_empty() || !source_elf.runpath().is_empty() {
        patcher.set_rpath(&dest, "$ORIGIN")?;
    }

    Ok((new_soname, dest))
}

/// Move a script-layout executable into the package's scripts directory and
/// leave a launcher shim in its place. Returns the relocated path, which is
/// the one that must be patched from now on.
pub(super) fn relocate_script(consumer: &Path, package: &Package) -> RepairResult<PathBuf> {
    let name = consumer
        .file_name()
        .map(|file_name| file_name.to_string_lossy().to_string())
        .unwrap_or_default();
    let scripts_dir = package.scripts_dir();
    let scripts_dir_name = scripts_dir
        .file_name()
        .map(|file_name| file_name.to_string_lossy().to_string())
        .unwrap_or_default();
    let relocated = scripts_dir.join(&name);

    let shim_err = |e| RepairError::ShimFailed {
        path: consumer.to_path_buf(),
        source: e,
    };
    fs::create_dir_all(&scripts_dir).map_err(shim_err)?;
    fs::rename(consumer, &relocated).map_err(shim_err)?;

    let shim = format!(
        "#!python\n\
         # Launcher for {name}: executables in the script layout cannot carry\n\
         # a relative library search path, so the real binary lives in\n\
         # {scripts_dir_name} and is executed from there.\n\
         import os\n\
         import sys\n\
         import sysconfig\n\
         \n\
         if __name__ == \"__main__\":\n\
         \x20\x20\x20\x20target = os.path.join(\n\
         \x20\x20\x20\x20\x20\x20\x20\x20sysconfig.get_path(\"platlib\"), \"{scripts_dir_name}\", \"{name}\"\n\
         \x20\x20\x20\x20)\n\
         \x20\x20\x20\x20os.execv(target, sys.argv)\n"
    );
    fs::write(consumer, shim).map_err(shim_err)?;
    fs::set_permissions(consumer, fs::Permissions::from_mode(0o755)).map_err(shim_err)?;

    Ok(relocated)
}
