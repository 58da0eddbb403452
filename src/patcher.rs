// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Delegated ELF metadata editing. The repair engine never edits binary
//! metadata bytes itself; it goes through the [`Patcher`] capability, whose
//! production implementation shells out to `patchelf`.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use thiserror::Error;
use wait_timeout::ChildExt;

/// Default timeout for external tool invocations (60 seconds).
pub(crate) const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

const MINIMUM_PATCHELF: (u32, u32) = (0, 14);

/// Result type for patcher operations.
pub type PatcherResult<T> = std::result::Result<T, PatcherError>;

/// Errors that can occur when invoking external binary-editing tools.
/// All of these are immediately fatal; there is no retry.
#[derive(Debug, Error)]
pub enum PatcherError {
    #[error("Tool not found: {command}")]
    ToolNotFound { command: String },
    #[error("{command} {version} is too old, {required} or later is required")]
    ToolTooOld {
        command: String,
        version: String,
        required: String,
    },
    #[error("Could not determine {command} version from {output:?}")]
    VersionUnparseable { command: String, output: String },
    #[error("Command failed: {command} (file: {path:?})")]
    CommandFailed {
        command: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Command timed out after {timeout:?}: {command} (file: {path:?})")]
    CommandTimeout {
        command: String,
        path: PathBuf,
        timeout: Duration,
    },
    #[error("Command exited with {code}: {command} (file: {path:?}): {stderr}")]
    NonZeroExit {
        command: String,
        path: PathBuf,
        code: i32,
        stderr: String,
    },
}

/// The four metadata edits the repair engine needs.
pub trait Patcher: Send + Sync {
    /// Rewrite NEEDED entries, all replacements in one call per file.
    ///
    /// # Errors
    /// Returns an error if the edit fails.
    fn replace_needed(&self, file: &Path, replacements: &[(String, String)]) -> PatcherResult<()>;

    /// Set the soname the file advertises.
    ///
    /// # Errors
    /// Returns an error if the edit fails.
    fn set_soname(&self, file: &Path, soname: &str) -> PatcherResult<()>;

    /// Replace the file's run-time search path.
    ///
    /// # Errors
    /// Returns an error if the edit fails.
    fn set_rpath(&self, file: &Path, rpath: &str) -> PatcherResult<()>;

    /// Read the file's current run-time search path.
    ///
    /// # Errors
    /// Returns an error if the read fails.
    fn get_rpath(&self, file: &Path) -> PatcherResult<String>;
}

/// Production patcher, shelling out to `patchelf`.
pub struct Patchelf {
    timeout: Duration,
}

impl Patchelf {
    /// Create a patcher, verifying that `patchelf` is present and recent
    /// enough. Versions before 0.14 corrupt libraries linked against glibc.
    ///
    /// # Errors
    /// Returns an error if `patchelf` is missing, too old, or reports an
    /// unparseable version.
    pub fn new() -> PatcherResult<Self> {
        let patcher = Self {
            timeout: DEFAULT_TOOL_TIMEOUT,
        };
        patcher.verify_version()?;
        Ok(patcher)
    }

    fn verify_version(&self) -> PatcherResult<()> {
        let output = run_tool("patchelf", &["--version"], Path::new("-"), self.timeout)?;
        let version = output.trim().rsplit(' ').next().unwrap_or("");
        let mut parts = version.split('.').map(str::parse::<u32>);
        let (major, minor) = match (parts.next(), parts.next()) {
            (Some(Ok(major)), Some(Ok(minor))) => (major, minor),
            _ => {
                return Err(PatcherError::VersionUnparseable {
                    command: "patchelf".to_string(),
                    output: output.trim().to_string(),
                });
            }
        };
        if (major, minor) < MINIMUM_PATCHELF {
            return Err(PatcherError::ToolTooOld {
                command: "patchelf".to_string(),
                version: version.to_string(),
                required: format!("{}.{}", MINIMUM_PATCHELF.0, MINIMUM_PATCHELF.1),
            });
        }
        Ok(())
    }

    fn run(&self, args: &[&str], file: &Path) -> PatcherResult<String> {
        run_tool("patchelf", args, file, self.timeout)
    }
}

impl Patcher for Patchelf {
    fn replace_needed(&self, file: &Path, replacements: &[(String, String)]) -> PatcherResult<()> {
        if replacements.is_empty() {
            return Ok(());
        }
        let file_arg = file.to_string_lossy();
        let mut args = Vec::with_capacity(replacements.len() * 3 + 1);
        for (old, new) in replacements {
            args.extend(["--replace-needed", old.as_str(), new.as_str()]);
        }
        args.push(&file_arg);
        self.run(&args, file).map(|_| ())
    }

    fn set_soname(&self, file: &Path, soname: &str) -> PatcherResult<()> {
        self.run(
            &["--set-soname", soname, &file.to_string_lossy()],
            file,
        )
        .map(|_| ())
    }

    fn set_rpath(&self, file: &Path, rpath: &str) -> PatcherResult<()> {
        self.run(
            &["--remove-rpath", &file.to_string_lossy()],
            file,
        )?;
        self.run(
            &["--force-rpath", "--set-rpath", rpath, &file.to_string_lossy()],
            file,
        )
        .map(|_| ())
    }

    fn get_rpath(&self, file: &Path) -> PatcherResult<String> {
        self.run(&["--print-rpath", &file.to_string_lossy()], file)
            .map(|output| output.trim().to_string())
    }
}

/// Remove the symbol table from a file with the external `strip` tool.
/// Best-effort by contract; the caller decides whether a failure matters.
///
/// # Errors
/// Returns an error if the tool is missing or exits non-zero.
pub fn strip_symbols(file: &Path) -> PatcherResult<()> {
    run_tool(
        "strip",
        &["-s", &file.to_string_lossy()],
        file,
        DEFAULT_TOOL_TIMEOUT,
    )
    .map(|_| ())
}

fn run_tool(
    command: &str,
    args: &[&str],
    file: &Path,
    timeout: Duration,
) -> PatcherResult<String> {
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PatcherError::ToolNotFound {
                    command: command.to_string(),
                }
            } else {
                PatcherError::CommandFailed {
                    command: command.to_string(),
                    path: file.to_path_buf(),
                    source: e,
                }
            }
        })?;

    let status = wait_with_timeout(&mut child, timeout, command, file)?;
    let mut output = child.wait_with_output().map_err(|e| PatcherError::CommandFailed {
        command: command.to_string(),
        path: file.to_path_buf(),
        source: e,
    })?;
    if !status.success() {
        return Err(PatcherError::NonZeroExit {
            command: command.to_string(),
            path: file.to_path_buf(),
            code: status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&std::mem::take(&mut output.stdout)).to_string())
}

/// Wait for a child process to complete with a timeout, killing it on
/// expiry. Termination by signal counts as a failure.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    command: &str,
    file: &Path,
) -> PatcherResult<std::process::ExitStatus> {
    let waited = child
        .wait_timeout(timeout)
        .map_err(|e| PatcherError::CommandFailed {
            command: command.to_string(),
            path: file.to_path_buf(),
            source: e,
        })?;
    match waited {
        Some(status) if status.code().is_some() => Ok(status),
        Some(status) => Err(PatcherError::CommandFailed {
            command: command.to_string(),
            path: file.to_path_buf(),
            source: std::io::Error::other(match status.signal() {
                Some(signal) => format!("Process terminated by signal: {signal}"),
                None => "Unknown process termination".to_string(),
            }),
        }),
        None => {
            let _ = child.kill();
            let _ = child.wait();
            Err(PatcherError::CommandTimeout {
                command: command.to_string(),
                path: file.to_path_buf(),
                timeout,
            })
        }
    }
}

/// A [`Patcher`] double that records edits instead of shelling out. Kept in
/// the library so unit and integration tests share one implementation.
#[doc(hidden)]
pub mod testing {
    use super::{Patcher, PatcherResult};
    use std::path::Path;
    use std::sync::Mutex;

    pub struct RecordingPatcher {
        calls: Mutex<Vec<String>>,
        rpath: Mutex<String>,
    }

    impl RecordingPatcher {
        #[must_use]
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                rpath: Mutex::new(String::new()),
            }
        }

        /// A double whose `get_rpath` reports a pre-existing search path.
        #[must_use]
        pub fn with_rpath(rpath: &str) -> Self {
            let patcher = Self::new();
            *patcher.rpath.lock().unwrap() = rpath.to_string();
            patcher
        }

        #[must_use]
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Default for RecordingPatcher {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Patcher for RecordingPatcher {
        fn replace_needed(
            &self,
            file: &Path,
            replacements: &[(String, String)],
        ) -> PatcherResult<()> {
            let mut calls = self.calls.lock().unwrap();
            for (old, new) in replacements {
                calls.push(format!("replace_needed {} {old} {new}", file.display()));
            }
            Ok(())
        }

        fn set_soname(&self, file: &Path, soname: &str) -> PatcherResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("set_soname {} {soname}", file.display()));
            Ok(())
        }

        fn set_rpath(&self, file: &Path, rpath: &str) -> PatcherResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("set_rpath {} {rpath}", file.display()));
            Ok(())
        }

        fn get_rpath(&self, _file: &Path) -> PatcherResult<String> {
            Ok(self.rpath.lock().unwrap().clone())
        }
    }
}
