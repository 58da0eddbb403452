// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "package_auditor")]
#[command(version)]
#[command(about = "Audits and repairs the external library dependencies of binary packages")]
pub(crate) struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Audit an unpacked package directory and show the claimable tier.
    Show {
        /// Path to the unpacked package directory.
        package: PathBuf,

        /// Path to write the audit results in JSON format.
        #[arg(long)]
        report: Option<PathBuf>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Graft external libraries into the package to claim a target tier.
    Repair {
        /// Path to the unpacked package directory.
        package: PathBuf,

        /// Target tier name or alias. Defaults to the best tier the
        /// package's symbol usage allows.
        #[arg(long)]
        tier: Option<String>,

        /// Strip symbol tables from grafted libraries and processed
        /// binaries.
        #[arg(long)]
        strip: bool,

        /// Leave the package tag metadata untouched.
        #[arg(long)]
        no_update_tags: bool,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Parser)]
pub(crate) struct CommonArgs {
    /// Target architecture. Defaults to the host architecture.
    #[arg(long)]
    pub arch: Option<String>,

    /// Path to a policy catalog JSON file overriding the built-in one.
    #[arg(long)]
    pub policies: Option<PathBuf>,

    #[arg(
        long = "exclude",
        long_help = "Glob pattern of libraries to leave out of the dependency graph.\n\
                Matched against both sonames and resolved real paths.\n\
                May be given multiple times."
    )]
    pub exclude: Vec<String>,
}
