// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.
mod args;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::File;
use std::path::{Path, PathBuf};

use args::{Args, Command, CommonArgs};
use package_auditor::console::summarize_audit;
use package_auditor::policy::audit::{AuditResult, Auditor};
use package_auditor::policy::PolicyCatalog;
use package_auditor::repair::{repair, RepairOptions};
use package_auditor::{Architecture, Package, Patchelf};

fn main() -> Result<()> {
    match Args::parse().command {
        Command::Show {
            package,
            report,
            common,
        } => run_show(&package, report.as_deref(), &common),
        Command::Repair {
            package,
            tier,
            strip,
            no_update_tags,
            common,
        } => run_repair(&package, tier.as_deref(), strip, no_update_tags, &common),
    }
}

fn run_show(package_path: &Path, report: Option<&Path>, common: &CommonArgs) -> Result<()> {
    let package = open_package(package_path)?;
    let mut auditor = create_auditor(common)?;
    let result = auditor
        .audit(&package)
        .with_context(|| format!("Failed to audit package: {}", package_path.display()))?;
    if let Some(dest) = report {
        write_report_to_file(&result, dest)?;
    }
    summarize_audit(&package, &result);
    Ok(())
}

fn run_repair(
    package_path: &Path,
    tier: Option<&str>,
    strip: bool,
    no_update_tags: bool,
    common: &CommonArgs,
) -> Result<()> {
    let package = open_package(package_path)?;
    let mut auditor = create_auditor(common)?;
    let result = auditor
        .audit(&package)
        .with_context(|| format!("Failed to audit package: {}", package_path.display()))?;

    let target = match tier {
        Some(tier) => tier.to_string(),
        None => best_achievable_tier(auditor.catalog(), &result)?,
    };
    eprintln!(
        "Repairing package: package={}, tier={target}",
        package_path.display()
    );

    let patcher = Patchelf::new().context("patchelf is required for repair")?;
    let options = RepairOptions {
        strip,
        update_tags: !no_update_tags,
    };
    let repaired = repair(&mut auditor, &package, &target, &patcher, &options)
        .with_context(|| format!("Failed to repair package: {}", package_path.display()))?;

    match repaired {
        None => {
            eprintln!("Nothing to graft: package already satisfies {target}");
            Ok(())
        }
        Some(root) => {
            // The tree changed on disk, so verify with a fresh scan.
            let package = open_package(&root)?;
            let mut auditor = create_auditor(common)?;
            let result = auditor
                .audit(&package)
                .with_context(|| format!("Failed to re-audit package: {}", root.display()))?;
            summarize_audit(&package, &result);
            let achieved = auditor.catalog().find(&target)?.priority();
            if result.overall.priority < achieved {
                bail!(
                    "Repair did not reach {target}: package still audits as {}",
                    result.overall.name
                );
            }
            Ok(())
        }
    }
}

fn open_package(path: &Path) -> Result<Package> {
    let package = Package::from_path(path)
        .with_context(|| format!("Failed to open package: {}", path.display()))?;
    eprintln!(
        "Opened package: package={}, files={}",
        path.display(),
        package.files().len()
    );
    Ok(package)
}

fn create_auditor(common: &CommonArgs) -> Result<Auditor> {
    let architecture = target_architecture(common.arch.as_deref())?;
    let catalog = load_catalog(common.policies.as_ref(), architecture)?;
    Ok(Auditor::new(catalog, common.exclude.clone()))
}

fn target_architecture(arch: Option<&str>) -> Result<Architecture> {
    let name = arch.unwrap_or(std::env::consts::ARCH);
    name.parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("Unsupported target architecture")
}

fn load_catalog(policies: Option<&PathBuf>, architecture: Architecture) -> Result<PolicyCatalog> {
    match policies {
        Some(path) => PolicyCatalog::load_from(path, architecture)
            .with_context(|| format!("Failed to load policy catalog: {}", path.display())),
        None => PolicyCatalog::load_default(architecture)
            .context("Failed to load built-in policy catalog"),
    }
}

/// The best tier the package could claim after grafting: external libraries
/// are fixable, the other four axes are not.
fn best_achievable_tier(catalog: &PolicyCatalog, result: &AuditResult) -> Result<String> {
    let ceiling = [
        &result.symbol_tier,
        &result.encoding_tier,
        &result.forbidden_tier,
        &result.machine_tier,
    ]
    .iter()
    .map(|tier| tier.priority)
    .min()
    .unwrap_or(0);
    if ceiling == 0 {
        bail!("Package cannot claim any tier beyond the unconstrained baseline; repair is pointless");
    }
    let policy = catalog
        .by_priority(ceiling)
        .context("No policy at the achievable priority")?;
    Ok(policy.name().to_string())
}

/// Write the audit result to a file.
///
/// # Errors
/// Returns an error if the result cannot be serialized to JSON or if the file cannot be created.
fn write_report_to_file(result: &AuditResult, dest: &Path) -> Result<()> {
    eprintln!("Writing report to file: file={}", dest.display());
    let file = File::create(dest)
        .with_context(|| format!("Failed to create JSON output file: {}", dest.display()))?;
    serde_json::to_writer_pretty(file, result)
        .with_context(|| format!("Failed to serialize audit result to JSON: {}", dest.display()))?;
    Ok(())
}
