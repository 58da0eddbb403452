// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.

//! Formats and prints audit summaries to the console.

use comfy_table::{Cell, Table};

use crate::package::Package;
use crate::policy::audit::{AuditResult, ExternalReference};

/// Summarize an audit to the console: one row per axis, plus the libraries
/// the most restrictive tier would still consider external.
pub fn summarize_audit(package: &Package, result: &AuditResult) {
    println!("Package: {}", package.name());
    println!(
        "Overall tier: {} (priority {})\n",
        result.overall.name, result.overall.priority
    );

    println!("{}\n", axis_table(result));

    if let Some(reference) = blocking_reference(result) {
        println!("{}", external_table(reference));
        println!(
            "\nTotal: {} external library(ies) blocking {}",
            reference.libs.len(),
            reference.policy.name
        );
    } else {
        println!("No external libraries block the most restrictive tier.");
    }
}

/// The external references of the most restrictive tier, if any block it.
fn blocking_reference(result: &AuditResult) -> Option<&ExternalReference> {
    result
        .external_refs
        .values()
        .filter(|reference| !reference.libs.is_empty())
        .max_by_key(|reference| reference.policy.priority)
}

/// Create a table with the default preset styling.
fn default_table_preset() -> Table {
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::UTF8_FULL_CONDENSED)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS)
        .set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
    table
}

/// Create a table showing the sub-tier reached along each audit axis.
fn axis_table(result: &AuditResult) -> Table {
    let mut table = default_table_preset();
    table.set_header(vec![
        Cell::new("Axis").add_attribute(comfy_table::Attribute::Bold),
        Cell::new("Tier").add_attribute(comfy_table::Attribute::Bold),
        Cell::new("Priority").add_attribute(comfy_table::Attribute::Bold),
    ]);
    for (axis, tier) in [
        ("External libraries", &result.external_tier),
        ("Versioned symbols", &result.symbol_tier),
        ("String encoding", &result.encoding_tier),
        ("Forbidden symbols", &result.forbidden_tier),
        ("Instruction set", &result.machine_tier),
    ] {
        table.add_row(vec![
            Cell::new(axis),
            Cell::new(&tier.name),
            Cell::new(tier.priority),
        ]);
    }
    table.add_row(vec![
        Cell::new("Overall").add_attribute(comfy_table::Attribute::Bold),
        Cell::new(&result.overall.name).add_attribute(comfy_table::Attribute::Bold),
        Cell::new(result.overall.priority).add_attribute(comfy_table::Attribute::Bold),
    ]);
    table
}

/// Create a table listing the external libraries of one tier.
fn external_table(reference: &ExternalReference) -> Table {
    let mut table = default_table_preset();
    table.set_header(vec![
        Cell::new(format!("External library ({})", reference.policy.name))
            .add_attribute(comfy_table::Attribute::Bold),
        Cell::new("Resolved path").add_attribute(comfy_table::Attribute::Bold),
    ]);
    for (soname, realpath) in &reference.libs {
        let path = realpath
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "NOT FOUND".to_string());
        table.add_row(vec![Cell::new(soname), Cell::new(path)]);
    }
    for (soname, symbols) in &reference.blacklist {
        let symbols = symbols.iter().cloned().collect::<Vec<_>>().join(", ");
        table.add_row(vec![
            Cell::new(format!("{soname} (forbidden symbols)")),
            Cell::new(symbols),
        ]);
    }
    table
}
