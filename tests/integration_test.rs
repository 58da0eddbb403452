// Copyright (C) 2026 Checkmk GmbH - License: GNU General Public License v2
// This file is part of Checkmk (https://checkmk.com). It is subject to the terms and
// conditions defined in the file COPYING, which is part of this source code package.
mod common;

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use common::{ElfBuilder, RecordingPatcher};
use package_auditor::patcher::{Patchelf, Patcher};
use package_auditor::policy::audit::Auditor;
use package_auditor::repair::{repair, RepairError, RepairOptions};
use package_auditor::{Architecture, Package, PolicyCatalog, ResolveContext};

fn make_auditor() -> Auditor {
    let catalog = PolicyCatalog::load_default(Architecture::X86_64).expect("catalog should load");
    Auditor::new(catalog, Vec::new())
}

/// A package directory with one extension module and wheel-style metadata.
fn make_package_skeleton(root: &Path) {
    fs::create_dir_all(root.join("demo")).unwrap();
    fs::create_dir_all(root.join("demo-1.0.dist-info")).unwrap();
    fs::write(
        root.join("demo-1.0.dist-info/WHEEL"),
        "Wheel-Version: 1.0\nRoot-Is-Purelib: false\nTag: cp311-cp311-linux_x86_64\n",
    )
    .unwrap();
}

fn short_hash(path: &Path) -> String {
    let digest = Sha256::digest(fs::read(path).unwrap());
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

#[test]
fn test_audit_and_repair_external_library() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = dir.path().join("vendor");
    fs::create_dir_all(&vendor).unwrap();
    ElfBuilder::shared_object()
        .soname("libfoo.so.1")
        .write_to(&vendor.join("libfoo.so.1"));

    let root = dir.path().join("pkg");
    make_package_skeleton(&root);
    ElfBuilder::shared_object()
        .needs("libfoo.so.1")
        .rpath(&vendor.to_string_lossy())
        .write_to(&root.join("demo/ext.so"));

    let package = Package::from_path(&root).unwrap();
    let mut auditor = make_auditor();
    let result = auditor.audit(&package).unwrap();

    // libfoo is whitelisted by no tier, so only the baseline is claimable.
    assert_eq!(result.overall.priority, 0);
    assert_eq!(result.external_tier.priority, 0);
    let top_refs = &result.external_refs["manylinux_2_5_x86_64"];
    assert!(top_refs.libs.contains_key("libfoo.so.1"));

    let patcher = RecordingPatcher::new();
    let repaired = repair(
        &mut auditor,
        &package,
        "manylinux_2_5_x86_64",
        &patcher,
        &RepairOptions {
            strip: false,
            update_tags: true,
        },
    )
    .unwrap();
    assert_eq!(repaired, Some(package.root().to_path_buf()));

    // One grafted copy, named from the source content hash.
    let expected_name = format!("libfoo-{}.so.1", short_hash(&vendor.join("libfoo.so.1")));
    let grafted: Vec<PathBuf> = fs::read_dir(root.join("demo.libs"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(grafted.len(), 1);
    assert!(grafted[0].ends_with(&expected_name));

    let calls = patcher.calls();
    assert!(calls
        .iter()
        .any(|call| call.contains("replace_needed") && call.ends_with(&format!("libfoo.so.1 {expected_name}"))));
    assert!(calls
        .iter()
        .any(|call| call.contains("set_soname") && call.ends_with(&expected_name)));
    assert!(calls
        .iter()
        .any(|call| call.contains("set_rpath") && call.ends_with("$ORIGIN/../demo.libs")));

    // The tag metadata now claims the tier and its alias.
    let wheel = fs::read_to_string(root.join("demo-1.0.dist-info/WHEEL")).unwrap();
    assert!(wheel.contains("Tag: cp311-cp311-manylinux_2_5_x86_64"));
    assert!(wheel.contains("Tag: cp311-cp311-manylinux1_x86_64"));
}

#[test]
fn test_pie_script_executable_moves_behind_shim() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = dir.path().join("vendor");
    fs::create_dir_all(&vendor).unwrap();
    ElfBuilder::shared_object()
        .soname("libfoo.so.1")
        .write_to(&vendor.join("libfoo.so.1"));

    let root = dir.path().join("pkg");
    make_package_skeleton(&root);
    fs::create_dir_all(root.join("demo-1.0.data/scripts")).unwrap();
    let script = root.join("demo-1.0.data/scripts/demo-tool");
    // Position-independent executables are ET_DYN plus an interpreter, never
    // ET_EXEC.
    ElfBuilder::shared_object()
        .interpreter("/lib64/ld-linux-x86-64.so.2")
        .needs("libfoo.so.1")
        .rpath(&vendor.to_string_lossy())
        .write_to(&script);

    let package = Package::from_path(&root).unwrap();
    let mut auditor = make_auditor();
    let patcher = RecordingPatcher::new();

    repair(
        &mut auditor,
        &package,
        "manylinux_2_5_x86_64",
        &patcher,
        &RepairOptions::default(),
    )
    .unwrap()
    .expect("repair should graft");

    // The real binary moved into the scripts directory and a launcher shim
    // took its place.
    let relocated = root.join("demo.scripts/demo-tool");
    assert!(relocated.exists());
    let shim = fs::read_to_string(&script).unwrap();
    assert!(shim.starts_with("#!python"));
    assert!(shim.contains("sysconfig.get_path(\"platlib\")"));

    // The search path lands on the relocated binary, not on the shim.
    let set_rpath = patcher
        .calls()
        .into_iter()
        .find(|call| call.starts_with("set_rpath"))
        .unwrap();
    assert!(set_rpath.contains("demo.scripts/demo-tool"), "{set_rpath}");
    assert!(set_rpath.ends_with("$ORIGIN/../demo.libs"), "{set_rpath}");
}

/// A real shared object for tests that drive the real patchelf; skip when
/// the host lacks one.
fn host_shared_library() -> Option<PathBuf> {
    [
        "/lib/x86_64-linux-gnu/libz.so.1",
        "/lib/aarch64-linux-gnu/libz.so.1",
        "/usr/lib64/libz.so.1",
        "/usr/lib/libz.so.1",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|path| path.exists())
}

/// Copies a host library into a vendor directory and, as an extension module,
/// into a package skeleton, then rewires the copies with patchelf so the
/// package genuinely depends on a library no tier whitelists. Returns the
/// package root, or `None` when the host lacks the pieces.
fn make_patchable_package(dir: &Path, patcher: &Patchelf) -> Option<PathBuf> {
    let source = host_shared_library()?;

    let vendor = dir.join("vendor");
    fs::create_dir_all(&vendor).unwrap();
    let dep = vendor.join("libtestdep.so.1");
    fs::copy(&source, &dep).unwrap();
    patcher.set_soname(&dep, "libtestdep.so.1").unwrap();

    let root = dir.join("pkg");
    make_package_skeleton(&root);
    let ext = root.join("demo/ext.so");
    fs::copy(&source, &ext).unwrap();
    let added = std::process::Command::new("patchelf")
        .args(["--add-needed", "libtestdep.so.1"])
        .arg(&ext)
        .status()
        .ok()?;
    assert!(added.success());
    patcher.set_rpath(&ext, &vendor.to_string_lossy()).unwrap();
    Some(root)
}

#[test]
fn test_repaired_package_audits_clean_at_target_tier() {
    let Ok(patcher) = Patchelf::new() else {
        eprintln!("Skipping test_repaired_package_audits_clean_at_target_tier: no patchelf");
        return;
    };
    let Ok(arch) = std::env::consts::ARCH.parse::<Architecture>() else {
        eprintln!("Skipping test_repaired_package_audits_clean_at_target_tier: unsupported host");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let Some(root) = make_patchable_package(dir.path(), &patcher) else {
        eprintln!("Skipping test_repaired_package_audits_clean_at_target_tier: no host library");
        return;
    };

    let catalog = PolicyCatalog::load_default(arch).unwrap();
    let target = catalog.highest().name().to_string();
    let target_priority = catalog.highest().priority();

    let package = Package::from_path(&root).unwrap();
    let mut auditor = Auditor::new(catalog, Vec::new());
    let before = auditor.audit(&package).unwrap();
    assert_eq!(before.external_tier.priority, 0);
    assert!(before.external_refs[target.as_str()]
        .libs
        .contains_key("libtestdep.so.1"));

    let repaired = repair(
        &mut auditor,
        &package,
        &target,
        &patcher,
        &RepairOptions::default(),
    )
    .unwrap();
    assert!(repaired.is_some());

    // Scans are memoized per package root; a fresh auditor sees the repaired
    // files.
    let package = Package::from_path(&root).unwrap();
    let catalog = PolicyCatalog::load_default(arch).unwrap();
    let mut auditor = Auditor::new(catalog, Vec::new());
    let after = auditor.audit(&package).unwrap();
    assert!(after.external_refs[target.as_str()].libs.is_empty());
    assert_eq!(after.external_tier.priority, target_priority);
}

#[test]
fn test_second_repair_is_a_noop() {
    let Ok(patcher) = Patchelf::new() else {
        eprintln!("Skipping test_second_repair_is_a_noop: no patchelf");
        return;
    };
    let Ok(arch) = std::env::consts::ARCH.parse::<Architecture>() else {
        eprintln!("Skipping test_second_repair_is_a_noop: unsupported host");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let Some(root) = make_patchable_package(dir.path(), &patcher) else {
        eprintln!("Skipping test_second_repair_is_a_noop: no host library");
        return;
    };

    let catalog = PolicyCatalog::load_default(arch).unwrap();
    let target = catalog.highest().name().to_string();
    let package = Package::from_path(&root).unwrap();
    let mut auditor = Auditor::new(catalog, Vec::new());
    repair(
        &mut auditor,
        &package,
        &target,
        &patcher,
        &RepairOptions::default(),
    )
    .unwrap()
    .expect("first repair should graft");

    let package = Package::from_path(&root).unwrap();
    let catalog = PolicyCatalog::load_default(arch).unwrap();
    let mut auditor = Auditor::new(catalog, Vec::new());
    let second = repair(
        &mut auditor,
        &package,
        &target,
        &patcher,
        &RepairOptions::default(),
    )
    .unwrap();
    assert!(second.is_none(), "nothing external is left to graft");
}

#[test]
fn test_cycle_resolves_once_per_library() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = dir.path().join("vendor");
    fs::create_dir_all(&vendor).unwrap();
    ElfBuilder::shared_object()
        .soname("liba.so")
        .needs("libb.so")
        .write_to(&vendor.join("liba.so"));
    ElfBuilder::shared_object()
        .soname("libb.so")
        .needs("liba.so")
        .write_to(&vendor.join("libb.so"));
    let root_binary = dir.path().join("ext.so");
    ElfBuilder::shared_object()
        .needs("liba.so")
        .rpath(&vendor.to_string_lossy())
        .write_to(&root_binary);

    let mut ctx = ResolveContext::new(&[]).unwrap();
    let tree = ctx.resolve(&root_binary).unwrap();

    assert!(tree.libraries.contains_key("liba.so"));
    assert!(tree.libraries.contains_key("libb.so"));
    assert!(tree.libraries["liba.so"].needed.contains("libb.so"));
    assert!(tree.libraries["libb.so"].needed.contains("liba.so"));
}

#[test]
fn test_exclusion_removes_library_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = dir.path().join("vendor");
    fs::create_dir_all(&vendor).unwrap();
    ElfBuilder::shared_object()
        .soname("libfoo.so.1")
        .write_to(&vendor.join("libfoo.so.1"));
    ElfBuilder::shared_object()
        .soname("liba.so")
        .needs("libfoo.so.1")
        .write_to(&vendor.join("liba.so"));
    let root_binary = dir.path().join("ext.so");
    ElfBuilder::shared_object()
        .needs("liba.so")
        .needs("libfoo.so.1")
        .rpath(&vendor.to_string_lossy())
        .write_to(&root_binary);

    let mut ctx = ResolveContext::new(&["libfoo.so.*".to_string()]).unwrap();
    let tree = ctx.resolve(&root_binary).unwrap();

    assert!(!tree.needed.contains("libfoo.so.1"));
    assert!(!tree.libraries.contains_key("libfoo.so.1"));
    assert!(!tree.libraries["liba.so"].needed.contains("libfoo.so.1"));
}

#[test]
fn test_runpath_suppresses_rpath() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = dir.path().join("vendor");
    let decoy = dir.path().join("decoy");
    fs::create_dir_all(&vendor).unwrap();
    fs::create_dir_all(&decoy).unwrap();
    ElfBuilder::shared_object()
        .soname("libfoo.so.1")
        .write_to(&vendor.join("libfoo.so.1"));
    let root_binary = dir.path().join("ext.so");
    ElfBuilder::shared_object()
        .needs("libfoo.so.1")
        .rpath(&decoy.to_string_lossy())
        .runpath(&vendor.to_string_lossy())
        .write_to(&root_binary);

    let mut ctx = ResolveContext::new(&[]).unwrap();
    let tree = ctx.resolve(&root_binary).unwrap();

    assert!(tree.rpath.is_empty());
    assert_eq!(tree.runpath.len(), 1);
    let library = &tree.libraries["libfoo.so.1"];
    assert_eq!(
        library.realpath.as_deref(),
        Some(vendor.canonicalize().unwrap().join("libfoo.so.1")).as_deref()
    );
}

#[test]
fn test_repair_fails_on_unresolved_library() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("pkg");
    make_package_skeleton(&root);
    ElfBuilder::shared_object()
        .needs("libnowhere-to-be-found.so.42")
        .write_to(&root.join("demo/ext.so"));

    let package = Package::from_path(&root).unwrap();
    let mut auditor = make_auditor();
    let patcher = RecordingPatcher::new();

    let result = repair(
        &mut auditor,
        &package,
        "manylinux_2_5_x86_64",
        &patcher,
        &RepairOptions::default(),
    );
    assert!(matches!(
        result,
        Err(RepairError::UnresolvedLibrary { soname, .. }) if soname == "libnowhere-to-be-found.so.42"
    ));
    // Nothing was grafted.
    assert!(!root.join("demo.libs").exists());
}

#[test]
fn test_shared_dependency_grafted_once() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = dir.path().join("vendor");
    fs::create_dir_all(&vendor).unwrap();
    ElfBuilder::shared_object()
        .soname("libfoo.so.1")
        .write_to(&vendor.join("libfoo.so.1"));

    let root = dir.path().join("pkg");
    make_package_skeleton(&root);
    for name in ["ext_one.so", "ext_two.so"] {
        ElfBuilder::shared_object()
            .needs("libfoo.so.1")
            .rpath(&vendor.to_string_lossy())
            .write_to(&root.join("demo").join(name));
    }

    let package = Package::from_path(&root).unwrap();
    let mut auditor = make_auditor();
    let patcher = RecordingPatcher::new();

    repair(
        &mut auditor,
        &package,
        "manylinux_2_5_x86_64",
        &patcher,
        &RepairOptions::default(),
    )
    .unwrap()
    .expect("repair should graft");

    let grafted: Vec<PathBuf> = fs::read_dir(root.join("demo.libs"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(grafted.len(), 1, "both consumers share one physical copy");

    // Each consumer was relinked to the same new identity.
    let relinks: Vec<String> = patcher
        .calls()
        .into_iter()
        .filter(|call| call.contains("replace_needed"))
        .collect();
    assert_eq!(relinks.len(), 2);
}

#[test]
fn test_grafted_cross_references_are_fixed() {
    let dir = tempfile::tempdir().unwrap();
    let vendor = dir.path().join("vendor");
    fs::create_dir_all(&vendor).unwrap();
    ElfBuilder::shared_object()
        .soname("libbar.so.2")
        .write_to(&vendor.join("libbar.so.2"));
    ElfBuilder::shared_object()
        .soname("libfoo.so.1")
        .needs("libbar.so.2")
        .write_to(&vendor.join("libfoo.so.1"));

    let root = dir.path().join("pkg");
    make_package_skeleton(&root);
    ElfBuilder::shared_object()
        .needs("libfoo.so.1")
        .rpath(&vendor.to_string_lossy())
        .write_to(&root.join("demo/ext.so"));

    let package = Package::from_path(&root).unwrap();
    let mut auditor = make_auditor();
    let patcher = RecordingPatcher::new();

    repair(
        &mut auditor,
        &package,
        "manylinux_2_5_x86_64",
        &patcher,
        &RepairOptions::default(),
    )
    .unwrap()
    .expect("repair should graft");

    // Both libraries were copied, and the copy of libfoo had its reference
    // to libbar rewritten to the grafted identity.
    let foo_name = format!("libfoo-{}.so.1", short_hash(&vendor.join("libfoo.so.1")));
    let bar_name = format!("libbar-{}.so.2", short_hash(&vendor.join("libbar.so.2")));
    assert!(root.join("demo.libs").join(&foo_name).exists());
    assert!(root.join("demo.libs").join(&bar_name).exists());

    let cross_fix = patcher.calls().into_iter().any(|call| {
        call.contains("replace_needed")
            && call.contains(&foo_name)
            && call.ends_with(&format!("libbar.so.2 {bar_name}"))
    });
    assert!(cross_fix, "grafted copy must be relinked to the grafted name");
}
