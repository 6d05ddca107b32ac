//! Tests for per-run bundle directories.
//!
//! Validates bundle naming, isolation between runs of the same container,
//! and that `config.json` lands where the runtime expects it.

use magikbuild::{Bundle, OciSpec};
use std::path::Path;
use tempfile::TempDir;

fn owner() -> (u32, u32) {
    // SAFETY: geteuid/getegid have no preconditions.
    unsafe { (libc::geteuid(), libc::getegid()) }
}

// =============================================================================
// Layout Tests
// =============================================================================

#[test]
fn test_bundle_named_after_container() {
    let tmp = TempDir::new().unwrap();
    let bundle = Bundle::create(tmp.path(), "build-7", owner()).unwrap();
    let name = bundle.path().file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("build-7-bundle-"), "got {name}");
    assert_eq!(bundle.path().parent(), Some(tmp.path()));
}

#[test]
fn test_bundle_creates_missing_tmp_dir() {
    let tmp = TempDir::new().unwrap();
    let nested = tmp.path().join("run").join("magikbuild");
    let bundle = Bundle::create(&nested, "c1", owner()).unwrap();
    assert!(bundle.path().starts_with(&nested));
    assert!(bundle.path().is_dir());
}

#[test]
fn test_runs_of_same_container_get_separate_bundles() {
    let tmp = TempDir::new().unwrap();
    let first = Bundle::create(tmp.path(), "c1", owner()).unwrap();
    let second = Bundle::create(tmp.path(), "c1", owner()).unwrap();
    assert_ne!(first.path(), second.path(), "bundles must not be shared");
}

#[test]
fn test_console_socket_inside_bundle() {
    let tmp = TempDir::new().unwrap();
    let bundle = Bundle::create(tmp.path(), "c1", owner()).unwrap();
    assert_eq!(bundle.console_socket(), bundle.path().join("console.sock"));
}

// =============================================================================
// Config Tests
// =============================================================================

#[test]
fn test_spec_written_to_config_path() {
    let tmp = TempDir::new().unwrap();
    let mut bundle = Bundle::create(tmp.path(), "c1", owner()).unwrap();
    let spec = OciSpec::new(Path::new("/var/lib/rootfs"), vec!["make".to_string()]);

    spec.write_atomic(bundle.path()).unwrap();
    assert!(bundle.config_path().is_file());

    let loaded = OciSpec::load(bundle.path()).unwrap();
    assert_eq!(loaded.root.path, "/var/lib/rootfs");
    assert_eq!(loaded.process.unwrap().args, vec!["make".to_string()]);

    let path = bundle.path().to_path_buf();
    bundle.remove().unwrap();
    assert!(!path.exists(), "removal should take config.json with it");
}
