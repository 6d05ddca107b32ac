//! Tests for error types.
//!
//! Validates display formatting, phase tagging, and the runtime exit helper.

use magikbuild::error::ResultExt;
use magikbuild::{Error, Phase, Result};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Display Tests
// =============================================================================

#[test]
fn test_invalid_container_id_display() {
    let err = Error::InvalidContainerId {
        id: "bad/../id".to_string(),
        reason: "contains invalid characters".to_string(),
    };
    let msg = err.to_string();

    assert!(msg.contains("bad/../id"), "should include container ID");
    assert!(msg.contains("invalid container ID"), "should indicate invalid ID");
    assert!(msg.contains("contains invalid characters"), "should include reason");
}

#[test]
fn test_secret_required_display() {
    let msg = Error::SecretRequired("npmrc".to_string()).to_string();
    assert!(msg.contains("npmrc"), "should name the secret");
    assert!(msg.contains("required"), "should say it was required");
}

#[test]
fn test_reap_timeout_display() {
    let err = Error::ReapTimeout {
        pid: 4242,
        duration: Duration::from_secs(10),
    };
    let msg = err.to_string();
    assert!(msg.contains("4242"), "should include pid");
    assert!(msg.contains("not reaped"), "should describe the failure");
}

#[test]
fn test_hook_display() {
    let err = Error::Hook {
        path: PathBuf::from("/usr/libexec/hooks/prestart"),
        reason: "exited with status 2".to_string(),
    };
    let msg = err.to_string();
    assert!(msg.contains("/usr/libexec/hooks/prestart"), "should include hook path");
    assert!(msg.contains("status 2"), "should include reason");
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: Error = io.into();
    assert!(matches!(err, Error::Io(_)));
    assert!(err.to_string().contains("denied"));
}

#[test]
fn test_json_error_conversion() {
    let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: Error = json.into();
    assert!(matches!(err, Error::Serialization(_)));
}

// =============================================================================
// Runtime Exit Tests
// =============================================================================

#[test]
fn test_runtime_exit_with_output() {
    let err = Error::runtime_exit("create", "c1", "exit status: 1", "  container_linux.go: no such file\n");
    let msg = err.to_string();
    assert!(msg.contains("runtime create"), "should name the subcommand");
    assert!(msg.contains("'c1'"), "should name the container");
    assert!(msg.ends_with(": container_linux.go: no such file"), "got {msg}");
}

#[test]
fn test_runtime_exit_without_output() {
    let err = Error::runtime_exit("start", "c1", "exit status: 1", "   ");
    assert!(err.to_string().ends_with("(exit status: 1)"));
}

// =============================================================================
// Phase Tests
// =============================================================================

#[test]
fn test_phase_names_the_failing_stage() {
    let err = Error::Config("bad".to_string()).in_phase(Phase::MountAssembly);
    assert_eq!(err.phase(), Some(Phase::MountAssembly));
    assert!(err.to_string().starts_with("mount assembly: "));
    assert!(matches!(err.root(), Error::Config(_)));
}

#[test]
fn test_innermost_phase_wins() {
    let err = Error::Internal("x".to_string())
        .in_phase(Phase::Create)
        .in_phase(Phase::Cleanup);
    assert_eq!(err.phase(), Some(Phase::Create));
}

#[test]
fn test_untagged_error_has_no_phase() {
    let err = Error::Internal("x".to_string());
    assert_eq!(err.phase(), None);
    assert!(matches!(err.root(), Error::Internal(_)));
}

#[test]
fn test_result_ext_tags_errors_only() {
    let ok: Result<u32> = Ok(1);
    assert_eq!(ok.phase(Phase::Start).unwrap(), 1);

    let failed: Result<u32> = Err(Error::Internal("boom".to_string()));
    let err = failed.phase(Phase::Start).unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Start));
}

#[test]
fn test_phase_display() {
    let names: Vec<String> = [
        Phase::Namespace,
        Phase::MountAssembly,
        Phase::Bundle,
        Phase::Create,
        Phase::Start,
        Phase::Supervision,
        Phase::Network,
        Phase::Cleanup,
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    assert!(names.iter().all(|n| !n.is_empty()));
    assert!(names.contains(&"container supervision".to_string()));
}
