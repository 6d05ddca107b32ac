//! Tests for the runtime protocol types and the command-line runtime.
//!
//! [`CliRuntime`] is pointed at `/bin/sh` running a small script that
//! records its arguments and answers like a runc-compatible binary.

use magikbuild::runtime::{ContainerState, ContainerStatus, CreateOptions, Signal};
use magikbuild::{CliRuntime, Error, OciRuntime};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const FAKE_RUNC: &str = r#"
log="$(dirname "$0")/calls"
echo "$*" >> "$log"
if [ "$1" = "--root" ]; then shift 2; fi
cmd="$1"; shift
case "$cmd" in
  create)
    while [ $# -gt 0 ]; do
      if [ "$1" = "--pid-file" ]; then echo 4242 > "$2"; fi
      shift
    done ;;
  state)
    if [ "$1" = "garbage" ]; then echo "not json"; exit 0; fi
    printf '{"ociVersion":"1.0.2","id":"%s","status":"running","pid":4242,"bundle":"/b"}' "$1" ;;
  delete)
    echo "container $1 does not exist" >&2; exit 1 ;;
esac
"#;

struct Fake {
    tmp: TempDir,
    runtime: CliRuntime,
}

impl Fake {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("runc.sh");
        std::fs::write(&script, FAKE_RUNC).unwrap();
        let runtime = CliRuntime::new("/bin/sh").with_global_args(vec![
            script.to_string_lossy().into_owned(),
            "--root".to_string(),
            "/run/magikbuild-test".to_string(),
        ]);
        Self { tmp, runtime }
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.tmp.path().join("calls"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    fn bundle(&self) -> PathBuf {
        let bundle = self.tmp.path().join("bundle");
        std::fs::create_dir_all(&bundle).unwrap();
        bundle
    }
}

fn pid_file(bundle: &Path) -> PathBuf {
    bundle.join("pidfile")
}

// =============================================================================
// ContainerStatus Tests
// =============================================================================

#[test]
fn test_container_status_display() {
    assert_eq!(format!("{}", ContainerStatus::Creating), "creating");
    assert_eq!(format!("{}", ContainerStatus::Created), "created");
    assert_eq!(format!("{}", ContainerStatus::Running), "running");
    assert_eq!(format!("{}", ContainerStatus::Stopped), "stopped");
    assert_eq!(format!("{}", ContainerStatus::Paused), "paused");
}

#[test]
fn test_container_status_serialization() {
    let json = serde_json::to_string(&ContainerStatus::Running).unwrap();
    assert_eq!(json, "\"running\"");
    let status: ContainerStatus = serde_json::from_str("\"stopped\"").unwrap();
    assert_eq!(status, ContainerStatus::Stopped);
}

#[test]
fn test_container_state_from_runtime_output() {
    let json = r#"{"ociVersion":"1.0.2","id":"c1","status":"created","pid":77,"bundle":"/b","rootfs":"/b/rootfs"}"#;
    let state: ContainerState = serde_json::from_str(json).unwrap();
    assert_eq!(state.id, "c1");
    assert_eq!(state.status, ContainerStatus::Created);
    assert_eq!(state.pid, Some(77));
    assert!(!state.is_running());
}

#[test]
fn test_container_state_new() {
    let state = ContainerState::new("c1", "/bundle", ContainerStatus::Running);
    assert!(state.is_running());
    assert_eq!(state.pid, None);
    assert!(!state.oci_version.is_empty());
}

// =============================================================================
// Signal Tests
// =============================================================================

#[test]
fn test_signal_parsing() {
    assert_eq!(Signal::from_str("SIGTERM"), Some(Signal::Term));
    assert_eq!(Signal::from_str("term"), Some(Signal::Term));
    assert_eq!(Signal::from_str("9"), Some(Signal::Kill));
    assert_eq!(Signal::from_str("SIGWINCH"), None);
}

#[test]
fn test_signal_numbers_round_trip() {
    for signal in [Signal::Term, Signal::Kill, Signal::Hup, Signal::Int, Signal::Quit] {
        assert_eq!(Signal::from_raw(signal.as_i32()), Some(signal));
    }
    assert_eq!(Signal::from_raw(0), None);
}

#[test]
fn test_forwarded_signals() {
    assert!(Signal::FORWARDED.contains(&Signal::Term));
    assert!(Signal::FORWARDED.contains(&Signal::Int));
    assert!(Signal::FORWARDED.contains(&Signal::Hup));
    assert!(!Signal::FORWARDED.contains(&Signal::Kill), "SIGKILL is never forwarded");
}

// =============================================================================
// CliRuntime Tests
// =============================================================================

#[tokio::test]
async fn test_create_passes_bundle_pid_file_and_extra_args() {
    let fake = Fake::new();
    let bundle = fake.bundle();
    let opts = CreateOptions {
        pid_file: pid_file(&bundle),
        extra_args: vec!["--no-pivot".to_string()],
        ..Default::default()
    };
    fake.runtime.create("c1", &bundle, opts).await.unwrap();

    let calls = fake.calls();
    assert_eq!(
        calls,
        vec![format!(
            "--root /run/magikbuild-test create --bundle {b} --pid-file {b}/pidfile --no-pivot c1",
            b = bundle.display()
        )],
        "global args first, container ID last"
    );
    assert_eq!(std::fs::read_to_string(pid_file(&bundle)).unwrap().trim(), "4242");
}

#[tokio::test]
async fn test_state_parses_json() {
    let fake = Fake::new();
    let state = fake.runtime.state("c1").await.unwrap();
    assert_eq!(state.id, "c1");
    assert_eq!(state.status, ContainerStatus::Running);
    assert_eq!(state.pid, Some(4242));
}

#[tokio::test]
async fn test_malformed_state_is_protocol_error() {
    let fake = Fake::new();
    let err = fake.runtime.state("garbage").await.unwrap_err();
    assert!(matches!(err, Error::Protocol { ref id, .. } if id == "garbage"));
}

#[tokio::test]
async fn test_kill_sends_signal_name() {
    let fake = Fake::new();
    fake.runtime.kill("c1", Signal::Term).await.unwrap();
    fake.runtime.start("c1").await.unwrap();
    assert_eq!(
        fake.calls(),
        vec![
            "--root /run/magikbuild-test kill c1 SIGTERM".to_string(),
            "--root /run/magikbuild-test start c1".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_failed_subcommand_carries_stderr() {
    let fake = Fake::new();
    let err = fake.runtime.delete("c1").await.unwrap_err();
    match &err {
        Error::RuntimeExit { command, id, .. } => {
            assert_eq!(command, "delete");
            assert_eq!(id, "c1");
        }
        other => panic!("expected runtime exit, got {other}"),
    }
    assert!(err.to_string().contains("container c1 does not exist"));
}

#[tokio::test]
async fn test_missing_binary_is_spawn_error() {
    let runtime = CliRuntime::new("/nonexistent/runc");
    assert_eq!(runtime.name(), "runc");
    let err = runtime.start("c1").await.unwrap_err();
    assert!(matches!(err, Error::Spawn { .. }));
}

#[test]
fn test_resolve_explicit_path_and_missing_name() {
    let runtime = CliRuntime::resolve(Some(Path::new("/usr/local/bin/crun"))).unwrap();
    assert_eq!(runtime.binary(), Path::new("/usr/local/bin/crun"));

    let err = CliRuntime::resolve(Some(Path::new("magikbuild-no-such-runtime"))).unwrap_err();
    assert!(matches!(err, Error::Spawn { .. }));
}
