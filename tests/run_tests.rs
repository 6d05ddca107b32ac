//! End-to-end run tests.
//!
//! Drives [`Runner::run`] against the fake runtime: namespace planning,
//! generated /etc files, mount assembly, orchestration and cleanup.

mod common;

use common::{CallerPipes, Call, FakeRuntime, Step, rootfs, self_mapping, sh};
use magikbuild::hooks::Hook;
use magikbuild::namespace::IdMappingOptions;
use magikbuild::orchestrator::LifecycleState;
use magikbuild::{
    BuildContainer, Collaborators, EngineConfig, Error, Isolation, NetworkPolicy, OciRuntime, Phase, RunOptions, Runner,
    WaitStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

struct Env {
    tmp: TempDir,
    tmp_dir: PathBuf,
    cache_parent: PathBuf,
    container: BuildContainer,
}

impl Env {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let tmp_dir = tmp.path().join("run");
        let cache_parent = tmp.path().join("cache");
        let container_dir = tmp.path().join("container");
        std::fs::create_dir_all(&container_dir).unwrap();
        let container = BuildContainer {
            name: "0123456789abcdef".to_string(),
            rootfs: rootfs(tmp.path()),
            container_dir,
            id_mappings: IdMappingOptions::default(),
            work_dir: "/".to_string(),
            ..Default::default()
        };
        Self {
            tmp,
            tmp_dir,
            cache_parent,
            container,
        }
    }

    fn config(&self) -> EngineConfig {
        let resolv = self.tmp.path().join("host-resolv.conf");
        std::fs::write(&resolv, "nameserver 10.0.0.2\n").unwrap();
        let mut config = EngineConfig::default()
            .with_isolation(Isolation::Oci)
            .with_tmp_dir(&self.tmp_dir)
            .with_cache_parent(&self.cache_parent)
            .with_mounts_file(None);
        config.host_resolv_conf = resolv;
        config
    }

    fn runner(&self, runtime: &Arc<FakeRuntime>) -> Runner {
        let runtime: Arc<dyn OciRuntime> = runtime.clone();
        Runner::new(self.config(), runtime, Collaborators::default())
    }

    fn leftover_bundles(&self) -> usize {
        std::fs::read_dir(&self.tmp_dir).map(|d| d.count()).unwrap_or(0)
    }
}

fn options(args: Vec<String>, pipes: &CallerPipes) -> RunOptions {
    RunOptions {
        args,
        stdio: Some(pipes.endpoints()),
        ..Default::default()
    }
}

// =============================================================================
// Success Tests
// =============================================================================

#[tokio::test]
async fn test_run_echo_in_container() {
    let env = Env::new();
    let runtime = Arc::new(FakeRuntime::new());
    let pipes = CallerPipes::with_input(b"");

    let report = env
        .runner(&runtime)
        .run(&env.container, options(sh("echo hi"), &pipes))
        .await
        .unwrap();

    assert_eq!(report.status, WaitStatus::Exited(0));
    assert_eq!(report.exit_code(), Some(0));
    assert_eq!(
        &report.transitions[..3],
        &[LifecycleState::Bundled, LifecycleState::Created, LifecycleState::Started]
    );
    assert_eq!(report.transitions.last(), Some(&LifecycleState::Stopped));

    let specs = runtime.specs();
    assert_eq!(specs.len(), 1);
    let destinations: Vec<&str> = specs[0].mounts.iter().map(|m| m.destination.as_str()).collect();
    for file in ["/etc/hosts", "/etc/hostname", "/etc/resolv.conf"] {
        assert!(destinations.contains(&file), "{file} should be bind mounted");
    }
    assert_eq!(specs[0].hostname, "0123456789ab");

    assert_eq!(env.leftover_bundles(), 0, "bundle removed after the run");
    assert_eq!(runtime.count(|c| matches!(c, Call::Delete(_))), 1);
    let (stdout, _) = pipes.finish();
    assert_eq!(stdout, "hi\n");
}

#[tokio::test]
async fn test_run_reports_nonzero_exit() {
    let env = Env::new();
    let runtime = Arc::new(FakeRuntime::new());
    let pipes = CallerPipes::with_input(b"");
    let report = env
        .runner(&runtime)
        .run(&env.container, options(sh("echo oops >&2; exit 42"), &pipes))
        .await
        .unwrap();
    assert_eq!(report.exit_code(), Some(42));
    let (_, stderr) = pipes.finish();
    assert_eq!(stderr, "oops\n");
}

#[tokio::test]
async fn test_run_with_disabled_network() {
    let mut env = Env::new();
    env.container.network = NetworkPolicy::Disabled;
    let runtime = Arc::new(FakeRuntime::new());
    let pipes = CallerPipes::with_input(b"");
    env.runner(&runtime)
        .run(&env.container, options(sh("true"), &pipes))
        .await
        .unwrap();

    let spec = &runtime.specs()[0];
    let namespaces = &spec.linux.as_ref().unwrap().namespaces;
    assert!(
        !namespaces.iter().any(|n| n.ns_type == "network"),
        "disabled network shares the host namespace"
    );
}

#[tokio::test]
async fn test_run_mounts_and_cache_cleanup() {
    let env = Env::new();
    let runtime = Arc::new(FakeRuntime::new());
    let pipes = CallerPipes::with_input(b"");
    let mut opts = options(sh("true"), &pipes);
    opts.run_mounts = vec![
        "type=cache,target=/root/.cache".to_string(),
        "type=tmpfs,target=/scratch".to_string(),
    ];
    // Cache directories are chowned to container root.
    let mut container = env.container.clone();
    container.id_mappings = self_mapping();
    env.runner(&runtime).run(&container, opts).await.unwrap();

    let spec = &runtime.specs()[0];
    assert!(spec.mounts.iter().any(|m| m.destination == "/root/.cache"));
    assert!(spec.mounts.iter().any(|m| m.destination == "/scratch" && m.mount_type == "tmpfs"));
    assert!(!env.container.rootfs.join("scratch").exists(), "created mount targets are removed");
}

#[tokio::test]
async fn test_cache_lock_released_between_runs() {
    let mut env = Env::new();
    env.container.id_mappings = self_mapping();
    let runtime = Arc::new(FakeRuntime::new());
    let runner = env.runner(&runtime);
    for _ in 0..2 {
        let pipes = CallerPipes::with_input(b"");
        let mut opts = options(sh("true"), &pipes);
        opts.run_mounts = vec!["type=cache,target=/cache".to_string()];
        let run = runner.run(&env.container, opts);
        tokio::time::timeout(std::time::Duration::from_secs(30), run)
            .await
            .expect("a finished run must not keep the cache locked")
            .unwrap();
    }
    assert_eq!(runtime.count(|c| matches!(c, Call::Create(_))), 2);
}

#[tokio::test]
async fn test_concurrent_runs_share_a_locked_cache() {
    let first = Env::new();
    let mut second = Env::new();
    second.cache_parent = first.cache_parent.clone();
    second.container.name = "fedcba9876543210".to_string();
    let runtime = Arc::new(FakeRuntime::new());

    let mut first_container = first.container.clone();
    first_container.id_mappings = self_mapping();
    let mut second_container = second.container.clone();
    second_container.id_mappings = self_mapping();

    let first_pipes = CallerPipes::with_input(b"");
    let second_pipes = CallerPipes::with_input(b"");
    let mut first_opts = options(sh("sleep 1"), &first_pipes);
    first_opts.run_mounts = vec!["type=cache,target=/cache,id=shared".to_string()];
    let mut second_opts = options(sh("true"), &second_pipes);
    second_opts.run_mounts = vec!["type=cache,target=/cache,id=shared".to_string()];

    let first_runner = first.runner(&runtime);
    let second_runner = second.runner(&runtime);
    let both = async {
        tokio::join!(
            first_runner.run(&first_container, first_opts),
            second_runner.run(&second_container, second_opts),
        )
    };
    let (a, b) = tokio::time::timeout(std::time::Duration::from_secs(20), both)
        .await
        .expect("a run waiting on the cache lock must not stall the other");
    assert_eq!(a.unwrap().exit_code(), Some(0));
    assert_eq!(b.unwrap().exit_code(), Some(0));
    assert_eq!(runtime.count(|c| matches!(c, Call::Create(_))), 2);
}

// =============================================================================
// Failure Tests
// =============================================================================

#[tokio::test]
async fn test_invalid_name_fails_before_anything_exists() {
    let mut env = Env::new();
    env.container.name = "../escape".to_string();
    let runtime = Arc::new(FakeRuntime::new());
    let pipes = CallerPipes::with_input(b"");
    let err = env
        .runner(&runtime)
        .run(&env.container, options(sh("true"), &pipes))
        .await
        .unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Namespace));
    assert!(matches!(err.root(), Error::InvalidContainerId { .. }));
    assert!(runtime.calls().is_empty());
    assert_eq!(env.leftover_bundles(), 0);
}

#[tokio::test]
async fn test_mount_failure_aborts_before_create() {
    let env = Env::new();
    let runtime = Arc::new(FakeRuntime::new());
    let pipes = CallerPipes::with_input(b"");
    let mut opts = options(sh("true"), &pipes);
    opts.run_mounts = vec!["type=secret,id=token,required".to_string()];
    let err = env.runner(&runtime).run(&env.container, opts).await.unwrap_err();

    assert_eq!(err.phase(), Some(Phase::MountAssembly));
    assert!(matches!(err.root(), Error::SecretRequired(_)));
    assert!(runtime.calls().is_empty(), "no runtime process for a bad mount");
    assert_eq!(env.leftover_bundles(), 0, "bundle removed on failure");
}

#[tokio::test]
async fn test_failing_hook_aborts_before_create() {
    let env = Env::new();
    let runtime = Arc::new(FakeRuntime::new());
    let pipes = CallerPipes::with_input(b"");
    let mut opts = options(sh("true"), &pipes);
    opts.hooks = vec![Hook {
        path: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), "exit 1".to_string()],
        ..Default::default()
    }];
    let err = env.runner(&runtime).run(&env.container, opts).await.unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Bundle));
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_create_failure_cleans_up() {
    let env = Env::new();
    let runtime = Arc::new(FakeRuntime::failing_at(Step::Create));
    let pipes = CallerPipes::with_input(b"");
    let err = env
        .runner(&runtime)
        .run(&env.container, options(sh("true"), &pipes))
        .await
        .unwrap_err();

    assert_eq!(err.phase(), Some(Phase::Create));
    assert!(err.to_string().contains("cannot create container"), "got {err}");
    assert_eq!(runtime.count(|c| matches!(c, Call::Delete(_))), 0);
    assert_eq!(env.leftover_bundles(), 0);
}

#[tokio::test]
async fn test_delete_failure_is_reported_after_cleanup() {
    let env = Env::new();
    let runtime = Arc::new(FakeRuntime::failing_at(Step::Delete));
    let pipes = CallerPipes::with_input(b"");
    let err = env
        .runner(&runtime)
        .run(&env.container, options(sh("exit 7"), &pipes))
        .await
        .unwrap_err();
    assert_eq!(err.phase(), Some(Phase::Cleanup));
    assert_eq!(runtime.count(|c| matches!(c, Call::Delete(_))), 1);
    assert_eq!(env.leftover_bundles(), 0, "bundle removed even when delete fails");
}
