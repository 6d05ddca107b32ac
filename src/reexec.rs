//! Re-executed runtime child.
//!
//! When a run's network namespace has to be configured between `create` and
//! `start`, the runtime is driven from a re-executed copy of this binary so
//! the parent can do that work from outside the container's lifecycle.
//!
//! ```text
//!   parent                                   child (argv[0] = magikbuild-runtime)
//!   ──────                                   ─────
//!   fd 3 ── SubprocessConfig (JSON) ──────►  read config, become subreaper
//!                                            create
//!   fd 4 ◄────────────── 1 byte ──────────   "created"
//!   configure network, /etc/hosts
//!   fd 5 ─────────────── 1 byte ─────────►   start, supervise, delete
//!   wait, forwarding HUP/INT/TERM            exit with the container's code
//! ```
//!
//! Handlers are looked up by `argv[0]` in a [`Registry`] the binary consults
//! before doing anything else.

use crate::collaborators::NetworkConfigurator;
use crate::constants::{
    CHILD_CONFIG_FD, CHILD_CREATED_FD, CHILD_FD_STAGING_MIN, CHILD_START_FD, HANDSHAKE_TIMEOUT, LOGLEVEL_ENV,
    PID_FILE, RUNTIME_CHILD_COMMAND,
};
use crate::error::{Error, Phase, Result, ResultExt};
use crate::orchestrator::{AfterCreate, Handshake, OrchestrateRequest, Orchestrator, WaitStatus};
use crate::relay::RelayEndpoints;
use crate::runtime::Signal;
use crate::runtimes::CliRuntime;
use crate::spec::OciSpec;
use crate::{etc, logging, sys};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

// =============================================================================
// Registry
// =============================================================================

/// Entry point of a re-executed command; returns the process exit code.
pub type Handler = fn() -> i32;

/// Maps re-exec command names to handlers.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    handlers: BTreeMap<&'static str, Handler>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handlers this crate needs.
    pub fn with_defaults() -> Self {
        Self::new().register(RUNTIME_CHILD_COMMAND, runtime_child_main)
    }

    pub fn register(mut self, name: &'static str, handler: Handler) -> Self {
        self.handlers.insert(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Runs the handler named by this process's `argv[0]`, if any.
    pub fn dispatch(&self) -> Option<i32> {
        let arg0 = std::env::args_os().next()?;
        let name = Path::new(&arg0).file_name()?.to_str()?;
        let handler = self.handlers.get(name)?;
        Some(handler())
    }
}

/// A command re-executing this binary as `name`.
pub fn command(name: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new("/proc/self/exe");
    cmd.arg0(name);
    cmd
}

// =============================================================================
// Child configuration
// =============================================================================

/// Everything the runtime child needs, sent over fd 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubprocessConfig {
    pub runtime: PathBuf,
    #[serde(default)]
    pub runtime_args: Vec<String>,
    pub container_name: String,
    pub bundle: PathBuf,
    pub spec: OciSpec,
    #[serde(default)]
    pub stdio_owner: Option<(u32, u32)>,
    #[serde(default)]
    pub extra_create_args: Vec<String>,
    /// True if the parent configures the network between create and start.
    #[serde(default)]
    pub configure_network: bool,
}

/// Handler for [`RUNTIME_CHILD_COMMAND`].
pub fn runtime_child_main() -> i32 {
    logging::init();
    match run_child() {
        Ok(status) => status.exit_code().unwrap_or(1),
        Err(e) => {
            tracing::error!(error = %e, "runtime child failed");
            1
        }
    }
}

fn run_child() -> Result<WaitStatus> {
    if let Err(e) = sys::set_child_subreaper() {
        tracing::warn!(error = %e, "could not become child subreaper");
    }

    // SAFETY: the parent installed these descriptors before exec and nothing
    // else in this process owns them.
    let (config_fd, created, start) = unsafe {
        (
            OwnedFd::from_raw_fd(CHILD_CONFIG_FD),
            OwnedFd::from_raw_fd(CHILD_CREATED_FD),
            OwnedFd::from_raw_fd(CHILD_START_FD),
        )
    };
    let mut payload = Vec::new();
    File::from(config_fd).read_to_end(&mut payload)?;
    let config: SubprocessConfig = serde_json::from_slice(&payload)?;
    tracing::debug!(container = %config.container_name, runtime = %config.runtime.display(), "runtime child starting");

    let after_create = config
        .configure_network
        .then(|| AfterCreate::Handshake(Handshake { created, start }));
    let runtime = CliRuntime::new(&config.runtime).with_global_args(config.runtime_args);
    let orchestrator = Orchestrator::new(Arc::new(runtime));
    let request = OrchestrateRequest {
        container_name: config.container_name,
        bundle: config.bundle,
        spec: config.spec,
        stdio_owner: config.stdio_owner,
        extra_create_args: config.extra_create_args,
        caller: RelayEndpoints::default(),
        after_create,
    };

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let outcome = rt.block_on(async move {
        let interrupts = signal_forwarder()?;
        orchestrator.run(request, interrupts).await
    })?;
    Ok(outcome.status)
}

// =============================================================================
// Signals
// =============================================================================

/// Streams the signals forwarded to containers (HUP, INT, TERM).
///
/// Must be called from within a tokio runtime.
pub fn signal_forwarder() -> Result<mpsc::Receiver<Signal>> {
    let (tx, rx) = mpsc::channel(16);
    for sig in Signal::FORWARDED {
        let mut stream = signal(SignalKind::from_raw(sig.as_i32()))?;
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });
    }
    Ok(rx)
}

// =============================================================================
// Parent side
// =============================================================================

/// Network work done by the parent once the container exists.
pub struct NetworkStep {
    pub configurator: Arc<dyn NetworkConfigurator>,
    pub container: String,
    pub networks: Vec<String>,
    /// Generated hosts file to extend with the network's entries.
    pub hosts_file: Option<PathBuf>,
}

impl std::fmt::Debug for NetworkStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkStep")
            .field("container", &self.container)
            .field("networks", &self.networks)
            .field("hosts_file", &self.hosts_file)
            .finish_non_exhaustive()
    }
}

/// Undoes a network configuration after the container exits.
pub type NetworkTeardown = Box<dyn FnOnce() + Send>;

impl NetworkStep {
    /// Configures the namespace of `pid` and records host entries.
    pub fn apply(self, pid: libc::pid_t) -> Result<Option<NetworkTeardown>> {
        let setup = self.configurator.configure(pid, &self.container, &self.networks)?;
        if let Some(hosts) = &self.hosts_file {
            etc::add_host_entries(hosts, &setup.host_entries)?;
        }
        tracing::debug!(container = %self.container, pid, entries = setup.host_entries.len(), "network configured");
        Ok(setup.teardown)
    }
}

/// Runs the container from a re-executed child and waits for it.
///
/// Signals from `interrupts` are relayed to the child, which forwards them
/// to the container. A network failure is reported only after the child has
/// exited.
pub async fn run_isolated(
    config: &SubprocessConfig,
    network: Option<NetworkStep>,
    mut interrupts: mpsc::Receiver<Signal>,
) -> Result<WaitStatus> {
    let payload = serde_json::to_vec(config)?;
    let (config_r, config_w) = sys::pipe()?;
    let (created_r, created_w) = sys::pipe()?;
    let (start_r, start_w) = sys::pipe()?;

    // Staged above the target numbers so no dup2 overwrites a later source.
    let staged = [
        sys::dup_above(config_r.as_fd(), CHILD_FD_STAGING_MIN)?,
        sys::dup_above(created_w.as_fd(), CHILD_FD_STAGING_MIN)?,
        sys::dup_above(start_r.as_fd(), CHILD_FD_STAGING_MIN)?,
    ];
    drop((config_r, created_w, start_r));
    let sources: [RawFd; 3] = [staged[0].as_raw_fd(), staged[1].as_raw_fd(), staged[2].as_raw_fd()];
    let targets = [CHILD_CONFIG_FD, CHILD_CREATED_FD, CHILD_START_FD];

    let mut cmd = command(RUNTIME_CHILD_COMMAND);
    cmd.env(LOGLEVEL_ENV, logging::level_env_value());
    // SAFETY: only prctl and dup2 run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            sys::set_parent_death_signal(libc::SIGKILL)?;
            for (src, dst) in sources.iter().zip(targets) {
                if libc::dup2(*src, dst) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
    let mut child = tokio::process::Command::from(cmd).spawn().map_err(|source| Error::Spawn {
        runtime: RUNTIME_CHILD_COMMAND.to_string(),
        source,
    })?;
    drop(staged);
    let child_pid = child.id().map(|p| p as libc::pid_t);
    tracing::debug!(container = %config.container_name, pid = ?child_pid, "runtime child spawned");

    let writer = tokio::task::spawn_blocking(move || File::from(config_w).write_all(&payload));

    // Relay signals while the child is still creating the container too.
    let pid_file = config.bundle.join(PID_FILE);
    let exchange = async move {
        match network {
            Some(step) => handshake(created_r, start_w, step, &pid_file).await,
            None => {
                drop((created_r, start_w));
                Ok(None)
            }
        }
    };
    let network_result = relaying(exchange, &mut interrupts, child_pid).await;
    let (network_result, teardown) = match network_result {
        Ok(teardown) => (Ok(()), teardown),
        Err(e) => (Err(e), None),
    };

    let status = relaying(child.wait(), &mut interrupts, child_pid).await?;

    if let Some(teardown) = teardown {
        teardown();
    }
    match writer.await {
        Ok(Err(e)) => tracing::debug!(error = %e, "runtime child did not read its configuration"),
        Err(e) => tracing::debug!(error = %e, "configuration writer failed"),
        Ok(Ok(())) => {}
    }
    network_result?;

    Ok(match (status.code(), status.signal()) {
        (Some(code), _) => WaitStatus::Exited(code),
        (None, Some(signal)) => WaitStatus::Signaled(signal),
        _ => WaitStatus::Unknown,
    })
}

/// Drives `fut` to completion, relaying interrupts to the runtime child
/// meanwhile.
async fn relaying<T>(
    fut: impl Future<Output = T>,
    interrupts: &mut mpsc::Receiver<Signal>,
    child: Option<libc::pid_t>,
) -> T {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            Some(sig) = interrupts.recv() => {
                let Some(pid) = child else { continue };
                tracing::debug!(%sig, pid, "relaying signal to runtime child");
                if let Err(e) = sys::kill(pid, sig.as_i32()) {
                    tracing::warn!(%sig, error = %e, "failed to signal runtime child");
                }
            }
        }
    }
}

/// Parent half of the handshake. The pipe ends are closed on return, so the
/// child sees end-of-file if the network could not be configured.
async fn handshake(
    created: OwnedFd,
    start: OwnedFd,
    step: NetworkStep,
    pid_file: &Path,
) -> Result<Option<NetworkTeardown>> {
    let ready = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
        if !sys::wait_readable(created.as_fd(), Some(HANDSHAKE_TIMEOUT))? {
            return Ok(false);
        }
        Ok(sys::read_byte(created.as_fd())?.is_some())
    })
    .await
    .map_err(|e| Error::Internal(format!("handshake task failed: {e}")))??;

    if !ready {
        tracing::warn!(container = %step.container, "runtime child never reported the container created, skipping network setup");
        return Ok(None);
    }

    let pid = sys::read_pid_file(pid_file).map_err(Error::from).phase(Phase::Network)?;
    let teardown = step.apply(pid).phase(Phase::Network)?;
    sys::write_byte(start.as_fd(), b's').map_err(Error::from).phase(Phase::Network)?;
    Ok(teardown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> i32 {
        7
    }

    #[test]
    fn test_registry_lookup() {
        let registry = Registry::with_defaults().register("other", noop);
        assert!(registry.contains(RUNTIME_CHILD_COMMAND));
        assert!(registry.contains("other"));
        assert!(!registry.contains("magikbuild"));
    }

    #[test]
    fn test_registry_ignores_unregistered_argv0() {
        // The test harness binary is not a registered command.
        assert_eq!(Registry::new().register("not-this-binary", noop).dispatch(), None);
    }

    #[tokio::test]
    async fn test_interrupts_reach_child_before_handshake_completes() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().map(|id| id as libc::pid_t);
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Signal::Term).await.unwrap();

        // Stands in for a handshake that is still waiting on the child.
        let pending = tokio::time::sleep(std::time::Duration::from_millis(500));
        relaying(pending, &mut rx, pid).await;

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .expect("child should have been signalled")
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_interrupts_without_child_are_dropped() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Signal::Int).await.unwrap();
        assert_eq!(relaying(async { 3 }, &mut rx, None).await, 3);
    }

    #[test]
    fn test_subprocess_config_round_trip_defaults() {
        let json = r#"{"runtime":"/usr/bin/crun","container_name":"c1","bundle":"/b",
            "spec":{"ociVersion":"1.0.2","root":{"path":"/r"}}}"#;
        let config: SubprocessConfig = serde_json::from_str(json).unwrap();
        assert!(!config.configure_network);
        assert!(config.extra_create_args.is_empty());
        assert_eq!(config.spec.root.path, "/r");
    }
}
