//! # Runtime Process Orchestrator
//!
//! Drives one container through the OCI runtime lifecycle and supervises it
//! until it exits.
//!
//! ## Lifecycle
//!
//! ```text
//!   Bundled ──► Created ──► Started ──► Running ──► Stopped
//!                  │            │          │
//!                  └────────────┴──────────┴──► teardown (kill?, reap, delete)
//! ```
//!
//! | Step     | Action                                              | On failure            |
//! |----------|-----------------------------------------------------|-----------------------|
//! | Bundled  | `config.json` written atomically                    | return, nothing to undo |
//! | Created  | `create --bundle --pid-file [--console-socket]`     | return with runtime output |
//! | reaper   | dedicated thread blocks in `wait4` on the init PID  | status `Unknown`      |
//! | handshake| network configured between create and start         | teardown              |
//! | Started  | `start`                                             | teardown              |
//! | Running  | `state` every 100ms, raced against relay and signals| teardown              |
//!
//! Once `create` has succeeded every exit path runs the same teardown:
//! `kill SIGKILL` unless the container is already known stopped, wait for the
//! reaper (bounded by [`REAP_GRACE_PERIOD`]), `delete` exactly once, then stop
//! and join the stdio relay.
//!
//! ## Signals
//!
//! Signals received on the interrupt channel are forwarded with
//! `kill <id> <signal>`; supervision continues until the container stops.

use crate::constants::{
    CONSOLE_SOCKET, PID_FILE, REAP_GRACE_PERIOD, STATE_POLL_INTERVAL, STOP_GRACE_PERIOD, validate_container_id,
};
use crate::error::{Error, Phase, Result, ResultExt};
use crate::relay::{self, ContainerSide, RelayEndpoints, RelayHandle, StdioRelay};
use crate::runtime::{ContainerStatus, CreateOptions, CreateStdio, OciRuntime, Signal};
use crate::spec::OciSpec;
use crate::sys;
use std::fmt;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

// =============================================================================
// Outcome
// =============================================================================

/// How the container's init process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Exited(i32),
    Signaled(i32),
    /// The process could not be waited for.
    Unknown,
}

impl WaitStatus {
    /// Decodes a raw `wait4` status.
    pub fn from_raw(raw: libc::c_int) -> Self {
        if libc::WIFEXITED(raw) {
            Self::Exited(libc::WEXITSTATUS(raw))
        } else if libc::WIFSIGNALED(raw) {
            Self::Signaled(libc::WTERMSIG(raw))
        } else {
            Self::Unknown
        }
    }

    /// Shell-style exit code: the exit status, or 128 + signal.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(signal) => Some(128 + signal),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::Unknown => write!(f, "unknown status"),
        }
    }
}

/// Lifecycle states a run passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Bundled,
    Created,
    Started,
    Running,
    Stopped,
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// PID of the container init, as written by the runtime.
    pub pid: libc::pid_t,
    pub status: WaitStatus,
    pub transitions: Vec<LifecycleState>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.exit_code()
    }
}

// =============================================================================
// Request
// =============================================================================

/// Parent/child pipes of the network handshake.
///
/// The child writes one byte on `created` once the container (and so its
/// network namespace) exists, then blocks until the parent writes one byte
/// on `start`.
#[derive(Debug)]
pub struct Handshake {
    /// Write end; signals the parent.
    pub created: OwnedFd,
    /// Read end; the parent's go-ahead.
    pub start: OwnedFd,
}

impl Handshake {
    fn exchange(self, id: &str) -> Result<()> {
        sys::write_byte(self.created.as_fd(), b'c')?;
        drop(self.created);
        match sys::read_byte(self.start.as_fd())? {
            Some(_) => Ok(()),
            None => Err(Error::Protocol {
                id: id.to_string(),
                reason: "parent closed the start pipe before network setup completed".to_string(),
            }),
        }
    }
}

/// Work done between `create` and `start`.
pub enum AfterCreate {
    /// Running in a re-executed child; the parent configures the network.
    Handshake(Handshake),
    /// Configure in-process, given the container init PID.
    Configure(Box<dyn FnOnce(libc::pid_t) -> Result<()> + Send>),
}

impl fmt::Debug for AfterCreate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake(h) => f.debug_tuple("Handshake").field(h).finish(),
            Self::Configure(_) => f.write_str("Configure(..)"),
        }
    }
}

/// One container run.
#[derive(Debug)]
pub struct OrchestrateRequest {
    pub container_name: String,
    /// Bundle directory; `config.json`, the pid file and the console socket
    /// are created inside it.
    pub bundle: PathBuf,
    pub spec: OciSpec,
    /// Host IDs the container ends of the stdio pipes are chowned to.
    pub stdio_owner: Option<(u32, u32)>,
    pub extra_create_args: Vec<String>,
    pub caller: RelayEndpoints,
    pub after_create: Option<AfterCreate>,
}

impl OrchestrateRequest {
    pub fn new(container_name: impl Into<String>, bundle: impl Into<PathBuf>, spec: OciSpec) -> Self {
        Self {
            container_name: container_name.into(),
            bundle: bundle.into(),
            spec,
            stdio_owner: None,
            extra_create_args: Vec::new(),
            caller: RelayEndpoints::default(),
            after_create: None,
        }
    }
}

// =============================================================================
// Reaper
// =============================================================================

/// Waits for the container init on its own thread.
struct Reaper {
    pid: libc::pid_t,
    stopped: Arc<AtomicBool>,
    status: oneshot::Receiver<WaitStatus>,
}

impl Reaper {
    fn spawn(pid: libc::pid_t) -> Result<Self> {
        let stopped = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();
        let flag = Arc::clone(&stopped);
        std::thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || {
                let status = reap(pid);
                tracing::debug!(pid, %status, "container process exited");
                flag.store(true, Ordering::SeqCst);
                let _ = tx.send(status);
            })?;
        Ok(Self { pid, stopped, status: rx })
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

fn reap(pid: libc::pid_t) -> WaitStatus {
    match sys::wait4(pid) {
        Ok(raw) => WaitStatus::from_raw(raw),
        Err(e) if e.raw_os_error() == Some(libc::ECHILD) => {
            // Not our child (no subreaper): watch for it to disappear.
            tracing::debug!(pid, "container init is not a child, polling for exit");
            while sys::kill(pid, 0).is_ok() {
                std::thread::sleep(STATE_POLL_INTERVAL);
            }
            WaitStatus::Unknown
        }
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to wait for container process");
            WaitStatus::Unknown
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Per-run supervision state, torn down after `create` succeeds.
struct Session {
    pid: Option<libc::pid_t>,
    reaper: Option<Reaper>,
    relay: Option<RelayHandle>,
    /// Set when `state` has reported `stopped`.
    reported_stopped: bool,
    transitions: Vec<LifecycleState>,
}

impl Session {
    fn stopped(&self) -> bool {
        self.reported_stopped || self.reaper.as_ref().is_some_and(Reaper::is_stopped)
    }
}

/// Runs containers through an [`OciRuntime`].
#[derive(Clone)]
pub struct Orchestrator {
    runtime: Arc<dyn OciRuntime>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runtime", &self.runtime.name())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn OciRuntime>) -> Self {
        Self { runtime }
    }

    /// Runs on a dedicated OS thread with its own single-threaded runtime.
    ///
    /// Namespace-sensitive setup done by the caller on this thread (and any
    /// `prctl` state) stays with the thread that spawns the runtime.
    pub fn run_pinned(self, request: OrchestrateRequest, interrupts: mpsc::Receiver<Signal>) -> Result<RunOutcome> {
        let handle = std::thread::Builder::new()
            .name("container-run".to_string())
            .spawn(move || -> Result<RunOutcome> {
                let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
                rt.block_on(self.run(request, interrupts))
            })?;
        handle
            .join()
            .map_err(|_| Error::Internal("container run thread panicked".to_string()))?
    }

    /// Runs the container to completion.
    pub async fn run(&self, request: OrchestrateRequest, mut interrupts: mpsc::Receiver<Signal>) -> Result<RunOutcome> {
        let OrchestrateRequest {
            container_name: name,
            bundle,
            spec,
            stdio_owner,
            extra_create_args,
            caller,
            after_create,
        } = request;

        validate_container_id(&name)
            .map_err(|reason| Error::InvalidContainerId {
                id: name.clone(),
                reason: reason.to_string(),
            })
            .phase(Phase::Bundle)?;

        spec.write_atomic(&bundle).phase(Phase::Bundle)?;
        let mut transitions = vec![LifecycleState::Bundled];
        tracing::debug!(container = %name, bundle = %bundle.display(), "bundle written");

        let pid_file = bundle.join(PID_FILE);
        let (container_side, stdio, console_socket) =
            prepare_stdio(&bundle, &spec, stdio_owner).phase(Phase::Create)?;
        let opts = CreateOptions {
            pid_file: pid_file.clone(),
            console_socket,
            stdio,
            extra_args: extra_create_args,
        };
        if let Err(e) = self.runtime.create(&name, &bundle, opts).await {
            return Err(attach_output(e, &container_side).in_phase(Phase::Create));
        }
        transitions.push(LifecycleState::Created);
        tracing::info!(container = %name, runtime = self.runtime.name(), "container created");

        let mut session = Session {
            pid: None,
            reaper: None,
            relay: None,
            reported_stopped: false,
            transitions,
        };
        let result = self
            .supervise(&name, &mut session, &pid_file, caller, container_side, after_create, &mut interrupts)
            .await;
        let status = self.teardown(&name, &mut session).await;

        let status = match (result, status) {
            (Err(e), Err(reap)) => {
                tracing::warn!(container = %name, error = %reap, "container teardown also failed");
                return Err(e);
            }
            (Err(e), Ok(_)) => return Err(e),
            (Ok(()), Err(teardown)) => return Err(teardown),
            (Ok(()), Ok(status)) => status,
        };
        session.transitions.push(LifecycleState::Stopped);
        tracing::info!(container = %name, %status, "container stopped");
        Ok(RunOutcome {
            pid: session.pid.unwrap_or_default(),
            status,
            transitions: session.transitions,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        &self,
        name: &str,
        session: &mut Session,
        pid_file: &Path,
        caller: RelayEndpoints,
        container_side: ContainerSide,
        after_create: Option<AfterCreate>,
        interrupts: &mut mpsc::Receiver<Signal>,
    ) -> Result<()> {
        let pid = sys::read_pid_file(pid_file)
            .map_err(|e| Error::Protocol {
                id: name.to_string(),
                reason: format!("runtime did not leave a usable pid file: {e}"),
            })
            .phase(Phase::Create)?;
        session.pid = Some(pid);
        session.reaper = Some(Reaper::spawn(pid).phase(Phase::Supervision)?);
        session.relay = Some(
            StdioRelay::new(caller, container_side)
                .spawn()
                .phase(Phase::Supervision)?,
        );

        match after_create {
            Some(AfterCreate::Handshake(handshake)) => {
                let id = name.to_string();
                tokio::task::spawn_blocking(move || handshake.exchange(&id))
                    .await
                    .map_err(|e| Error::Internal(format!("handshake task failed: {e}")))
                    .and_then(|r| r)
                    .phase(Phase::Network)?;
            }
            Some(AfterCreate::Configure(configure)) => configure(pid).phase(Phase::Network)?,
            None => {}
        }

        self.runtime.start(name).await.phase(Phase::Start)?;
        session.transitions.push(LifecycleState::Started);
        tracing::debug!(container = %name, pid, "container started");

        let mut ticker = tokio::time::interval(STATE_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut relay_done = false;
        let mut interrupts_open = true;
        let mut running = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = relay_finished(session.relay.as_mut()), if !relay_done => {
                    tracing::debug!(container = %name, "stdio relay finished");
                    relay_done = true;
                }
                signal = interrupts.recv(), if interrupts_open => {
                    match signal {
                        Some(signal) => self.forward(name, signal).await,
                        None => interrupts_open = false,
                    }
                    continue;
                }
            }

            if session.reaper.as_ref().is_some_and(Reaper::is_stopped) {
                break;
            }
            match self.runtime.state(name).await {
                Ok(state) => match state.status {
                    ContainerStatus::Running => {
                        if !running {
                            running = true;
                            session.transitions.push(LifecycleState::Running);
                        }
                    }
                    ContainerStatus::Stopped => {
                        session.reported_stopped = true;
                        break;
                    }
                    other => {
                        return Err(Error::Protocol {
                            id: name.to_string(),
                            reason: format!("unexpected container status '{other}'"),
                        }
                        .in_phase(Phase::Supervision));
                    }
                },
                // The container may be gone by the time we ask.
                Err(e) if session.reaper.as_ref().is_some_and(Reaper::is_stopped) => {
                    tracing::debug!(container = %name, error = %e, "state failed after exit");
                    break;
                }
                Err(e) => return Err(e.in_phase(Phase::Supervision)),
            }
        }
        Ok(())
    }

    async fn forward(&self, name: &str, signal: Signal) {
        tracing::info!(container = %name, %signal, "forwarding signal");
        if let Err(e) = self.runtime.kill(name, signal).await {
            tracing::warn!(container = %name, %signal, error = %e, "failed to forward signal");
        }
    }

    /// Stop if needed, reap, delete, stop the relay.
    ///
    /// A still-running container gets SIGTERM, then SIGKILL once
    /// [`STOP_GRACE_PERIOD`] passes without an exit. A failed `delete` is
    /// returned as a [`Phase::Cleanup`] error; the caller reports it only
    /// when nothing failed earlier.
    async fn teardown(&self, name: &str, session: &mut Session) -> Result<WaitStatus> {
        let mut exited = None;
        if !session.stopped() {
            self.stop_signal(name, Signal::Term).await;
            if let Some(reaper) = session.reaper.as_mut() {
                if let Ok(status) = tokio::time::timeout(STOP_GRACE_PERIOD, &mut reaper.status).await {
                    exited = Some(status.unwrap_or(WaitStatus::Unknown));
                }
            }
            if exited.is_none() {
                tracing::info!(container = %name, "container ignored SIGTERM, killing");
                self.stop_signal(name, Signal::Kill).await;
            }
        }

        let status = match (exited, session.reaper.take()) {
            (Some(status), _) => Ok(status),
            (None, Some(reaper)) => match tokio::time::timeout(REAP_GRACE_PERIOD, reaper.status).await {
                Ok(Ok(status)) => Ok(status),
                Ok(Err(_)) => Ok(WaitStatus::Unknown),
                Err(_) => Err(Error::ReapTimeout {
                    pid: reaper.pid,
                    duration: REAP_GRACE_PERIOD,
                }
                .in_phase(Phase::Supervision)),
            },
            (None, None) => Ok(WaitStatus::Unknown),
        };

        let deleted = self.runtime.delete(name).await.map_err(|e| {
            tracing::warn!(container = %name, error = %e, "failed to delete container");
            e.in_phase(Phase::Cleanup)
        });

        if let Some(mut relay) = session.relay.take() {
            relay.stop();
            if let Err(e) = relay.join() {
                tracing::warn!(container = %name, error = %e, "stdio relay ended with an error");
            }
        }
        let status = status?;
        deleted?;
        Ok(status)
    }

    async fn stop_signal(&self, name: &str, signal: Signal) {
        if let Err(e) = self.runtime.kill(name, signal).await {
            tracing::warn!(container = %name, %signal, error = %e, "failed to signal container");
        }
    }
}

async fn relay_finished(relay: Option<&mut RelayHandle>) {
    match relay.and_then(RelayHandle::finished) {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending().await,
    }
}

/// Sets up the container's stdio: pipes, or a console socket for terminals.
fn prepare_stdio(
    bundle: &Path,
    spec: &OciSpec,
    owner: Option<(u32, u32)>,
) -> Result<(ContainerSide, CreateStdio, Option<PathBuf>)> {
    if spec.wants_terminal() {
        let socket = bundle.join(CONSOLE_SOCKET);
        let listener = UnixListener::bind(&socket)?;
        let size = spec.process.as_ref().and_then(|p| p.console_size);
        return Ok((ContainerSide::Console { listener, size }, CreateStdio::Inherit, Some(socket)));
    }

    let (stdin_r, stdin_w) = sys::pipe()?;
    let (stdout_r, stdout_w) = sys::pipe()?;
    let (stderr_r, stderr_w) = sys::pipe()?;
    if let Some((uid, gid)) = owner {
        for fd in [&stdin_r, &stdout_w, &stderr_w] {
            if let Err(e) = sys::fchown(fd.as_fd(), uid, gid) {
                tracing::debug!(uid, gid, error = %e, "could not chown stdio pipe");
            }
        }
    }
    Ok((
        ContainerSide::Pipes {
            stdin: stdin_w,
            stdout: stdout_r,
            stderr: stderr_r,
        },
        CreateStdio::Pipes {
            stdin: stdin_r,
            stdout: stdout_w,
            stderr: stderr_w,
        },
        None,
    ))
}

/// Adds whatever the runtime printed on the container pipes to a `create`
/// failure.
fn attach_output(err: Error, side: &ContainerSide) -> Error {
    let ContainerSide::Pipes { stdout, stderr, .. } = side else {
        return err;
    };
    let captured: Vec<String> = [relay::drain_available(stdout), relay::drain_available(stderr)]
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    match err {
        Error::RuntimeExit {
            command,
            id,
            status,
            output,
        } if output.is_empty() => Error::runtime_exit(command, id, status, &captured.join("\n")),
        other => other,
    }
}
