//! OCI runtime trait - the runtime CLI protocol as seen by the orchestrator.
//!
//! The orchestrator drives one container through:
//! - `create`: create the container from a bundle, stdio attached
//! - `start`: release the container process
//! - `state`: poll status while it runs
//! - `kill`: forward signals and stop it on teardown
//! - `delete`: remove it, always, once created
//!
//! # OCI Runtime Spec Reference
//!
//! See: https://github.com/opencontainers/runtime-spec/blob/main/runtime.md

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

// =============================================================================
// Container State (OCI Runtime Spec)
// =============================================================================

/// OCI Runtime Spec container status.
///
/// Ref: https://github.com/opencontainers/runtime-spec/blob/main/runtime.md#state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is being created.
    Creating,
    /// Container has been created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container has stopped.
    Stopped,
    /// Container is frozen.
    Paused,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// OCI Runtime Spec container state.
///
/// Ref: https://github.com/opencontainers/runtime-spec/blob/main/runtime.md#state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// OCI version of the state schema.
    #[serde(default)]
    pub oci_version: String,
    /// Container ID.
    pub id: String,
    /// Container status.
    pub status: ContainerStatus,
    /// Process ID of the container (if running).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Absolute path to the bundle directory.
    #[serde(default)]
    pub bundle: String,
    /// Annotations from the container config.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl ContainerState {
    /// Creates a new container state.
    pub fn new(id: impl Into<String>, bundle: impl Into<String>, status: ContainerStatus) -> Self {
        Self {
            oci_version: crate::constants::OCI_VERSION.to_string(),
            id: id.into(),
            status,
            pid: None,
            bundle: bundle.into(),
            annotations: HashMap::new(),
        }
    }

    /// Returns true if the container is running.
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Signal to send to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGHUP (hangup).
    Hup,
    /// SIGINT (interrupt).
    Int,
    /// SIGQUIT.
    Quit,
    /// SIGUSR1.
    Usr1,
    /// SIGUSR2.
    Usr2,
}

impl Signal {
    /// Signals forwarded from the engine to the container.
    pub const FORWARDED: [Signal; 3] = [Signal::Hup, Signal::Int, Signal::Term];

    /// Returns the signal number.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Quit => libc::SIGQUIT,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
        }
    }

    /// Maps a signal number back to a [`Signal`].
    pub fn from_raw(signo: i32) -> Option<Self> {
        [
            Self::Term,
            Self::Kill,
            Self::Hup,
            Self::Int,
            Self::Quit,
            Self::Usr1,
            Self::Usr2,
        ]
        .into_iter()
        .find(|s| s.as_i32() == signo)
    }

    /// Parses from signal name (e.g., "SIGTERM", "TERM", "15").
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.to_uppercase();
        let s = s.strip_prefix("SIG").unwrap_or(&s);
        match s {
            "TERM" => Some(Self::Term),
            "KILL" => Some(Self::Kill),
            "HUP" => Some(Self::Hup),
            "INT" => Some(Self::Int),
            "QUIT" => Some(Self::Quit),
            "USR1" => Some(Self::Usr1),
            "USR2" => Some(Self::Usr2),
            n => n.parse().ok().and_then(Self::from_raw),
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
            Self::Hup => write!(f, "SIGHUP"),
            Self::Int => write!(f, "SIGINT"),
            Self::Quit => write!(f, "SIGQUIT"),
            Self::Usr1 => write!(f, "SIGUSR1"),
            Self::Usr2 => write!(f, "SIGUSR2"),
        }
    }
}

// =============================================================================
// Create Options
// =============================================================================

/// How the container's stdio is provided at create time.
#[derive(Debug, Default)]
pub enum CreateStdio {
    /// The runtime inherits the engine's stdio (console socket mode).
    #[default]
    Inherit,
    /// Container ends of the relay pipes. Consumed by `create`, so the
    /// engine's copies are closed once it returns.
    Pipes {
        stdin: OwnedFd,
        stdout: OwnedFd,
        stderr: OwnedFd,
    },
}

/// Options for [`OciRuntime::create`].
#[derive(Debug, Default)]
pub struct CreateOptions {
    /// File the runtime writes the container init PID to.
    pub pid_file: PathBuf,
    /// Socket to receive the pty master on, for terminal runs.
    pub console_socket: Option<PathBuf>,
    pub stdio: CreateStdio,
    /// Extra arguments placed before the container ID.
    pub extra_args: Vec<String>,
}

// =============================================================================
// OCI Runtime Trait
// =============================================================================

/// OCI Runtime Spec compliant container runtime interface.
///
/// # Lifecycle
///
/// ```text
/// create(id, bundle) → start(id) → state(id)* → [kill(id, signal)] → delete(id)
/// ```
///
/// # Implementations
///
/// - `CliRuntime`: an OCI runtime binary such as crun or runc
#[async_trait]
pub trait OciRuntime: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    /// Creates a container from an OCI bundle.
    ///
    /// On success the PID of the container init is in `opts.pid_file` and
    /// the container is blocked waiting for `start`.
    async fn create(&self, id: &str, bundle: &Path, opts: CreateOptions) -> Result<()>;

    /// Starts a created container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Gets the state of a container.
    async fn state(&self, id: &str) -> Result<ContainerState>;

    /// Sends a signal to a container.
    async fn kill(&self, id: &str, signal: Signal) -> Result<()>;

    /// Deletes a container.
    async fn delete(&self, id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parsing() {
        assert_eq!(Signal::from_str("SIGTERM"), Some(Signal::Term));
        assert_eq!(Signal::from_str("TERM"), Some(Signal::Term));
        assert_eq!(Signal::from_str("15"), Some(Signal::Term));
        assert_eq!(Signal::from_str("sigkill"), Some(Signal::Kill));
        assert_eq!(Signal::from_str("9"), Some(Signal::Kill));
        assert_eq!(Signal::from_str("INVALID"), None);
    }

    #[test]
    fn test_signal_raw_round_trip() {
        for signal in Signal::FORWARDED {
            assert_eq!(Signal::from_raw(signal.as_i32()), Some(signal));
        }
        assert_eq!(Signal::from_raw(0), None);
    }

    #[test]
    fn test_state_accepts_runtime_extras() {
        let json = r#"{"ociVersion":"1.0.2","id":"c1","pid":42,"status":"running",
            "bundle":"/b","rootfs":"/b/rootfs","created":"2024-01-01T00:00:00Z","owner":""}"#;
        let state: ContainerState = serde_json::from_str(json).unwrap();
        assert!(state.is_running());
        assert_eq!(state.pid, Some(42));
    }
}
