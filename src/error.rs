//! Error types for the run engine.
//!
//! Every fallible operation returns [`Result`]. Errors raised inside a run are
//! tagged with the [`Phase`] they occurred in so callers can tell a mount
//! assembly failure from a runtime `create` failure without string matching.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for run engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle phase an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Namespace planning and isolation checks.
    Namespace,
    /// Mount assembly (volumes, run mounts, special mounts).
    MountAssembly,
    /// Bundle and config.json preparation.
    Bundle,
    /// Runtime `create`.
    Create,
    /// Runtime `start`.
    Start,
    /// State polling and signal forwarding.
    Supervision,
    /// Network configuration between the create/start handshake.
    Network,
    /// Artifact teardown after the run.
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Namespace => "namespace setup",
            Self::MountAssembly => "mount assembly",
            Self::Bundle => "bundle preparation",
            Self::Create => "container create",
            Self::Start => "container start",
            Self::Supervision => "container supervision",
            Self::Network => "network configuration",
            Self::Cleanup => "run cleanup",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while running a command in a build container.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid namespace, isolation, or engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid container ID format.
    #[error("invalid container ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    // =========================================================================
    // Mount Errors
    // =========================================================================
    /// Malformed volume spec or run-mount token list.
    #[error("invalid mount '{spec}': {reason}")]
    InvalidMount { spec: String, reason: String },

    /// A `required` secret mount references an unknown secret.
    #[error("secret required but no secret with id '{0}' found")]
    SecretRequired(String),

    /// A `required` ssh mount references an unknown ssh source.
    #[error("ssh required but no ssh source with id '{0}' found")]
    SshRequired(String),

    /// A mount source could not be prepared.
    #[error("failed to prepare mount for '{destination}': {reason}")]
    MountAssembly { destination: String, reason: String },

    // =========================================================================
    // Runtime Lifecycle Errors
    // =========================================================================
    /// The runtime binary could not be executed.
    #[error("failed to spawn runtime '{runtime}': {source}")]
    Spawn {
        runtime: String,
        #[source]
        source: std::io::Error,
    },

    /// A runtime subcommand exited unsuccessfully.
    #[error("runtime {command} for container '{id}' failed ({status}){output}")]
    RuntimeExit {
        command: String,
        id: String,
        status: String,
        /// Captured stdout/stderr, prefixed with ": " when present.
        output: String,
    },

    /// The runtime reported something outside the expected protocol.
    #[error("unexpected runtime response for container '{id}': {reason}")]
    Protocol { id: String, reason: String },

    /// The container process was not confirmed reaped after teardown.
    #[error("container process {pid} not reaped within {duration:?}")]
    ReapTimeout { pid: i32, duration: Duration },

    /// An OCI hook failed or timed out.
    #[error("hook '{}' failed: {reason}", path.display())]
    Hook { path: PathBuf, reason: String },

    /// Error annotated with the lifecycle phase it occurred in.
    #[error("{phase}: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Tags the error with a lifecycle phase.
    ///
    /// An error that already carries a phase keeps the innermost one.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Self::Phase { .. } => self,
            other => Self::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// Returns the phase this error was raised in, if tagged.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Returns the underlying error with any phase tag removed.
    pub fn root(&self) -> &Error {
        match self {
            Self::Phase { source, .. } => source.root(),
            other => other,
        }
    }

    /// Builds an [`Error::RuntimeExit`], formatting captured output.
    pub fn runtime_exit(
        command: impl Into<String>,
        id: impl Into<String>,
        status: impl fmt::Display,
        output: &str,
    ) -> Self {
        let output = output.trim();
        Self::RuntimeExit {
            command: command.into(),
            id: id.into(),
            status: status.to_string(),
            output: if output.is_empty() {
                String::new()
            } else {
                format!(": {output}")
            },
        }
    }
}

/// Extension for tagging results with a lifecycle phase.
pub trait ResultExt<T> {
    /// Tags an error result with `phase`.
    fn phase(self, phase: Phase) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn phase(self, phase: Phase) -> Result<T> {
        self.map_err(|e| e.in_phase(phase))
    }
}
