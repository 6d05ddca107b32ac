//! # Run Engine Constants
//!
//! Timeouts, default modes, well-known paths, and descriptor numbers shared
//! by the namespace planner, mount assembler, orchestrator, and relay. These
//! constants are the **single source of truth** for values that both sides
//! of a process boundary must agree on (for example the descriptor numbers
//! used by the re-executed runtime child).
//!
//! ## Cross-References
//!
//! - [`crate::mounts`]: secret, ssh, cache, and shm defaults
//! - [`crate::orchestrator`]: polling interval and reap grace period
//! - [`crate::relay`]: buffer sizing and flush interval
//! - [`crate::reexec`]: child descriptor layout and handshake timeout

use std::time::Duration;

// =============================================================================
// Supervision Timing
// =============================================================================

/// Interval between runtime `state` polls while a container runs.
///
/// **Rationale**: Matches the relay flush interval so a container exit is
/// noticed within one tick of its output draining.
pub const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the parent waits for the runtime child to report `created`.
///
/// **Rationale**: Runtime create includes pulling the rootfs into the mount
/// namespace and running prestart hooks. Four minutes covers slow storage
/// without leaving a hung child around forever.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(4 * 60);

/// How long teardown waits after SIGTERM before escalating to SIGKILL.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long teardown waits for the reaper after the final kill.
///
/// **Recovery**: When exceeded the run reports `ReapTimeout` and returns;
/// the reaper keeps waiting in the background.
pub const REAP_GRACE_PERIOD: Duration = Duration::from_secs(10);

// =============================================================================
// Stdio Relay
// =============================================================================

/// Size of a single read from a relayed descriptor.
pub const RELAY_READ_SIZE: usize = 8192;

/// Poll timeout used while any relay buffer holds undelivered data.
pub const RELAY_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Per-stream buffered byte ceiling.
///
/// **Security**: A consumer that never drains (a stopped terminal, a full
/// pipe) would otherwise let a chatty container grow the buffer without
/// bound. Once reached, the stream's reader is not polled until the writer
/// catches up.
pub const MAX_RELAY_BUFFER: usize = 1024 * 1024;

/// Control-message capacity, in descriptors, when receiving the console.
///
/// Room for more than one descriptor so that a misbehaving runtime sending
/// several is detected instead of silently truncated.
pub const CONSOLE_MAX_FDS: usize = 4;

// =============================================================================
// Bundle Layout
// =============================================================================

/// Runtime configuration file inside the bundle.
pub const CONFIG_FILE: &str = "config.json";

/// File the runtime writes the container init PID to.
pub const PID_FILE: &str = "pid";

/// Unix socket the runtime sends the pty master over.
pub const CONSOLE_SOCKET: &str = "console.sock";

/// OCI runtime spec version written to `config.json`.
pub const OCI_VERSION: &str = "1.0.2";

// =============================================================================
// Runtime Child Protocol
// =============================================================================
//
// The runtime child is this binary re-executed under a registered name. The
// parent hands it a JSON configuration and two handshake pipes on fixed
// descriptor numbers.
// =============================================================================

/// Descriptor carrying the JSON child configuration.
pub const CHILD_CONFIG_FD: i32 = 3;

/// Descriptor the child writes a single byte to once `create` succeeded.
pub const CHILD_CREATED_FD: i32 = 4;

/// Descriptor the child reads a single byte from before calling `start`.
pub const CHILD_START_FD: i32 = 5;

/// Lowest descriptor used when staging child descriptors before `dup2`.
pub const CHILD_FD_STAGING_MIN: i32 = 10;

/// Environment variable propagating the log level to the child.
pub const LOGLEVEL_ENV: &str = "LOGLEVEL";

/// Name the runtime child is registered under.
pub const RUNTIME_CHILD_COMMAND: &str = "magikbuild-runtime";

// =============================================================================
// Mount Defaults
// =============================================================================

/// Default mode for materialized secret files.
///
/// **Security**: Owner read-only. Secrets are never group or world readable
/// unless the mount asks for it.
pub const DEFAULT_SECRET_MODE: u32 = 0o400;

/// Default mode for cache mount directories.
pub const DEFAULT_CACHE_MODE: u32 = 0o755;

/// Default mode for ssh agent sockets.
pub const DEFAULT_SSH_MODE: u32 = 0o600;

/// Directory secrets are mounted under when no target is given.
pub const SECRETS_MOUNT_DIR: &str = "/run/secrets";

/// Directory ssh agent sockets are mounted under when no target is given.
pub const SSH_AGENT_MOUNT_DIR: &str = "/run/buildkit";

/// Default ssh source ID.
pub const DEFAULT_SSH_ID: &str = "default";

/// Largest ssh-agent request a key-loading agent accepts.
pub const MAX_AGENT_MESSAGE: usize = 256 * 1024;

/// Default size of `/dev/shm`.
pub const DEFAULT_SHM_SIZE: &str = "65536k";

/// Hex characters of the target digest used to name a cache directory.
pub const CACHE_DIR_ID_LEN: usize = 16;

/// Subdirectory of the cache parent holding per-cache lockfiles.
pub const CACHE_LOCKFILE_DIR: &str = "cache-lockfiles";

/// Lockfile name inside a cache's lock directory.
pub const CACHE_LOCKFILE: &str = "cache.lock";

/// mounts.conf-style subscription file consulted when none is configured.
pub const DEFAULT_MOUNTS_FILE: &str = "/usr/share/containers/mounts.conf";

// =============================================================================
// Namespace Defaults
// =============================================================================

/// Length of the container ID prefix used as default hostname.
pub const DEFAULT_HOSTNAME_LEN: usize = 12;

/// User-mode network helpers that let a rootless run keep its own netns.
pub const USER_NETWORK_HELPERS: &[&str] = &["slirp4netns", "pasta"];

/// Runtimes probed on `PATH`, in order, when none is configured.
pub const DEFAULT_RUNTIMES: &[&str] = &["crun", "runc"];

/// Sysctl letting unprivileged processes in a private netns use ICMP sockets.
pub const PING_GROUP_RANGE_SYSCTL: &str = "net.ipv4.ping_group_range";

/// Value for [`PING_GROUP_RANGE_SYSCTL`].
pub const PING_GROUP_RANGE_VALUE: &str = "0 0";

/// Nameservers used when the host has none usable inside the container.
pub const FALLBACK_NAMESERVERS: &[&str] = &["8.8.8.8", "8.8.4.4"];

// =============================================================================
// Environment Overrides
// =============================================================================

/// Overrides the runtime binary.
pub const ENV_RUNTIME: &str = "MAGIKBUILD_RUNTIME";

/// Overrides the directory for bundles and temporary files.
pub const ENV_TMPDIR: &str = "MAGIKBUILD_TMPDIR";

/// Overrides the cache mount parent directory.
pub const ENV_CACHE_DIR: &str = "MAGIKBUILD_CACHE_DIR";

/// Overrides the subscription mounts file.
pub const ENV_MOUNTS_FILE: &str = "MAGIKBUILD_MOUNTS_CONF";

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for container names/IDs.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`, `.`
///
/// **Security**: Excludes `/` so a container name can be used as a path
/// component. A leading `.` is rejected separately.
pub const CONTAINER_NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum container ID length.
///
/// **Rationale**: Runtimes use the ID in state directory paths and socket
/// names; 128 characters leaves room within `sun_path` limits for the
/// longest runtime state roots in common use.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Validates a container ID for safety.
///
/// # Security
///
/// This function ensures container IDs:
/// - Are non-empty and don't start with `.`
/// - Don't exceed `MAX_CONTAINER_ID_LEN`
/// - Only contain characters from `CONTAINER_NAME_VALID_CHARS`
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.starts_with('.') {
        return Err("container ID cannot start with '.'");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !id.chars().all(|c| CONTAINER_NAME_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}
