//! External collaborators the run engine delegates to.
//!
//! Each concern the engine does not own (image mounting, SELinux labeling,
//! network plugins, ssh agent forwarding) sits behind a trait so a build
//! tool can plug in its own implementation. The defaults here are the
//! minimal ones a standalone run needs.

use crate::error::{Error, Result};
use crate::sshagent::KeyRing;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

// =============================================================================
// SSH Agent Forwarding
// =============================================================================

/// A configured ssh source: key files or an existing agent socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSource {
    pub id: String,
    pub paths: Vec<PathBuf>,
}

/// A running forwarding agent.
pub trait AgentHandle: Send + fmt::Debug {
    /// Socket the container should connect to.
    fn socket_path(&self) -> &Path;

    /// Stops the agent. Must be safe to call more than once.
    fn shutdown(&mut self) -> Result<()>;
}

/// Starts forwarding agents for ssh mounts.
pub trait SshAgentForwarder: Send + Sync {
    fn serve(&self, source: &SshSource, process_label: Option<&str>) -> Result<Box<dyn AgentHandle>>;
}

/// Serves an ssh source on a private socket.
///
/// An agent socket is forwarded as is. Key files are loaded into an
/// in-process agent that lists and signs with them.
#[derive(Debug, Default)]
pub struct SocketForwarder {
    runtime_dir: Option<PathBuf>,
}

impl SocketForwarder {
    /// Creates a forwarder placing sockets under `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: Some(dir.into()),
        }
    }
}

impl SshAgentForwarder for SocketForwarder {
    fn serve(&self, source: &SshSource, _process_label: Option<&str>) -> Result<Box<dyn AgentHandle>> {
        let upstream = match source.paths.as_slice() {
            [] => Upstream::Socket(std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from).ok_or_else(|| {
                Error::Config(format!("ssh source '{}' has no paths and SSH_AUTH_SOCK is unset", source.id))
            })?),
            [single] if is_socket(single) => Upstream::Socket(single.clone()),
            paths if paths.iter().any(|p| is_socket(p)) => {
                return Err(Error::Config(format!(
                    "ssh source '{}': an agent socket cannot be combined with other paths",
                    source.id
                )));
            }
            paths => Upstream::Keys(Arc::new(KeyRing::load(&source.id, paths)?)),
        };

        let base = self
            .runtime_dir
            .clone()
            .or_else(dirs::runtime_dir)
            .unwrap_or_else(std::env::temp_dir);
        let dir = tempfile::Builder::new().prefix("ssh-agent-").tempdir_in(base)?;
        let socket = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&socket)?;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;

        let stopping = Arc::new(AtomicBool::new(false));
        let accept_stop = Arc::clone(&stopping);
        let accept_listener = listener.try_clone()?;
        let thread = std::thread::Builder::new()
            .name("ssh-agent-forward".to_string())
            .spawn(move || forward_loop(accept_listener, upstream, accept_stop))?;

        tracing::debug!(id = %source.id, socket = %socket.display(), "started ssh agent");
        Ok(Box::new(ForwardingAgent {
            socket,
            dir: Some(dir),
            listener: Some(listener),
            stopping,
            thread: Some(thread),
        }))
    }
}

fn is_socket(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_socket())
}

#[derive(Debug, Clone)]
enum Upstream {
    Socket(PathBuf),
    Keys(Arc<KeyRing>),
}

fn forward_loop(listener: UnixListener, upstream: Upstream, stopping: Arc<AtomicBool>) {
    for conn in listener.incoming() {
        if stopping.load(Ordering::Acquire) {
            break;
        }
        let client = match conn {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "ssh forwarder accept failed");
                break;
            }
        };
        match &upstream {
            Upstream::Socket(path) => {
                let agent = match UnixStream::connect(path) {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(upstream = %path.display(), error = %e, "cannot reach ssh agent");
                        continue;
                    }
                };
                std::thread::spawn(move || splice(client, agent));
            }
            Upstream::Keys(ring) => {
                let ring = Arc::clone(ring);
                std::thread::spawn(move || {
                    if let Err(e) = ring.serve(client) {
                        tracing::debug!(error = %e, "ssh agent connection closed");
                    }
                });
            }
        }
    }
}

fn splice(client: UnixStream, agent: UnixStream) {
    let (Ok(mut client_rx), Ok(mut agent_rx)) = (client.try_clone(), agent.try_clone()) else {
        return;
    };
    let (mut client_tx, mut agent_tx) = (client, agent);
    let upstream = std::thread::spawn(move || {
        let _ = std::io::copy(&mut client_rx, &mut agent_tx);
        let _ = agent_tx.shutdown(std::net::Shutdown::Write);
    });
    let _ = std::io::copy(&mut agent_rx, &mut client_tx);
    let _ = client_tx.shutdown(std::net::Shutdown::Write);
    let _ = upstream.join();
}

#[derive(Debug)]
struct ForwardingAgent {
    socket: PathBuf,
    dir: Option<tempfile::TempDir>,
    listener: Option<UnixListener>,
    stopping: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AgentHandle for ForwardingAgent {
    fn socket_path(&self) -> &Path {
        &self.socket
    }

    fn shutdown(&mut self) -> Result<()> {
        self.stopping.store(true, Ordering::Release);
        if let Some(listener) = self.listener.take() {
            use std::os::fd::AsRawFd;
            // SAFETY: the descriptor is owned by `listener`, alive for this call.
            // shutdown(2) wakes the accept loop blocked on the cloned descriptor.
            unsafe { libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR) };
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Some(dir) = self.dir.take() {
            dir.close()?;
        }
        Ok(())
    }
}

impl Drop for ForwardingAgent {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// =============================================================================
// Image Mounting
// =============================================================================

/// Result of asking an image mounter to unmount an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountOutcome {
    Unmounted,
    /// The image was unknown or not mounted; not an error during cleanup.
    NotMounted,
}

/// Mounts images referenced by `from=` in run mounts.
pub trait ImageMounter: Send + Sync {
    fn mount(&self, image: &str) -> Result<PathBuf>;
    fn unmount(&self, image: &str) -> Result<UnmountOutcome>;
}

/// Mounter for engines without image storage; every mount fails.
#[derive(Debug, Default)]
pub struct NoImageMounter;

impl ImageMounter for NoImageMounter {
    fn mount(&self, image: &str) -> Result<PathBuf> {
        Err(Error::Config(format!("cannot mount image '{image}': no image store configured")))
    }

    fn unmount(&self, _image: &str) -> Result<UnmountOutcome> {
        Ok(UnmountOutcome::NotMounted)
    }
}

// =============================================================================
// Labeling
// =============================================================================

/// Applies security labels to files shared with the container.
pub trait Labeler: Send + Sync {
    /// Returns true if labeling is active on this host.
    fn enabled(&self) -> bool;

    /// Relabels `path` with `label`; `shared` relabels for use by any container.
    fn relabel(&self, path: &Path, label: &str, shared: bool) -> Result<()>;
}

/// Labeler writing the `security.selinux` extended attribute directly.
#[derive(Debug, Default)]
pub struct SelinuxLabeler;

/// Category-free label used for content shared between containers.
const SHARED_LEVEL: &str = "s0";

impl Labeler for SelinuxLabeler {
    fn enabled(&self) -> bool {
        Path::new("/sys/fs/selinux/enforce").exists()
    }

    fn relabel(&self, path: &Path, label: &str, shared: bool) -> Result<()> {
        if label.is_empty() || !self.enabled() {
            return Ok(());
        }
        let label = if shared {
            // user:role:type:level -> drop the MCS categories from the level
            let mut parts: Vec<&str> = label.splitn(4, ':').collect();
            if parts.len() == 4 {
                parts[3] = SHARED_LEVEL;
            }
            parts.join(":")
        } else {
            label.to_string()
        };
        for entry in walkdir::WalkDir::new(path) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            set_selinux_xattr(entry.path(), &label)?;
        }
        Ok(())
    }
}

fn set_selinux_xattr(path: &Path, label: &str) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| Error::Internal(e.to_string()))?;
    let name = c"security.selinux";
    // SAFETY: both strings are NUL-terminated and outlive the call; the value
    // pointer and length describe `label`'s bytes.
    let rc = unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            name.as_ptr(),
            label.as_ptr().cast(),
            label.len(),
            0,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOTSUP) {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

/// Labeler that does nothing.
#[derive(Debug, Default)]
pub struct NoopLabeler;

impl Labeler for NoopLabeler {
    fn enabled(&self) -> bool {
        false
    }

    fn relabel(&self, _path: &Path, _label: &str, _shared: bool) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Networking
// =============================================================================

/// A hosts-file entry produced by network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub ip: String,
    pub names: Vec<String>,
}

/// Outcome of configuring a container's network namespace.
#[derive(Default)]
pub struct NetworkSetup {
    pub host_entries: Vec<HostEntry>,
    /// Invoked after the container exits.
    pub teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for NetworkSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkSetup")
            .field("host_entries", &self.host_entries)
            .field("teardown", &self.teardown.is_some())
            .finish()
    }
}

/// Configures a created container's network namespace before it starts.
pub trait NetworkConfigurator: Send + Sync {
    fn configure(&self, pid: i32, container: &str, networks: &[String]) -> Result<NetworkSetup>;
}

/// Configurator leaving the namespace with loopback only.
#[derive(Debug, Default)]
pub struct LoopbackNetwork;

impl NetworkConfigurator for LoopbackNetwork {
    fn configure(&self, pid: i32, container: &str, networks: &[String]) -> Result<NetworkSetup> {
        if !networks.is_empty() {
            tracing::warn!(container, ?networks, "no network plugin configured, networks ignored");
        }
        tracing::debug!(container, pid, "network namespace left with loopback only");
        Ok(NetworkSetup::default())
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// The collaborator set used by a run.
#[derive(Clone)]
pub struct Collaborators {
    pub ssh: Arc<dyn SshAgentForwarder>,
    pub images: Arc<dyn ImageMounter>,
    pub labeler: Arc<dyn Labeler>,
    pub network: Arc<dyn NetworkConfigurator>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            ssh: Arc::new(SocketForwarder::default()),
            images: Arc::new(NoImageMounter),
            labeler: Arc::new(SelinuxLabeler),
            network: Arc::new(LoopbackNetwork),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
