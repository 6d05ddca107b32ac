//! Engine configuration.
//!
//! [`EngineConfig`] holds the host-level settings shared by every run:
//! which OCI runtime to drive, where per-run state goes, and the default
//! namespace and network policy. Values come from [`EngineConfig::default`],
//! the environment ([`EngineConfig::from_env`]) or a serialized document,
//! then are adjusted with the `with_*` builders.

use crate::constants::{DEFAULT_MOUNTS_FILE, DEFAULT_SHM_SIZE, ENV_CACHE_DIR, ENV_MOUNTS_FILE, ENV_RUNTIME, ENV_TMPDIR};
use crate::mounts::cache::default_cache_parent;
use crate::namespace::{Isolation, NamespaceOptions, NetworkPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Host-level settings for the run engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Runtime binary path or name; `None` probes crun, then runc.
    pub runtime: Option<PathBuf>,
    /// Arguments placed before every runtime subcommand.
    pub runtime_args: Vec<String>,
    pub isolation: Isolation,
    /// True when running without root privileges.
    pub rootless: bool,
    /// Parent of per-run bundles and secret files.
    pub tmp_dir: PathBuf,
    /// Parent of cache mount directories and lockfiles.
    pub cache_parent: PathBuf,
    /// `mounts.conf`-style subscriptions file.
    pub mounts_file: Option<PathBuf>,
    /// Lowest-precedence namespace layer.
    pub default_namespaces: NamespaceOptions,
    pub network_policy: NetworkPolicy,
    pub shm_size: String,
    /// Host resolver config the generated `/etc/resolv.conf` starts from.
    pub host_resolv_conf: PathBuf,
    /// Run the runtime from a re-executed child when the network needs a
    /// create/start handshake.
    pub isolated_child: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // SAFETY: geteuid has no preconditions.
        let rootless = unsafe { libc::geteuid() } != 0;
        Self {
            runtime: None,
            runtime_args: Vec::new(),
            isolation: if rootless { Isolation::OciRootless } else { Isolation::Oci },
            rootless,
            tmp_dir: default_tmp_dir(),
            cache_parent: default_cache_parent(),
            mounts_file: Some(PathBuf::from(DEFAULT_MOUNTS_FILE)),
            default_namespaces: NamespaceOptions::defaults(),
            network_policy: NetworkPolicy::Default,
            shm_size: DEFAULT_SHM_SIZE.to_string(),
            host_resolv_conf: PathBuf::from("/etc/resolv.conf"),
            isolated_child: true,
        }
    }
}

fn default_tmp_dir() -> PathBuf {
    dirs::runtime_dir()
        .map(|d| d.join("magikbuild"))
        .unwrap_or_else(|| std::env::temp_dir().join("magikbuild"))
}

impl EngineConfig {
    /// Defaults overridden by `MAGIKBUILD_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(runtime) = std::env::var_os(ENV_RUNTIME).filter(|v| !v.is_empty()) {
            config.runtime = Some(PathBuf::from(runtime));
        }
        if let Some(tmp) = std::env::var_os(ENV_TMPDIR).filter(|v| !v.is_empty()) {
            config.tmp_dir = PathBuf::from(tmp);
        }
        if let Some(cache) = std::env::var_os(ENV_CACHE_DIR).filter(|v| !v.is_empty()) {
            config.cache_parent = PathBuf::from(cache);
        }
        if let Some(mounts) = std::env::var_os(ENV_MOUNTS_FILE) {
            config.mounts_file = (!mounts.is_empty()).then(|| PathBuf::from(mounts));
        }
        config
    }

    pub fn with_runtime(mut self, runtime: impl Into<PathBuf>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    pub fn with_runtime_args(mut self, args: Vec<String>) -> Self {
        self.runtime_args = args;
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = dir.into();
        self
    }

    pub fn with_cache_parent(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_parent = dir.into();
        self
    }

    /// Sets the subscriptions file; `None` disables subscription mounts.
    pub fn with_mounts_file(mut self, file: Option<PathBuf>) -> Self {
        self.mounts_file = file;
        self
    }

    pub fn with_network_policy(mut self, policy: NetworkPolicy) -> Self {
        self.network_policy = policy;
        self
    }

    pub fn with_default_namespaces(mut self, namespaces: NamespaceOptions) -> Self {
        self.default_namespaces = namespaces;
        self
    }

    pub fn with_isolated_child(mut self, isolated: bool) -> Self {
        self.isolated_child = isolated;
        self
    }
}
