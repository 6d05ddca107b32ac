//! OCI runtime configuration types.
//!
//! A deliberately partial model of the OCI runtime spec: the fields the run
//! engine reads or writes are typed, everything else a caller or hook puts
//! into the document survives a round trip through the `extra` maps.

use crate::constants::OCI_VERSION;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI Runtime Spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub root: OciRoot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<OciProcess>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default)]
    pub mounts: Vec<OciMount>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// OCI root filesystem config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// OCI process config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciProcess {
    #[serde(default)]
    pub terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console_size: Option<OciBox>,
    pub user: OciUser,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selinux_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apparmor_profile: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciBox {
    pub height: u16,
    pub width: u16,
}

/// OCI user config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

/// OCI mount config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type", default)]
    pub mount_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// A mount as it appears in the final mount list.
pub type MountEntry = OciMount;

impl OciMount {
    /// Creates a mount entry.
    pub fn new(
        destination: impl Into<String>,
        mount_type: impl Into<String>,
        source: impl Into<String>,
        options: &[&str],
    ) -> Self {
        Self {
            destination: destination.into(),
            mount_type: mount_type.into(),
            source: source.into(),
            options: options.iter().map(|o| (*o).to_string()).collect(),
        }
    }

    /// Creates a bind mount entry.
    pub fn bind(source: impl Into<String>, destination: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            destination: destination.into(),
            mount_type: "bind".to_string(),
            source: source.into(),
            options,
        }
    }

    /// Returns true if `option` is present.
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }
}

/// OCI Linux-specific config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLinux {
    #[serde(default)]
    pub namespaces: Vec<OciNamespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<OciIdMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<OciIdMapping>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sysctl: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_label: Option<String>,
    /// Opaque seccomp profile, passed through unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// OCI namespace config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// OCI user/group ID mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciIdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

// =============================================================================
// Construction
// =============================================================================

impl OciSpec {
    /// Creates a spec running `args` on `rootfs` with the default mount set.
    pub fn new(rootfs: &Path, args: Vec<String>) -> Self {
        Self {
            oci_version: OCI_VERSION.to_string(),
            root: OciRoot {
                path: rootfs.to_string_lossy().into_owned(),
                readonly: false,
            },
            process: Some(OciProcess {
                terminal: false,
                console_size: None,
                user: OciUser::default(),
                args,
                env: vec!["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string()],
                cwd: "/".to_string(),
                selinux_label: None,
                apparmor_profile: None,
                extra: BTreeMap::new(),
            }),
            hostname: String::new(),
            mounts: default_mounts(),
            annotations: BTreeMap::new(),
            linux: Some(OciLinux::default()),
            extra: BTreeMap::new(),
        }
    }

    /// Returns the Linux section, creating an empty one if absent.
    pub fn linux_mut(&mut self) -> &mut OciLinux {
        self.linux.get_or_insert_with(OciLinux::default)
    }

    /// Returns true if the process asks for a terminal.
    pub fn wants_terminal(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.terminal)
    }

    /// Sets or replaces `KEY=value` in the process environment.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        let prefix = format!("{key}=");
        process.env.retain(|e| !e.starts_with(&prefix));
        process.env.push(format!("{key}={value}"));
    }

    /// Writes the spec as `config.json` into `bundle`, atomically.
    ///
    /// The document is written to a temporary file in the bundle and renamed
    /// over the target so the runtime never observes a partial file.
    pub fn write_atomic(&self, bundle: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".config")
            .suffix(".json")
            .tempfile_in(bundle)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(bundle.join(crate::constants::CONFIG_FILE))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Reads `config.json` from `bundle`.
    pub fn load(bundle: &Path) -> Result<Self> {
        let data = std::fs::read(bundle.join(crate::constants::CONFIG_FILE))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Default mount set for a build container.
///
/// [`crate::mounts::special`] rewrites `/dev/shm`, `/dev/mqueue`, and `/sys`
/// according to the namespace plan.
pub fn default_mounts() -> Vec<OciMount> {
    vec![
        OciMount::new("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"]),
        OciMount::new("/dev", "tmpfs", "tmpfs", &["nosuid", "strictatime", "mode=755", "size=65536k"]),
        OciMount::new(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        OciMount::new("/dev/shm", "tmpfs", "shm", &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]),
        OciMount::new("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        OciMount::new("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
    ]
}
