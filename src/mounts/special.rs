//! Kernel filesystem mounts, generated bind files, and subscription mounts.

use crate::error::Result;
use crate::namespace::{EffectiveNamespaces, NamespaceKind};
use crate::spec::MountEntry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Rewrites the base kernel filesystem mounts for the namespace plan.
///
/// * `/dev/shm` gets the requested size; with the host IPC namespace and a
///   container user namespace it becomes a bind of the host's `/dev/shm`.
/// * `/dev/mqueue` is handled the same way.
/// * `/sys` becomes a read-only recursive bind when the host network
///   namespace is shared from a user namespace, since sysfs cannot be mounted
///   there; otherwise a read-only cgroup filesystem is added under it.
pub fn special_mounts(
    base: &[MountEntry],
    namespaces: &EffectiveNamespaces,
    user_namespace: bool,
    shm_size: &str,
) -> Vec<MountEntry> {
    let host_ipc = namespaces.is_host(NamespaceKind::Ipc);
    let host_net = namespaces.is_host(NamespaceKind::Network);
    let mut mounts = Vec::with_capacity(base.len() + 1);
    let mut sys_bound = false;

    for mount in base {
        match mount.destination.as_str() {
            "/dev/shm" if host_ipc && user_namespace && Path::new("/dev/shm").exists() => {
                mounts.push(MountEntry::new(
                    "/dev/shm",
                    "bind",
                    "/dev/shm",
                    &["bind", "nosuid", "noexec", "nodev"],
                ));
            }
            "/dev/shm" => {
                let mut options = vec![
                    "nosuid".to_string(),
                    "noexec".to_string(),
                    "nodev".to_string(),
                    "mode=1777".to_string(),
                ];
                options.push(format!("size={shm_size}"));
                mounts.push(MountEntry {
                    destination: "/dev/shm".to_string(),
                    mount_type: "tmpfs".to_string(),
                    source: "shm".to_string(),
                    options,
                });
            }
            "/dev/mqueue" if host_ipc && user_namespace && Path::new("/dev/mqueue").exists() => {
                mounts.push(MountEntry::new(
                    "/dev/mqueue",
                    "bind",
                    "/dev/mqueue",
                    &["bind", "nosuid", "noexec", "nodev"],
                ));
            }
            "/sys" if host_net && user_namespace => {
                sys_bound = true;
                mounts.push(MountEntry::new(
                    "/sys",
                    "bind",
                    "/sys",
                    &["rbind", "nosuid", "noexec", "nodev", "ro"],
                ));
            }
            _ => mounts.push(mount.clone()),
        }
    }

    if !sys_bound {
        mounts.push(MountEntry::new(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        ));
    }
    mounts
}

/// Bind mounts for generated files such as `/etc/hosts`.
pub fn bind_file_mounts(files: &BTreeMap<String, PathBuf>) -> Vec<MountEntry> {
    files
        .iter()
        .map(|(destination, source)| {
            MountEntry::bind(
                source.to_string_lossy(),
                destination.clone(),
                vec!["rbind".to_string(), "rprivate".to_string()],
            )
        })
        .collect()
}

/// Read-only binds for each `host:container` line of a subscription file.
///
/// A missing file yields no mounts; entries whose host path is absent are
/// skipped.
pub fn subscription_mounts(file: &Path) -> Result<Vec<MountEntry>> {
    let content = match std::fs::read_to_string(file) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut mounts = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((host, container)) = line.split_once(':') else {
            tracing::warn!(file = %file.display(), line, "ignoring malformed subscription entry");
            continue;
        };
        if !Path::new(host).exists() {
            tracing::debug!(host, "subscription source missing, skipping");
            continue;
        }
        mounts.push(MountEntry::bind(
            host,
            crate::mounts::paths::clean(container),
            vec!["rbind".to_string(), "rprivate".to_string(), "ro".to_string()],
        ));
    }
    Ok(mounts)
}
