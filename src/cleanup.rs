//! Run-scoped artifacts and their teardown.
//!
//! Mount assembly records everything it creates outside the container's
//! final mount list in [`RunMountArtifacts`]: forwarding agents, mounted
//! images, mount points it caused to exist, temporary files, and held cache
//! locks. [`RunMountArtifacts::cleanup`] tears them down in a fixed order
//! and may be called any number of times; each call drains what it handled.
//!
//! ```text
//!   agents ─► images ─► mount targets ─► tmp files ─► cache locks
//! ```
//!
//! Locks are released last and always, even when earlier stages fail, so a
//! failed run never holds a cache directory hostage.

use crate::collaborators::{AgentHandle, ImageMounter, UnmountOutcome};
use crate::error::{Error, Phase, Result};
use crate::mounts::cache::CacheLock;
use crate::mounts::paths::resolve_in_root;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Everything a run created that must be undone afterwards.
#[derive(Debug, Default)]
pub struct RunMountArtifacts {
    /// Container paths created by mounting onto a missing destination.
    pub mount_targets: BTreeSet<String>,
    /// Host files and directories to delete.
    pub tmp_files: Vec<PathBuf>,
    /// Running ssh forwarding agents.
    pub agents: Vec<Box<dyn AgentHandle>>,
    /// Images mounted for `from=` sources.
    pub mounted_images: Vec<String>,
    /// Container path of the first ssh agent socket.
    pub ssh_auth_sock: Option<String>,
    /// Held cache locks.
    pub target_locks: Vec<CacheLock>,
}

impl RunMountArtifacts {
    /// Creates an empty artifact set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing remains to clean up.
    pub fn is_empty(&self) -> bool {
        self.mount_targets.is_empty()
            && self.tmp_files.is_empty()
            && self.agents.is_empty()
            && self.mounted_images.is_empty()
            && self.target_locks.is_empty()
    }

    /// Tears down every recorded artifact.
    ///
    /// Mount targets are only ever removed from inside `rootfs`, and only
    /// when they are empty. The first failure is returned; later ones are
    /// logged. Calling again after success is a no-op.
    pub fn cleanup(&mut self, rootfs: &Path, images: &dyn ImageMounter) -> Result<()> {
        let mut first: Option<Error> = None;
        let mut record = |err: Error| {
            if first.is_none() {
                first = Some(err);
            } else {
                tracing::warn!(error = %err, "additional cleanup failure");
            }
        };

        for mut agent in std::mem::take(&mut self.agents) {
            if let Err(e) = agent.shutdown() {
                record(e);
            }
        }

        for image in std::mem::take(&mut self.mounted_images) {
            match images.unmount(&image) {
                Ok(UnmountOutcome::Unmounted) => {
                    tracing::debug!(image = %image, "unmounted image");
                }
                Ok(UnmountOutcome::NotMounted) => {
                    tracing::debug!(image = %image, "image already unmounted");
                }
                Err(e) => record(e),
            }
        }

        // Deepest first so nested targets go before their parents.
        let mut targets: Vec<String> = std::mem::take(&mut self.mount_targets).into_iter().collect();
        targets.sort_by_key(|t| std::cmp::Reverse(crate::mounts::paths::depth(t)));
        for target in targets {
            if let Err(e) = remove_mount_target(rootfs, &target) {
                record(e);
            }
        }

        for path in std::mem::take(&mut self.tmp_files) {
            let removed = match std::fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&path),
                Ok(_) => std::fs::remove_file(&path),
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => tracing::debug!(path = %path.display(), "removed temporary file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => record(e.into()),
            }
        }

        self.ssh_auth_sock = None;
        for mut lock in std::mem::take(&mut self.target_locks) {
            if let Err(e) = lock.release() {
                record(e);
            }
        }

        match first {
            Some(e) => Err(e.in_phase(Phase::Cleanup)),
            None => Ok(()),
        }
    }
}

/// Removes an empty mount point the run caused to exist.
fn remove_mount_target(rootfs: &Path, target: &str) -> Result<()> {
    let path = resolve_in_root(rootfs, target)?;
    if !path.starts_with(rootfs) || path == rootfs {
        return Err(Error::Internal(format!(
            "mount target '{target}' resolved outside the container root"
        )));
    }
    let removed = match std::fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir(&path),
        Ok(_) => std::fs::remove_file(&path),
        Err(e) => Err(e),
    };
    match removed {
        Ok(()) => {
            tracing::debug!(target, "removed mount target");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
            tracing::warn!(target, "mount target not empty after run, leaving it in place");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
