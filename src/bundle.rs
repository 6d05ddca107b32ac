//! Per-run OCI runtime bundle directory.
//!
//! A bundle holds the `config.json` the runtime reads, the pid file it
//! writes, the console socket for terminal runs and the generated
//! `/etc` files. It lives in a private temporary directory and is removed
//! recursively when the run ends, whatever the outcome.

use crate::constants::{CONFIG_FILE, CONSOLE_SOCKET, PID_FILE};
use crate::error::{Error, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// A bundle directory owned by one run.
#[derive(Debug)]
pub struct Bundle {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Bundle {
    /// Creates a fresh bundle under `tmp_dir`, readable only by its owner
    /// and the mapped container root.
    pub fn create(tmp_dir: &Path, container: &str, owner: (u32, u32)) -> Result<Self> {
        fs::create_dir_all(tmp_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{container}-bundle-"))
            .tempdir_in(tmp_dir)?;
        let path = dir.path().to_path_buf();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o700))?;
        crate::mounts::paths::chown_if_needed(&path, owner.0, owner.1)?;
        debug!(bundle = %path.display(), "created bundle directory");
        Ok(Self { dir: Some(dir), path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join(CONFIG_FILE)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.path.join(PID_FILE)
    }

    pub fn console_socket(&self) -> PathBuf {
        self.path.join(CONSOLE_SOCKET)
    }

    /// Removes the bundle directory. Idempotent.
    pub fn remove(&mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        dir.close().map_err(|e| {
            Error::Internal(format!("failed to remove bundle {}: {e}", self.path.display()))
        })
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(error = %e, "bundle cleanup failed");
        }
    }
}
