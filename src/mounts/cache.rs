//! Cache mount directories and their lockfiles.
//!
//! Each cache mount is backed by a directory under the cache parent, named
//! after a digest of its `id` (or target). Concurrent runs coordinate through
//! a lockfile per cache directory:
//!
//! | sharing  | lock                | directory           |
//! |----------|---------------------|---------------------|
//! | `locked` | exclusive, blocking | shared across runs  |
//! | `shared` | shared, blocking    | shared across runs  |
//! | `private`| none                | fresh for this run  |
//!
//! Lockfiles are never unlinked: removing a held lockfile would let a second
//! run create a new file at the same path and lock it independently.

use crate::constants::{CACHE_DIR_ID_LEN, CACHE_LOCKFILE, CACHE_LOCKFILE_DIR};
use crate::error::{Error, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// How a cache directory is shared between concurrent runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheSharing {
    /// One run at a time.
    #[default]
    Locked,
    /// Any number of `shared` runs, excluding `locked` ones.
    Shared,
    /// A throwaway directory per run.
    Private,
}

impl std::str::FromStr for CacheSharing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "locked" => Ok(Self::Locked),
            "shared" => Ok(Self::Shared),
            "private" => Ok(Self::Private),
            other => Err(Error::InvalidMount {
                spec: format!("sharing={other}"),
                reason: "sharing must be one of shared, private, locked".to_string(),
            }),
        }
    }
}

/// Returns the directory name for a cache keyed by `key`.
pub fn cache_dir_id(key: &str) -> String {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    digest[..CACHE_DIR_ID_LEN].to_string()
}

/// Returns the lockfile path guarding cache `dir_id` under `cache_parent`.
pub fn lockfile_path(cache_parent: &Path, dir_id: &str) -> PathBuf {
    cache_parent
        .join(CACHE_LOCKFILE_DIR)
        .join(dir_id)
        .join(CACHE_LOCKFILE)
}

/// Default cache parent: the user runtime directory, falling back to the
/// system temporary directory.
pub fn default_cache_parent() -> PathBuf {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let uid = unsafe { libc::geteuid() };
    dirs::runtime_dir()
        .map(|d| d.join("magikbuild").join("cache"))
        .unwrap_or_else(|| std::env::temp_dir().join(format!("magikbuild-cache-{uid}")))
}

/// A held lock on a cache lockfile.
///
/// [`CacheLock::release`] unlocks exactly once; later calls are no-ops.
/// Dropping a lock that was never released unlocks it as well.
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
    file: Option<File>,
}

impl CacheLock {
    /// Blocks until an exclusive lock on `path` is held.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = open_lockfile(path)?;
        tracing::debug!(path = %path.display(), "waiting for exclusive cache lock");
        FileExt::lock_exclusive(&file)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// Blocks until a shared lock on `path` is held.
    pub fn shared(path: &Path) -> Result<Self> {
        let file = open_lockfile(path)?;
        tracing::debug!(path = %path.display(), "waiting for shared cache lock");
        FileExt::lock_shared(&file)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// Lockfile path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true until the lock has been released.
    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Releases the lock. Idempotent.
    pub fn release(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => {
                FileExt::unlock(&file)?;
                tracing::debug!(path = %self.path.display(), "released cache lock");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release cache lock");
        }
    }
}

fn open_lockfile(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_dir_id_is_stable_prefix() {
        let id = cache_dir_id("/root/.cache/go-build");
        assert_eq!(id.len(), CACHE_DIR_ID_LEN);
        assert_eq!(id, cache_dir_id("/root/.cache/go-build"));
        assert_ne!(id, cache_dir_id("/root/.cache/pip"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = lockfile_path(dir.path(), "abc");
        let mut lock = CacheLock::exclusive(&path).unwrap();
        assert!(lock.is_held());
        lock.release().unwrap();
        lock.release().unwrap();
        assert!(!lock.is_held());
        assert!(path.exists(), "lockfile should never be unlinked");
    }

    #[test]
    fn test_exclusive_lock_excludes_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = lockfile_path(dir.path(), "abc");
        let mut lock = CacheLock::exclusive(&path).unwrap();

        let other = open_lockfile(&path).unwrap();
        assert!(FileExt::try_lock_exclusive(&other).is_err());

        lock.release().unwrap();
        assert!(FileExt::try_lock_exclusive(&other).is_ok());
    }

    #[test]
    fn test_sharing_parse() {
        assert_eq!("locked".parse::<CacheSharing>().unwrap(), CacheSharing::Locked);
        assert_eq!("private".parse::<CacheSharing>().unwrap(), CacheSharing::Private);
        assert!("exclusive".parse::<CacheSharing>().is_err());
    }
}
