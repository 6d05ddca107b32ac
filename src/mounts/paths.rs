//! Path handling for mount destinations and rootfs-relative lookups.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

/// Symlinks followed before a lookup is declared a loop.
const MAX_SYMLINKS: usize = 40;

/// Lexically cleans an absolute container path.
///
/// Collapses repeated separators, `.` and `..` components and strips any
/// trailing separator, so `/data/`, `/data//` and `/x/../data` all compare
/// equal to `/data`. `..` never climbs above `/`.
pub fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Resolves a mount target against the container working directory.
pub fn container_target(work_dir: &str, target: &str) -> String {
    if target.starts_with('/') {
        clean(target)
    } else {
        clean(&format!("{work_dir}/{target}"))
    }
}

/// Number of components in a cleaned destination; `/` has depth zero.
pub fn depth(destination: &str) -> usize {
    clean(destination).split('/').filter(|p| !p.is_empty()).count()
}

/// Resolves `path` inside `root`, following symlinks without escaping it.
///
/// Absolute symlink targets are reinterpreted relative to `root` and `..`
/// stops at `root`, the way a process chrooted into `root` would see them.
/// Missing trailing components are allowed; the result need not exist.
pub fn resolve_in_root(root: &Path, path: &str) -> Result<PathBuf> {
    let mut pending: Vec<OsString> = components(Path::new(path));
    pending.reverse();
    let mut resolved = PathBuf::new();
    let mut followed = 0;

    while let Some(part) = pending.pop() {
        if part == ".." {
            resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let full = root.join(&candidate);
        match std::fs::symlink_metadata(&full) {
            Ok(meta) if meta.file_type().is_symlink() => {
                followed += 1;
                if followed > MAX_SYMLINKS {
                    return Err(Error::Io(std::io::Error::from_raw_os_error(libc::ELOOP)));
                }
                let target = std::fs::read_link(&full)?;
                if target.is_absolute() {
                    resolved = PathBuf::new();
                }
                let mut next = components(&target);
                next.reverse();
                pending.extend(next);
            }
            _ => resolved = candidate,
        }
    }
    Ok(root.join(resolved))
}

fn components(path: &Path) -> Vec<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
        })
        .collect()
}

/// Returns true if `destination` exists inside `rootfs`.
pub fn exists_in_root(rootfs: &Path, destination: &str) -> bool {
    resolve_in_root(rootfs, destination)
        .map(|p| std::fs::symlink_metadata(p).is_ok())
        .unwrap_or(false)
}

/// Changes ownership of `path` unless it already has `uid`/`gid`.
pub fn chown_if_needed(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.uid() == uid && meta.gid() == gid {
        return Ok(());
    }
    std::os::unix::fs::lchown(path, Some(uid), Some(gid))?;
    Ok(())
}

/// Sets the permission bits of `path`.
pub fn chmod(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Recursively changes ownership of everything under `root`, symlinks included.
pub fn chown_tree(root: &Path, uid: u32, gid: u32) -> Result<()> {
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        chown_if_needed(entry.path(), uid, gid)?;
    }
    Ok(())
}

/// Copies the contents of `src` into `dst`, preserving modes and symlinks.
pub fn copy_dir_contents(src: &Path, dst: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let target = dst.join(rel);
        let meta = entry.path().symlink_metadata()?;
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(meta.mode()))?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        } else {
            tracing::debug!(path = %entry.path().display(), "skipping special file in volume copy");
            continue;
        }
        if let Err(e) = chown_if_needed(&target, meta.uid(), meta.gid()) {
            tracing::debug!(path = %target.display(), error = %e, "could not preserve ownership");
        }
    }
    Ok(())
}
