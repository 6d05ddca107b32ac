//! Volume specs and builtin image volumes.
//!
//! A volume spec has the form `[source:]destination[:options]`. With a
//! source it becomes a bind (or, with `O`, an overlay) mount; without one it
//! is an anonymous volume backed by a directory in the container directory,
//! seeded from the image's content at that path, the same way builtin image
//! volumes are.

use super::MountContext;
use super::paths::{chmod, chown_if_needed, chown_tree, clean, copy_dir_contents, resolve_in_root};
use crate::cleanup::RunMountArtifacts;
use crate::collaborators::Collaborators;
use crate::error::{Error, Result};
use crate::spec::MountEntry;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// A parsed volume spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub source: Option<String>,
    pub destination: String,
    pub options: Vec<String>,
}

const PROPAGATION: &[&str] = &["shared", "rshared", "private", "rprivate", "slave", "rslave"];

/// Parses a `[source:]destination[:options]` volume spec.
pub fn parse_volume(spec: &str) -> Result<VolumeSpec> {
    let invalid = |reason: &str| Error::InvalidMount {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, destination, options) = match parts.as_slice() {
        [dst] => (None, *dst, ""),
        [src, dst] if dst.starts_with('/') => (Some(*src), *dst, ""),
        // `/data:ro` is an anonymous volume with options
        [dst, opts] => (None, *dst, *opts),
        [src, dst, opts] => (Some(*src), *dst, *opts),
        _ => return Err(invalid("too many ':' separated fields")),
    };
    if destination.is_empty() || !destination.starts_with('/') {
        return Err(invalid("destination must be an absolute path"));
    }
    if let Some(src) = source {
        if src.is_empty() {
            return Err(invalid("source cannot be empty"));
        }
        if !src.starts_with('/') {
            return Err(invalid("named volumes are not supported, source must be an absolute path"));
        }
    }
    let options: Vec<String> = options
        .split(',')
        .filter(|o| !o.is_empty())
        .map(String::from)
        .collect();
    validate_volume_options(spec, &options)?;
    Ok(VolumeSpec {
        source: source.map(String::from),
        destination: clean(destination),
        options,
    })
}

/// Rejects unknown options and conflicting option classes.
pub fn validate_volume_options(spec: &str, options: &[String]) -> Result<()> {
    let mut seen_rw = false;
    let mut seen_propagation = false;
    let mut seen_label = false;
    let mut seen_bind = false;
    let mut seen = HashSet::new();
    for option in options {
        let dup = |class: &str| Error::InvalidMount {
            spec: spec.to_string(),
            reason: format!("conflicting {class} options"),
        };
        if !seen.insert(option.as_str()) {
            return Err(Error::InvalidMount {
                spec: spec.to_string(),
                reason: format!("duplicate option '{option}'"),
            });
        }
        match option.as_str() {
            "ro" | "rw" => {
                if std::mem::replace(&mut seen_rw, true) {
                    return Err(dup("ro/rw"));
                }
            }
            "z" | "Z" => {
                if std::mem::replace(&mut seen_label, true) {
                    return Err(dup("relabel"));
                }
            }
            "bind" | "rbind" => {
                if std::mem::replace(&mut seen_bind, true) {
                    return Err(dup("bind"));
                }
            }
            o if PROPAGATION.contains(&o) => {
                if std::mem::replace(&mut seen_propagation, true) {
                    return Err(dup("propagation"));
                }
            }
            "U" | "O" | "nosuid" | "suid" | "nodev" | "dev" | "noexec" | "exec" => {}
            other => {
                return Err(Error::InvalidMount {
                    spec: spec.to_string(),
                    reason: format!("unknown option '{other}'"),
                });
            }
        }
    }
    Ok(())
}

/// Builds mounts for the caller's volume specs.
///
/// Anonymous volumes are returned with the builtin-volume treatment; two
/// specs naming the same destination are rejected.
pub fn volume_mounts(
    ctx: &MountContext<'_>,
    collaborators: &Collaborators,
    volumes: &[String],
    artifacts: &mut RunMountArtifacts,
) -> Result<Vec<MountEntry>> {
    let mut destinations = HashSet::new();
    let mut mounts = Vec::with_capacity(volumes.len());
    for spec in volumes {
        let volume = parse_volume(spec)?;
        if !destinations.insert(volume.destination.clone()) {
            return Err(Error::InvalidMount {
                spec: spec.clone(),
                reason: format!("duplicate mount destination '{}'", volume.destination),
            });
        }
        let mount = match &volume.source {
            None => builtin_volume(ctx, collaborators, &volume.destination)?,
            Some(source) => bind_volume(ctx, collaborators, spec, source, &volume, artifacts)?,
        };
        mounts.push(mount);
    }
    Ok(mounts)
}

fn bind_volume(
    ctx: &MountContext<'_>,
    collaborators: &Collaborators,
    spec: &str,
    source: &str,
    volume: &VolumeSpec,
    artifacts: &mut RunMountArtifacts,
) -> Result<MountEntry> {
    let src = Path::new(source);
    if !src.exists() {
        return Err(Error::MountAssembly {
            destination: volume.destination.clone(),
            reason: format!("volume source '{source}' does not exist"),
        });
    }

    let mut options = Vec::with_capacity(volume.options.len() + 2);
    let mut overlay = false;
    for option in &volume.options {
        match option.as_str() {
            "z" | "Z" => {
                if let Some(label) = ctx.mount_label {
                    collaborators.labeler.relabel(src, label, option == "z")?;
                }
            }
            "U" => {
                let (uid, gid) = ctx.id_mappings.host_ids(ctx.process_user.0, ctx.process_user.1)?;
                chown_tree(src, uid, gid)?;
            }
            "O" => overlay = true,
            _ => options.push(option.clone()),
        }
    }

    if overlay {
        let dir = tempfile::Builder::new()
            .prefix("overlay-")
            .tempdir_in(ctx.tmp_dir)?
            .keep();
        artifacts.tmp_files.push(dir.clone());
        let upper = dir.join("upper");
        let work = dir.join("work");
        std::fs::create_dir(&upper)?;
        std::fs::create_dir(&work)?;
        let (uid, gid) = ctx.host_root()?;
        chown_if_needed(&upper, uid, gid)?;
        chown_if_needed(&work, uid, gid)?;
        let mut overlay_options = vec![
            format!("lowerdir={source}"),
            format!("upperdir={}", upper.display()),
            format!("workdir={}", work.display()),
            "private".to_string(),
        ];
        overlay_options.extend(options.into_iter().filter(|o| !PROPAGATION.contains(&o.as_str())));
        tracing::debug!(spec, "using overlay for volume");
        return Ok(MountEntry {
            destination: volume.destination.clone(),
            mount_type: "overlay".to_string(),
            source: "overlay".to_string(),
            options: overlay_options,
        });
    }

    if !options.iter().any(|o| o == "bind" || o == "rbind") {
        options.push("rbind".to_string());
    }
    if !options.iter().any(|o| PROPAGATION.contains(&o.as_str())) {
        options.push("rprivate".to_string());
    }
    Ok(MountEntry::bind(source, volume.destination.clone(), options))
}

/// Builds mounts for volumes the image declares.
pub fn builtin_volume_mounts(
    ctx: &MountContext<'_>,
    collaborators: &Collaborators,
    volumes: &[String],
) -> Result<Vec<MountEntry>> {
    volumes
        .iter()
        .map(|v| builtin_volume(ctx, collaborators, &clean(v)))
        .collect()
}

/// Prepares the persistent directory backing a builtin volume.
///
/// The directory lives in the container directory, named after a digest of
/// the volume path. On first use it is seeded with the image's content at
/// that path, taking the image directory's mode and ownership.
fn builtin_volume(
    ctx: &MountContext<'_>,
    collaborators: &Collaborators,
    volume: &str,
) -> Result<MountEntry> {
    let name = hex::encode(Sha256::digest(volume.as_bytes()));
    let volume_dir = ctx.container_dir.join("volumes").join(name);
    let (uid, gid) = ctx.host_root()?;

    let initialize = !volume_dir.exists();
    if initialize {
        std::fs::create_dir_all(&volume_dir)?;
        chmod(&volume_dir, 0o755)?;
        if let Some(label) = ctx.mount_label {
            collaborators.labeler.relabel(&volume_dir, label, false)?;
        }
    }

    let in_rootfs = resolve_in_root(ctx.rootfs, volume)?;
    if !in_rootfs.exists() {
        std::fs::create_dir_all(&in_rootfs)?;
        chown_if_needed(&in_rootfs, uid, gid)?;
    }

    if initialize {
        let meta = std::fs::metadata(&in_rootfs)?;
        chmod(&volume_dir, meta.mode() & 0o7777)?;
        chown_if_needed(&volume_dir, meta.uid(), meta.gid())?;
        if meta.is_dir() {
            copy_dir_contents(&in_rootfs, &volume_dir)?;
        }
        tracing::debug!(volume, dir = %volume_dir.display(), "initialized builtin volume");
    }

    Ok(MountEntry::bind(
        volume_dir.to_string_lossy(),
        volume.to_string(),
        vec!["bind".to_string(), "rprivate".to_string()],
    ))
}
