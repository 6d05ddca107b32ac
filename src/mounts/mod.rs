//! Mount assembly.
//!
//! Turns every source of mounts for a run into one deduplicated list:
//!
//! ```text
//!   option mounts ─┐
//!   volume specs  ─┤
//!   builtin vols  ─┤
//!   run mounts    ─┼─► concat (precedence order) ─► stable sort by depth ─► first wins
//!   subscriptions ─┤
//!   bind files    ─┤
//!   special       ─┘
//! ```
//!
//! Sorting by depth puts `/dev` before `/dev/shm` so parents are mounted
//! first; the sort is stable, so for a destination claimed by several sources
//! the one from the earliest category survives.

pub mod cache;
pub mod paths;
pub mod run_mounts;
pub mod special;
pub mod volumes;

use crate::cleanup::RunMountArtifacts;
use crate::collaborators::{Collaborators, SshSource};
use crate::error::{Error, Result};
use crate::namespace::{EffectiveNamespaces, IdMappingOptions};
pub use crate::spec::MountEntry;
use run_mounts::{RunMount, RunMountType, Secret};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Mount sources, in precedence order (earlier wins on conflict).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MountCategory {
    /// Mounts passed explicitly with the run options.
    Option,
    /// Caller volume specs.
    Volume,
    /// Volumes declared by the image.
    Builtin,
    /// Typed run mounts.
    Run,
    /// Subscription file mounts.
    Subscription,
    /// Generated files such as `/etc/hosts`.
    BindFile,
    /// Kernel filesystems.
    Special,
}

impl MountCategory {
    /// Returns true if a missing destination of this category is removed
    /// from the rootfs after the run.
    pub fn cleans_target(&self) -> bool {
        !matches!(self, Self::Builtin | Self::Special)
    }
}

/// Folds candidate mounts into the final list.
///
/// Candidates are ordered by category, then stably by destination depth;
/// the first candidate for each normalized destination is kept. Returns the
/// winners along with their category.
pub fn merge_mounts(candidates: Vec<(MountCategory, MountEntry)>) -> Vec<(MountCategory, MountEntry)> {
    let mut ordered: Vec<(MountCategory, MountEntry)> = candidates
        .into_iter()
        .map(|(category, mut mount)| {
            mount.destination = paths::clean(&mount.destination);
            (category, mount)
        })
        .collect();
    ordered.sort_by_key(|(category, _)| *category);
    ordered.sort_by_key(|(_, mount)| paths::depth(&mount.destination));

    let mut claimed = HashSet::new();
    ordered
        .into_iter()
        .filter(|(_, mount)| claimed.insert(mount.destination.clone()))
        .collect()
}

/// Caller-facing mount inputs for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountSources {
    pub option_mounts: Vec<MountEntry>,
    pub volumes: Vec<String>,
    pub builtin_volumes: Vec<String>,
    pub run_mounts: Vec<String>,
    /// Generated files keyed by container destination.
    pub bind_files: BTreeMap<String, PathBuf>,
}

/// Everything mount assembly needs to know about the run.
#[derive(Debug, Clone, Copy)]
pub struct MountContext<'a> {
    pub rootfs: &'a Path,
    /// Persistent per-container directory (volumes, materialized secrets).
    pub container_dir: &'a Path,
    pub tmp_dir: &'a Path,
    pub cache_parent: &'a Path,
    /// Container working directory, for relative targets.
    pub work_dir: &'a str,
    pub context_dir: Option<&'a Path>,
    /// Mount points of earlier build stages, by name.
    pub stage_mounts: &'a BTreeMap<String, PathBuf>,
    pub secrets: &'a BTreeMap<String, Secret>,
    pub ssh_sources: &'a BTreeMap<String, SshSource>,
    pub id_mappings: &'a IdMappingOptions,
    /// Container uid/gid of the process.
    pub process_user: (u32, u32),
    pub mount_label: Option<&'a str>,
    pub process_label: Option<&'a str>,
    pub namespaces: &'a EffectiveNamespaces,
    /// True if the container gets its own user namespace.
    pub user_namespace: bool,
    /// Kernel filesystem mounts from the base spec.
    pub base_mounts: &'a [MountEntry],
    pub shm_size: &'a str,
    pub subscriptions_file: Option<&'a Path>,
}

impl MountContext<'_> {
    /// Host IDs of container root.
    pub fn host_root(&self) -> Result<(u32, u32)> {
        self.id_mappings.host_root_ids()
    }
}

/// Assembles the final mount list for a run.
pub struct MountAssembler<'a> {
    ctx: MountContext<'a>,
    collaborators: &'a Collaborators,
}

impl<'a> MountAssembler<'a> {
    pub fn new(ctx: MountContext<'a>, collaborators: &'a Collaborators) -> Self {
        Self { ctx, collaborators }
    }

    /// Builds the deduplicated, depth-ordered mount list.
    ///
    /// Everything created along the way is recorded in `artifacts` as soon
    /// as it exists, so on error the caller still cleans up whatever was set
    /// up before the failure.
    pub fn assemble(&self, sources: &MountSources, artifacts: &mut RunMountArtifacts) -> Result<Vec<MountEntry>> {
        let ctx = &self.ctx;
        let mut candidates: Vec<(MountCategory, MountEntry)> = Vec::new();

        candidates.extend(
            special::special_mounts(ctx.base_mounts, ctx.namespaces, ctx.user_namespace, ctx.shm_size)
                .into_iter()
                .map(|m| (MountCategory::Special, m)),
        );
        candidates.extend(
            special::bind_file_mounts(&sources.bind_files)
                .into_iter()
                .map(|m| (MountCategory::BindFile, m)),
        );
        if let Some(file) = ctx.subscriptions_file {
            candidates.extend(
                special::subscription_mounts(file)?
                    .into_iter()
                    .map(|m| (MountCategory::Subscription, m)),
            );
        }

        let mut ssh_count = 0;
        for spec in &sources.run_mounts {
            if let Some(mount) = self.run_mount(spec, &mut ssh_count, artifacts)? {
                candidates.push((MountCategory::Run, mount));
            }
        }

        candidates.extend(
            sources
                .option_mounts
                .iter()
                .cloned()
                .map(|m| (MountCategory::Option, m)),
        );

        // Snapshot which destinations exist before volumes touch the rootfs.
        let mut probe: Vec<String> = candidates
            .iter()
            .map(|(_, m)| paths::clean(&m.destination))
            .collect();
        probe.extend(
            sources
                .volumes
                .iter()
                .filter_map(|v| volumes::parse_volume(v).ok())
                .map(|v| v.destination),
        );
        let preexisting: HashSet<String> = probe
            .into_iter()
            .filter(|d| paths::exists_in_root(ctx.rootfs, d))
            .collect();

        candidates.extend(
            volumes::builtin_volume_mounts(ctx, self.collaborators, &sources.builtin_volumes)?
                .into_iter()
                .map(|m| (MountCategory::Builtin, m)),
        );
        candidates.extend(
            volumes::volume_mounts(ctx, self.collaborators, &sources.volumes, artifacts)?
                .into_iter()
                .map(|m| (MountCategory::Volume, m)),
        );

        let merged = merge_mounts(candidates);
        for (category, mount) in &merged {
            if category.cleans_target() && !preexisting.contains(&mount.destination) {
                artifacts.mount_targets.insert(mount.destination.clone());
            }
        }
        tracing::debug!(
            mounts = merged.len(),
            new_targets = artifacts.mount_targets.len(),
            "assembled mounts"
        );
        Ok(merged.into_iter().map(|(_, m)| m).collect())
    }

    fn run_mount(
        &self,
        spec: &str,
        ssh_count: &mut usize,
        artifacts: &mut RunMountArtifacts,
    ) -> Result<Option<MountEntry>> {
        let mount = RunMount::parse(spec)?;
        let ctx = &self.ctx;
        let collaborators = self.collaborators;
        let entry = match mount.kind {
            RunMountType::Bind => Some(run_mounts::bind_mount(ctx, collaborators, &mount, artifacts)?),
            RunMountType::Cache => Some(run_mounts::cache_mount(ctx, collaborators, &mount, artifacts)?),
            RunMountType::Tmpfs => Some(run_mounts::tmpfs_mount(ctx, &mount)?),
            RunMountType::Secret => run_mounts::secret_mount(ctx, collaborators, &mount, artifacts)?,
            RunMountType::Ssh => {
                let entry = run_mounts::ssh_mount(ctx, collaborators, &mount, *ssh_count, artifacts)?;
                if entry.is_some() {
                    *ssh_count += 1;
                }
                entry
            }
        };
        if let Some(entry) = &entry {
            if entry.destination == "/" {
                return Err(Error::InvalidMount {
                    spec: spec.to_string(),
                    reason: "cannot mount over the container root".to_string(),
                });
            }
        }
        Ok(entry)
    }
}
