//! Typed run mounts: `type=bind|cache|tmpfs|secret|ssh,key=value,...`.

use super::MountContext;
use super::cache::{CacheLock, CacheSharing, cache_dir_id, lockfile_path};
use super::paths::{chmod, chown_if_needed, container_target, resolve_in_root};
use crate::cleanup::RunMountArtifacts;
use crate::collaborators::Collaborators;
use crate::constants::{
    DEFAULT_CACHE_MODE, DEFAULT_SECRET_MODE, DEFAULT_SSH_ID, DEFAULT_SSH_MODE, SECRETS_MOUNT_DIR,
    SSH_AGENT_MOUNT_DIR,
};
use crate::error::{Error, Result};
use crate::spec::MountEntry;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where a secret's content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "source")]
pub enum Secret {
    /// The named environment variable of the engine process.
    Env(String),
    /// A host file.
    File(PathBuf),
}

/// Kind of a run mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMountType {
    Bind,
    Cache,
    Tmpfs,
    Secret,
    Ssh,
}

impl std::str::FromStr for RunMountType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "bind" => Ok(Self::Bind),
            "cache" => Ok(Self::Cache),
            "tmpfs" => Ok(Self::Tmpfs),
            "secret" => Ok(Self::Secret),
            "ssh" => Ok(Self::Ssh),
            other => Err(format!("unsupported mount type '{other}'")),
        }
    }
}

/// A tokenized run mount.
#[derive(Debug, Clone)]
pub struct RunMount<'a> {
    pub spec: &'a str,
    pub kind: RunMountType,
    pub tokens: Vec<(&'a str, Option<&'a str>)>,
}

impl<'a> RunMount<'a> {
    /// Splits a run mount into `key[=value]` tokens.
    ///
    /// `type` defaults to `bind` when absent.
    pub fn parse(spec: &'a str) -> Result<Self> {
        let mut kind = RunMountType::Bind;
        let mut tokens = Vec::new();
        for token in spec.split(',').filter(|t| !t.is_empty()) {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };
            if key == "type" {
                kind = value
                    .unwrap_or_default()
                    .parse()
                    .map_err(|reason| Error::InvalidMount {
                        spec: spec.to_string(),
                        reason,
                    })?;
                continue;
            }
            tokens.push((key, value));
        }
        Ok(Self { spec, kind, tokens })
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidMount {
            spec: self.spec.to_string(),
            reason: reason.into(),
        }
    }

    fn value(&self, key: &str, value: Option<&'a str>) -> Result<&'a str> {
        value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| self.invalid(format!("option '{key}' needs a value")))
    }

    fn flag(&self, key: &str, value: Option<&str>) -> Result<bool> {
        match value {
            None | Some("true") | Some("1") => Ok(true),
            Some("false") | Some("0") => Ok(false),
            Some(other) => Err(self.invalid(format!("option '{key}' expects a boolean, got '{other}'"))),
        }
    }

    fn number(&self, key: &str, value: Option<&str>) -> Result<u32> {
        let v = self.value(key, value)?;
        v.parse()
            .map_err(|_| self.invalid(format!("option '{key}' expects a number, got '{v}'")))
    }

    fn mode(&self, key: &str, value: Option<&str>) -> Result<u32> {
        let v = self.value(key, value)?;
        u32::from_str_radix(v, 8)
            .ok()
            .filter(|m| *m <= 0o7777)
            .ok_or_else(|| self.invalid(format!("option '{key}' expects an octal mode, got '{v}'")))
    }
}

fn propagation_ok(value: &str) -> bool {
    matches!(value, "shared" | "rshared" | "private" | "rprivate" | "slave" | "rslave")
}

// =============================================================================
// bind
// =============================================================================

/// `type=bind`: a path from the build context, a stage, or an image.
///
/// Read-only unless `rw` is given.
pub fn bind_mount(
    ctx: &MountContext<'_>,
    collaborators: &Collaborators,
    mount: &RunMount<'_>,
    artifacts: &mut RunMountArtifacts,
) -> Result<MountEntry> {
    let mut source = None;
    let mut target = None;
    let mut from = None;
    let mut read_only = true;
    let mut propagation = "rprivate";
    let mut recursive = true;
    let mut relabel = None;

    for &(key, value) in &mount.tokens {
        match key {
            "source" | "src" => source = Some(mount.value(key, value)?),
            "target" | "dst" | "destination" => target = Some(mount.value(key, value)?),
            "from" => from = Some(mount.value(key, value)?),
            "ro" | "readonly" => read_only = mount.flag(key, value)?,
            "rw" | "readwrite" => read_only = !mount.flag(key, value)?,
            "bind-propagation" => {
                let v = mount.value(key, value)?;
                if !propagation_ok(v) {
                    return Err(mount.invalid(format!("invalid bind-propagation '{v}'")));
                }
                propagation = v;
            }
            "bind-nonrecursive" => recursive = !mount.flag(key, value)?,
            "z" => relabel = Some(true),
            "Z" => relabel = Some(false),
            "relabel" => match mount.value(key, value)? {
                "shared" => relabel = Some(true),
                "private" => relabel = Some(false),
                other => return Err(mount.invalid(format!("invalid relabel '{other}'"))),
            },
            other => return Err(mount.invalid(format!("unknown option '{other}'"))),
        }
    }
    let target = target.ok_or_else(|| mount.invalid("target is required"))?;

    let root = match from {
        Some(name) => source_root(ctx, collaborators, name, artifacts)?,
        None => ctx
            .context_dir
            .map(Path::to_path_buf)
            .ok_or_else(|| mount.invalid("no build context directory configured"))?,
    };
    let src = resolve_in_root(&root, source.unwrap_or("/"))?;
    if !src.exists() {
        return Err(Error::MountAssembly {
            destination: target.to_string(),
            reason: format!("bind source '{}' does not exist", src.display()),
        });
    }
    if let (Some(shared), Some(label)) = (relabel, ctx.mount_label) {
        collaborators.labeler.relabel(&src, label, shared)?;
    }

    let options = vec![
        if recursive { "rbind" } else { "bind" }.to_string(),
        if read_only { "ro" } else { "rw" }.to_string(),
        propagation.to_string(),
    ];
    Ok(MountEntry::bind(
        src.to_string_lossy(),
        container_target(ctx.work_dir, target),
        options,
    ))
}

/// Resolves `from=` to a stage's mount point or a mounted image.
fn source_root(
    ctx: &MountContext<'_>,
    collaborators: &Collaborators,
    name: &str,
    artifacts: &mut RunMountArtifacts,
) -> Result<PathBuf> {
    if let Some(stage) = ctx.stage_mounts.get(name) {
        return Ok(stage.clone());
    }
    let mount_point = collaborators.images.mount(name)?;
    artifacts.mounted_images.push(name.to_string());
    Ok(mount_point)
}

// =============================================================================
// tmpfs
// =============================================================================

/// `type=tmpfs`.
pub fn tmpfs_mount(ctx: &MountContext<'_>, mount: &RunMount<'_>) -> Result<MountEntry> {
    let mut target = None;
    let mut options = Vec::new();
    for &(key, value) in &mount.tokens {
        match key {
            "target" | "dst" | "destination" => target = Some(mount.value(key, value)?),
            "tmpfs-size" | "size" => options.push(format!("size={}", mount.value(key, value)?)),
            "tmpfs-mode" | "mode" => options.push(format!("mode={:o}", mount.mode(key, value)?)),
            "ro" | "readonly" => {
                if mount.flag(key, value)? {
                    options.push("ro".to_string());
                }
            }
            "nosuid" | "nodev" | "noexec" | "tmpcopyup" => options.push(key.to_string()),
            "source" | "src" => return Err(mount.invalid("tmpfs mounts cannot have a source")),
            other => return Err(mount.invalid(format!("unknown option '{other}'"))),
        }
    }
    let target = target.ok_or_else(|| mount.invalid("target is required"))?;
    Ok(MountEntry {
        destination: container_target(ctx.work_dir, target),
        mount_type: "tmpfs".to_string(),
        source: "tmpfs".to_string(),
        options,
    })
}

// =============================================================================
// secret
// =============================================================================

/// `type=secret`: the secret's content in a read-only file.
///
/// Returns `None` when the secret is unknown and not `required`.
pub fn secret_mount(
    ctx: &MountContext<'_>,
    collaborators: &Collaborators,
    mount: &RunMount<'_>,
    artifacts: &mut RunMountArtifacts,
) -> Result<Option<MountEntry>> {
    let mut id = None;
    let mut target = None;
    let mut required = false;
    let mut mode = DEFAULT_SECRET_MODE;
    let mut uid = 0;
    let mut gid = 0;
    for &(key, value) in &mount.tokens {
        match key {
            "id" => id = Some(mount.value(key, value)?),
            "target" | "dst" | "destination" => target = Some(mount.value(key, value)?),
            "required" => required = mount.flag(key, value)?,
            "mode" => mode = mount.mode(key, value)?,
            "uid" => uid = mount.number(key, value)?,
            "gid" => gid = mount.number(key, value)?,
            other => return Err(mount.invalid(format!("unknown option '{other}'"))),
        }
    }
    let id = id.ok_or_else(|| mount.invalid("id is required"))?;
    let target = match target {
        Some(t) => container_target(ctx.work_dir, t),
        None => format!("{SECRETS_MOUNT_DIR}/{id}"),
    };

    let Some(secret) = ctx.secrets.get(id) else {
        if required {
            return Err(Error::SecretRequired(id.to_string()));
        }
        tracing::debug!(id, "secret not provided, skipping optional secret mount");
        return Ok(None);
    };

    let content = match secret {
        Secret::Env(var) => std::env::var(var)
            .map_err(|_| Error::Config(format!("secret '{id}': environment variable '{var}' is not set")))?
            .into_bytes(),
        Secret::File(path) => std::fs::read(path)?,
    };

    let path = match secret {
        Secret::Env(_) => {
            let mut file = tempfile::Builder::new().prefix("secret-").tempfile_in(ctx.tmp_dir)?;
            file.write_all(&content)?;
            let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;
            path
        }
        Secret::File(_) => {
            let dir = ctx.container_dir.join("secrets");
            std::fs::create_dir_all(&dir)?;
            let path = dir.join(id);
            std::fs::write(&path, &content)?;
            path
        }
    };
    artifacts.tmp_files.push(path.clone());

    if let Some(label) = ctx.mount_label {
        collaborators.labeler.relabel(&path, label, false)?;
    }
    let (host_uid, host_gid) = ctx.id_mappings.host_ids(uid, gid)?;
    chown_if_needed(&path, host_uid, host_gid)?;
    chmod(&path, mode)?;

    Ok(Some(MountEntry::bind(
        path.to_string_lossy(),
        target,
        vec!["rbind".to_string(), "rprivate".to_string(), "ro".to_string()],
    )))
}

// =============================================================================
// ssh
// =============================================================================

/// `type=ssh`: a socket served by a forwarding agent.
///
/// `index` is the number of ssh mounts already produced in this run and
/// picks the default target. The first ssh mount's target becomes the run's
/// `SSH_AUTH_SOCK`.
pub fn ssh_mount(
    ctx: &MountContext<'_>,
    collaborators: &Collaborators,
    mount: &RunMount<'_>,
    index: usize,
    artifacts: &mut RunMountArtifacts,
) -> Result<Option<MountEntry>> {
    let mut id = DEFAULT_SSH_ID;
    let mut target = None;
    let mut required = false;
    let mut mode = DEFAULT_SSH_MODE;
    let mut uid = 0;
    let mut gid = 0;
    for &(key, value) in &mount.tokens {
        match key {
            "id" => id = mount.value(key, value)?,
            "target" | "dst" | "destination" => target = Some(mount.value(key, value)?),
            "required" => required = mount.flag(key, value)?,
            "mode" => mode = mount.mode(key, value)?,
            "uid" => uid = mount.number(key, value)?,
            "gid" => gid = mount.number(key, value)?,
            other => return Err(mount.invalid(format!("unknown option '{other}'"))),
        }
    }
    let target = match target {
        Some(t) => container_target(ctx.work_dir, t),
        None => format!("{SSH_AGENT_MOUNT_DIR}/ssh_agent.{index}"),
    };

    let Some(source) = ctx.ssh_sources.get(id) else {
        if required {
            return Err(Error::SshRequired(id.to_string()));
        }
        tracing::debug!(id, "ssh source not provided, skipping optional ssh mount");
        return Ok(None);
    };

    let mut agent = collaborators.ssh.serve(source, ctx.process_label)?;
    let socket = agent.socket_path().to_path_buf();
    let prepared = (|| -> Result<()> {
        if let Some(label) = ctx.mount_label {
            if let Some(dir) = socket.parent() {
                collaborators.labeler.relabel(dir, label, false)?;
            }
        }
        let (host_uid, host_gid) = ctx.id_mappings.host_ids(uid, gid)?;
        if let Some(dir) = socket.parent() {
            chown_if_needed(dir, host_uid, host_gid)?;
        }
        chown_if_needed(&socket, host_uid, host_gid)?;
        chmod(&socket, mode)
    })();
    if let Err(e) = prepared {
        if let Err(shutdown) = agent.shutdown() {
            tracing::warn!(error = %shutdown, "failed to stop ssh agent after setup error");
        }
        return Err(e);
    }

    artifacts.agents.push(agent);
    if artifacts.ssh_auth_sock.is_none() {
        artifacts.ssh_auth_sock = Some(target.clone());
    }
    Ok(Some(MountEntry::bind(
        socket.to_string_lossy(),
        target,
        vec!["rbind".to_string(), "rprivate".to_string(), "ro".to_string()],
    )))
}

// =============================================================================
// cache
// =============================================================================

/// `type=cache`: a directory that outlives the run, keyed by `id` or target.
pub fn cache_mount(
    ctx: &MountContext<'_>,
    collaborators: &Collaborators,
    mount: &RunMount<'_>,
    artifacts: &mut RunMountArtifacts,
) -> Result<MountEntry> {
    let mut id = None;
    let mut target = None;
    let mut from = None;
    let mut source = None;
    let mut sharing = CacheSharing::default();
    let mut read_only = false;
    let mut propagation = "rprivate";
    let mut relabel = None;
    let mut mode = DEFAULT_CACHE_MODE;
    let mut uid = 0;
    let mut gid = 0;
    for &(key, value) in &mount.tokens {
        match key {
            "id" => id = Some(mount.value(key, value)?),
            "target" | "dst" | "destination" => target = Some(mount.value(key, value)?),
            "from" => from = Some(mount.value(key, value)?),
            "source" | "src" => source = Some(mount.value(key, value)?),
            "sharing" => sharing = mount.value(key, value)?.parse()?,
            "ro" | "readonly" => read_only = mount.flag(key, value)?,
            "rw" | "readwrite" => read_only = !mount.flag(key, value)?,
            "bind-propagation" => {
                let v = mount.value(key, value)?;
                if !propagation_ok(v) {
                    return Err(mount.invalid(format!("invalid bind-propagation '{v}'")));
                }
                propagation = v;
            }
            "z" => relabel = Some(true),
            "Z" => relabel = Some(false),
            "mode" => mode = mount.mode(key, value)?,
            "uid" => uid = mount.number(key, value)?,
            "gid" => gid = mount.number(key, value)?,
            other => return Err(mount.invalid(format!("unknown option '{other}'"))),
        }
    }
    let target = target.ok_or_else(|| mount.invalid("target is required"))?;
    let destination = container_target(ctx.work_dir, target);
    let key = id.unwrap_or(destination.as_str());
    let dir_id = cache_dir_id(key);

    let lock_key = match from {
        Some(f) => cache_dir_id(&format!("{f}:{key}")),
        None => dir_id.clone(),
    };
    match sharing {
        CacheSharing::Locked => {
            let lock = CacheLock::exclusive(&lockfile_path(ctx.cache_parent, &lock_key))?;
            artifacts.target_locks.push(lock);
        }
        CacheSharing::Shared => {
            let lock = CacheLock::shared(&lockfile_path(ctx.cache_parent, &lock_key))?;
            artifacts.target_locks.push(lock);
        }
        CacheSharing::Private => {}
    }

    let root = match (from, sharing) {
        (Some(name), _) => source_root(ctx, collaborators, name, artifacts)?,
        (None, CacheSharing::Private) => {
            std::fs::create_dir_all(ctx.cache_parent)?;
            let dir = tempfile::Builder::new()
                .prefix(&format!("{dir_id}-"))
                .tempdir_in(ctx.cache_parent)?
                .keep();
            artifacts.tmp_files.push(dir.clone());
            dir
        }
        (None, _) => ctx.cache_parent.join(&dir_id),
    };

    let dir = resolve_in_root(&root, source.unwrap_or("/"))?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        chmod(&dir, mode)?;
        let (host_uid, host_gid) = ctx.id_mappings.host_ids(uid, gid)?;
        chown_if_needed(&dir, host_uid, host_gid)?;
    }

    let relabel = relabel.or_else(|| (from.is_none() && collaborators.labeler.enabled()).then_some(true));
    if let (Some(shared), Some(label)) = (relabel, ctx.mount_label) {
        collaborators.labeler.relabel(&dir, label, shared)?;
    }

    Ok(MountEntry::bind(
        dir.to_string_lossy(),
        destination,
        vec![
            "bind".to_string(),
            if read_only { "ro" } else { "rw" }.to_string(),
            propagation.to_string(),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_to_bind() {
        let mount = RunMount::parse("target=/src,rw").unwrap();
        assert_eq!(mount.kind, RunMountType::Bind);
        assert_eq!(mount.tokens, vec![("target", Some("/src")), ("rw", None)]);
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let err = RunMount::parse("type=volume,target=/x").unwrap_err();
        assert!(matches!(err, Error::InvalidMount { .. }));
    }

    #[test]
    fn test_mode_parsing_is_octal() {
        let mount = RunMount::parse("type=secret,id=x,mode=0440").unwrap();
        assert_eq!(mount.mode("mode", Some("0440")).unwrap(), 0o440);
        assert!(mount.mode("mode", Some("999")).is_err());
    }
}
