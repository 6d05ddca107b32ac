//! Namespace planning.
//!
//! Resolves the namespace configuration for a run from three ordered
//! override layers (engine defaults, builder settings, per-run options),
//! applies isolation-mode restrictions, and produces the namespace list,
//! ID mappings, hostname, and network decisions for the runtime config.
//!
//! ```text
//!   defaults ──┐
//!   builder  ──┼── fold ──► EffectiveNamespaces ──► isolation checks ──► NamespacePlan
//!   run opts ──┘   (later layer wins per kind)
//! ```

use crate::constants::{
    DEFAULT_HOSTNAME_LEN, PING_GROUP_RANGE_SYSCTL, PING_GROUP_RANGE_VALUE,
};
use crate::error::{Error, Result};
use crate::spec::{OciIdMapping, OciNamespace};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

// =============================================================================
// Namespace Kinds and Options
// =============================================================================

/// A Linux namespace kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Cgroup,
    Ipc,
    Mount,
    Network,
    Pid,
    User,
    Uts,
}

impl NamespaceKind {
    /// All namespace kinds in canonical order.
    pub const ALL: [NamespaceKind; 7] = [
        Self::Cgroup,
        Self::Ipc,
        Self::Mount,
        Self::Network,
        Self::Pid,
        Self::User,
        Self::Uts,
    ];

    /// Returns the OCI runtime spec name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cgroup => "cgroup",
            Self::Ipc => "ipc",
            Self::Mount => "mount",
            Self::Network => "network",
            Self::Pid => "pid",
            Self::User => "user",
            Self::Uts => "uts",
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NamespaceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cgroup" => Ok(Self::Cgroup),
            "ipc" => Ok(Self::Ipc),
            "mount" | "mnt" => Ok(Self::Mount),
            "network" | "net" => Ok(Self::Network),
            "pid" => Ok(Self::Pid),
            "user" => Ok(Self::User),
            "uts" => Ok(Self::Uts),
            other => Err(Error::Config(format!("unknown namespace kind '{other}'"))),
        }
    }
}

/// How a single namespace is provided to the container.
///
/// `host` and a non-empty `path` are mutually exclusive. For the network
/// namespace a non-absolute `path` is a comma-separated list of network
/// names to attach to instead of a namespace file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceOption {
    pub kind: NamespaceKind,
    #[serde(default)]
    pub host: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl NamespaceOption {
    /// Shares the host's namespace.
    pub fn host(kind: NamespaceKind) -> Self {
        Self { kind, host: true, path: None }
    }

    /// Creates a fresh namespace.
    pub fn private(kind: NamespaceKind) -> Self {
        Self { kind, host: false, path: None }
    }

    /// Joins the namespace at `path` (or, for network, the named networks).
    pub fn path(kind: NamespaceKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            host: false,
            path: Some(path.into()),
        }
    }

    /// Returns the path if set and non-empty.
    pub fn joined_path(&self) -> Option<&str> {
        self.path.as_deref().filter(|p| !p.is_empty())
    }

    /// Returns true if this option asks for a brand new namespace.
    pub fn is_private(&self) -> bool {
        !self.host && self.joined_path().is_none()
    }

    fn validate(&self) -> Result<()> {
        if self.host && self.joined_path().is_some() {
            return Err(Error::Config(format!(
                "{} namespace cannot both share the host and join '{}'",
                self.kind,
                self.path.as_deref().unwrap_or_default()
            )));
        }
        Ok(())
    }
}

/// One override layer: an ordered list where a later entry for the same
/// kind replaces an earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceOptions(pub Vec<NamespaceOption>);

impl NamespaceOptions {
    /// Creates an empty layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an option, overriding any earlier one of the same kind.
    pub fn with(mut self, option: NamespaceOption) -> Self {
        self.0.push(option);
        self
    }

    /// Returns the effective option for `kind` in this layer.
    pub fn find(&self, kind: NamespaceKind) -> Option<&NamespaceOption> {
        self.0.iter().rev().find(|o| o.kind == kind)
    }

    /// Engine defaults: a private namespace of every kind except user, which
    /// is only created when ID mappings require it.
    pub fn defaults() -> Self {
        Self(
            [
                NamespaceKind::Cgroup,
                NamespaceKind::Ipc,
                NamespaceKind::Mount,
                NamespaceKind::Network,
                NamespaceKind::Pid,
                NamespaceKind::Uts,
            ]
            .into_iter()
            .map(NamespaceOption::private)
            .chain([NamespaceOption::host(NamespaceKind::User)])
            .collect(),
        )
    }
}

/// The folded result of all override layers.
///
/// Immutable once built; [`EffectiveNamespaces::with_override`] returns a new
/// value rather than mutating in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveNamespaces {
    options: BTreeMap<NamespaceKind, NamespaceOption>,
}

impl EffectiveNamespaces {
    /// Folds `layers` in order; for each kind the last layer mentioning it wins.
    pub fn fold<'a>(layers: impl IntoIterator<Item = &'a NamespaceOptions>) -> Result<Self> {
        let mut options = BTreeMap::new();
        for layer in layers {
            for option in &layer.0 {
                option.validate()?;
                options.insert(option.kind, option.clone());
            }
        }
        Ok(Self { options })
    }

    /// Returns the option for `kind`, if any layer set one.
    pub fn get(&self, kind: NamespaceKind) -> Option<&NamespaceOption> {
        self.options.get(&kind)
    }

    /// Returns true if `kind` is explicitly shared with the host.
    pub fn is_host(&self, kind: NamespaceKind) -> bool {
        self.get(kind).is_some_and(|o| o.host)
    }

    /// Returns a copy with `option` replacing the entry for its kind.
    pub fn with_override(&self, option: NamespaceOption) -> Self {
        let mut options = self.options.clone();
        options.insert(option.kind, option);
        Self { options }
    }

    /// Iterates options in kind order.
    pub fn iter(&self) -> impl Iterator<Item = &NamespaceOption> {
        self.options.values()
    }
}

// =============================================================================
// ID Mappings
// =============================================================================

/// A contiguous range of container IDs mapped onto host IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl From<IdMap> for OciIdMapping {
    fn from(m: IdMap) -> Self {
        Self {
            container_id: m.container_id,
            host_id: m.host_id,
            size: m.size,
        }
    }
}

impl From<OciIdMapping> for IdMap {
    fn from(m: OciIdMapping) -> Self {
        Self {
            container_id: m.container_id,
            host_id: m.host_id,
            size: m.size,
        }
    }
}

/// User and group ID mappings for the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdMappingOptions {
    pub uid_map: Vec<IdMap>,
    pub gid_map: Vec<IdMap>,
}

impl IdMappingOptions {
    /// Returns true if either mapping is non-empty.
    pub fn has_mappings(&self) -> bool {
        !self.uid_map.is_empty() || !self.gid_map.is_empty()
    }

    /// Returns the host IDs that container `uid`/`gid` map to.
    pub fn host_ids(&self, uid: u32, gid: u32) -> Result<(u32, u32)> {
        Ok((host_id(&self.uid_map, uid)?, host_id(&self.gid_map, gid)?))
    }

    /// Returns the host IDs that container root maps to.
    pub fn host_root_ids(&self) -> Result<(u32, u32)> {
        self.host_ids(0, 0)
    }
}

/// Maps a container ID to a host ID. An empty map is the identity.
pub fn host_id(map: &[IdMap], id: u32) -> Result<u32> {
    if map.is_empty() {
        return Ok(id);
    }
    map.iter()
        .find(|m| id >= m.container_id && u64::from(id) < u64::from(m.container_id) + u64::from(m.size))
        .map(|m| m.host_id + (id - m.container_id))
        .ok_or_else(|| Error::Config(format!("container ID {id} is not mapped to a host ID")))
}

/// Parses a `/proc/<pid>/uid_map`-formatted document.
pub fn parse_id_map(content: &str) -> Result<Vec<IdMap>> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields: Vec<u32> = line
                .split_whitespace()
                .map(|f| f.parse::<u32>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Config(format!("malformed ID map line '{line}': {e}")))?;
            match fields.as_slice() {
                [container_id, host_id, size] => Ok(IdMap {
                    container_id: *container_id,
                    host_id: *host_id,
                    size: *size,
                }),
                _ => Err(Error::Config(format!("malformed ID map line '{line}'"))),
            }
        })
        .collect()
}

/// Reads the ID maps of the current process.
pub fn current_id_maps() -> Result<IdMappingOptions> {
    Ok(IdMappingOptions {
        uid_map: parse_id_map(&std::fs::read_to_string("/proc/self/uid_map")?)?,
        gid_map: parse_id_map(&std::fs::read_to_string("/proc/self/gid_map")?)?,
    })
}

// =============================================================================
// Policies
// =============================================================================

/// Whether the run gets networking configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// Defer to the next layer (builder, then enabled).
    #[default]
    Default,
    /// No network: the run shares the host namespace and nothing is configured.
    Disabled,
    /// Configure networking for private network namespaces.
    Enabled,
}

/// How the build container is isolated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Isolation {
    /// An OCI runtime run with full privileges.
    #[default]
    Oci,
    /// An OCI runtime run from an unprivileged user.
    OciRootless,
    /// A chroot-like run that never creates a network namespace.
    Chroot,
}

// =============================================================================
// Planning
// =============================================================================

/// Inputs to [`plan`].
#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub defaults: NamespaceOptions,
    pub builder: NamespaceOptions,
    pub invocation: NamespaceOptions,
    pub builder_network: NetworkPolicy,
    pub invocation_network: NetworkPolicy,
    pub isolation: Isolation,
    pub id_mappings: IdMappingOptions,
    /// ID maps of the current process, used when a user namespace is
    /// needed but no explicit mappings were given.
    pub process_id_mappings: IdMappingOptions,
    /// True when a user-mode network helper is installed.
    pub user_network_available: bool,
    /// True when the host exposes `/proc/sys/net/ipv4/ping_group_range`.
    pub ping_group_range_available: bool,
    pub hostname: Option<String>,
    pub container_id: String,
}

/// Namespace decisions for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespacePlan {
    pub namespaces: EffectiveNamespaces,
    /// Namespaces the runtime creates or joins, in config order.
    pub oci_namespaces: Vec<OciNamespace>,
    pub uid_mappings: Vec<OciIdMapping>,
    pub gid_mappings: Vec<OciIdMapping>,
    /// True if the network namespace needs configuring after create.
    pub configure_network: bool,
    /// Networks named by a non-absolute network namespace path.
    pub networks: Vec<String>,
    /// True if a new UTS namespace is created.
    pub configure_uts: bool,
    /// Hostname for the container; empty without a new UTS namespace.
    pub hostname: String,
    pub sysctls: BTreeMap<String, String>,
    pub network_policy: NetworkPolicy,
}

impl NamespacePlan {
    /// Returns the `HOSTNAME` value to inject, if any.
    pub fn hostname_env(&self) -> Option<&str> {
        (self.configure_uts && !self.hostname.is_empty()).then_some(self.hostname.as_str())
    }

    /// Returns true if the plan creates a user namespace.
    pub fn has_user_namespace(&self) -> bool {
        self.oci_namespaces.iter().any(|n| n.ns_type == "user")
    }
}

/// Resolves the namespace plan for a run.
///
/// # Errors
///
/// [`Error::Config`] when an option is both host and path, or when an OCI
/// isolation combines the host PID namespace with a container user namespace.
pub fn plan(request: &PlanRequest) -> Result<NamespacePlan> {
    let mut effective = EffectiveNamespaces::fold([
        &request.defaults,
        &request.builder,
        &request.invocation,
    ])?;
    let caller_network = request.builder.find(NamespaceKind::Network).is_some()
        || request.invocation.find(NamespaceKind::Network).is_some();

    let (isolated, isolation_network) = apply_isolation(effective, request)?;
    effective = isolated;
    let pinned_network = caller_network || isolation_network;

    let policy = match request.invocation_network {
        NetworkPolicy::Default => request.builder_network,
        explicit => explicit,
    };
    if policy == NetworkPolicy::Disabled {
        effective = effective.with_override(NamespaceOption::host(NamespaceKind::Network));
    }

    let mut oci_namespaces = Vec::new();
    let mut configure_network = false;
    let mut configure_uts = false;
    let mut configure_user = false;
    let mut networks = Vec::new();

    for option in effective.iter() {
        if option.host {
            continue;
        }
        let path = option.joined_path();
        match option.kind {
            NamespaceKind::User => {
                configure_user = path.is_none();
            }
            NamespaceKind::Network => {
                if let Some(names) = path.filter(|p| !Path::new(p).is_absolute()) {
                    networks = names
                        .split(',')
                        .map(str::trim)
                        .filter(|n| !n.is_empty())
                        .map(String::from)
                        .collect();
                    oci_namespaces.push(oci_namespace(option.kind, None));
                    configure_network = policy != NetworkPolicy::Disabled;
                    continue;
                }
                configure_network = path.is_none() && policy != NetworkPolicy::Disabled;
            }
            NamespaceKind::Uts => {
                configure_uts = path.is_none();
            }
            _ => {}
        }
        oci_namespaces.push(oci_namespace(option.kind, path));
    }

    let mut uid_mappings = Vec::new();
    let mut gid_mappings = Vec::new();
    if request.id_mappings.has_mappings() || configure_user {
        if !oci_namespaces.iter().any(|n| n.ns_type == "user") {
            oci_namespaces.push(oci_namespace(NamespaceKind::User, None));
        }
        let source = if request.id_mappings.has_mappings() {
            &request.id_mappings
        } else {
            &request.process_id_mappings
        };
        uid_mappings = source.uid_map.iter().copied().map(Into::into).collect();
        gid_mappings = source.gid_map.iter().copied().map(Into::into).collect();

        // A user namespace without its own network namespace cannot
        // configure networking; add one unless the caller chose.
        if !pinned_network
            && policy != NetworkPolicy::Disabled
            && !oci_namespaces.iter().any(|n| n.ns_type == "network")
        {
            oci_namespaces.push(oci_namespace(NamespaceKind::Network, None));
            effective = effective.with_override(NamespaceOption::private(NamespaceKind::Network));
            configure_network = true;
        }
    }

    let hostname = if configure_uts {
        request.hostname.clone().filter(|h| !h.is_empty()).unwrap_or_else(|| {
            request.container_id.chars().take(DEFAULT_HOSTNAME_LEN).collect()
        })
    } else {
        if request.hostname.as_deref().is_some_and(|h| !h.is_empty()) {
            tracing::warn!("hostname ignored: container shares the host UTS namespace");
        }
        String::new()
    };

    let mut sysctls = BTreeMap::new();
    if configure_network
        && request.isolation != Isolation::OciRootless
        && request.ping_group_range_available
    {
        sysctls.insert(
            PING_GROUP_RANGE_SYSCTL.to_string(),
            PING_GROUP_RANGE_VALUE.to_string(),
        );
    }

    tracing::debug!(
        namespaces = ?oci_namespaces.iter().map(|n| n.ns_type.as_str()).collect::<Vec<_>>(),
        configure_network,
        configure_uts,
        "resolved namespace plan"
    );

    Ok(NamespacePlan {
        namespaces: effective,
        oci_namespaces,
        uid_mappings,
        gid_mappings,
        configure_network,
        networks,
        configure_uts,
        hostname,
        sysctls,
        network_policy: policy,
    })
}

fn oci_namespace(kind: NamespaceKind, path: Option<&str>) -> OciNamespace {
    OciNamespace {
        ns_type: kind.as_str().to_string(),
        path: path.map(String::from),
    }
}

/// Applies isolation-mode restrictions to the folded namespaces.
///
/// The returned flag is true when the isolation mode decided the network
/// namespace itself, which later planning must then leave alone.
fn apply_isolation(
    effective: EffectiveNamespaces,
    request: &PlanRequest,
) -> Result<(EffectiveNamespaces, bool)> {
    let mut effective = effective;
    let mut pinned_network = false;
    match request.isolation {
        Isolation::OciRootless => {
            if request.invocation.find(NamespaceKind::Network).is_none()
                && !request.user_network_available
            {
                tracing::info!("no user-mode network helper found, using host network");
                effective = effective.with_override(NamespaceOption::host(NamespaceKind::Network));
                pinned_network = true;
            }
            // Rootless runtimes need their own user, IPC and PID namespaces.
            for kind in [NamespaceKind::Ipc, NamespaceKind::User] {
                if !effective.get(kind).is_some_and(NamespaceOption::is_private) {
                    tracing::debug!(namespace = %kind, "forcing a private namespace for rootless isolation");
                    effective = effective.with_override(NamespaceOption::private(kind));
                }
            }
        }
        Isolation::Chroot => {
            tracing::info!("chroot isolation always uses the host network");
            effective = effective.with_override(NamespaceOption::host(NamespaceKind::Network));
            pinned_network = true;
        }
        Isolation::Oci => {}
    }

    if matches!(request.isolation, Isolation::Oci | Isolation::OciRootless) {
        let user_private = effective
            .get(NamespaceKind::User)
            .is_some_and(|o| !o.host)
            || request.id_mappings.has_mappings();
        if effective.is_host(NamespaceKind::Pid) && user_private {
            return Err(Error::Config(
                "cannot share the host PID namespace with a container user namespace".to_string(),
            ));
        }
    }

    if request.isolation == Isolation::OciRootless
        && !effective.get(NamespaceKind::Pid).is_some_and(NamespaceOption::is_private)
    {
        tracing::debug!("forcing a private PID namespace for rootless isolation");
        effective = effective.with_override(NamespaceOption::private(NamespaceKind::Pid));
    }
    Ok((effective, pinned_network))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_str_aliases() {
        assert_eq!("net".parse::<NamespaceKind>().unwrap(), NamespaceKind::Network);
        assert_eq!("mnt".parse::<NamespaceKind>().unwrap(), NamespaceKind::Mount);
        assert!("bogus".parse::<NamespaceKind>().is_err());
    }

    #[test]
    fn test_host_id_lookup() {
        let map = [IdMap { container_id: 0, host_id: 100000, size: 65536 }];
        assert_eq!(host_id(&map, 0).unwrap(), 100000);
        assert_eq!(host_id(&map, 1000).unwrap(), 101000);
        assert!(host_id(&map, 65536).is_err());
        assert_eq!(host_id(&[], 42).unwrap(), 42);
    }

    #[test]
    fn test_parse_id_map() {
        let maps = parse_id_map("         0       1000          1\n         1     100000      65536\n").unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[1], IdMap { container_id: 1, host_id: 100000, size: 65536 });
        assert!(parse_id_map("0 1").is_err());
    }
}
