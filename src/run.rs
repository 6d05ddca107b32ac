//! End-to-end run of one command in a build container.
//!
//! [`Runner::run`] strings the stages together:
//!
//! ```text
//!   namespace plan ─► spec ─► bundle + /etc files ─► mount assembly ─► hooks
//!        │                                                              │
//!        │                          ┌───────────────────────────────────┘
//!        │                          ▼
//!        │           in-process orchestrator (pinned thread)
//!        │           or re-executed runtime child + network handshake
//!        │                          │
//!        └──────────────► cleanup: mount artifacts, bundle (always)
//! ```
//!
//! Mount and namespace errors abort before any runtime process exists.
//! Cleanup runs on every path; when both the run and cleanup fail, the run's
//! error is reported and the cleanup error logged.

use crate::cleanup::RunMountArtifacts;
use crate::collaborators::{Collaborators, SshSource};
use crate::config::EngineConfig;
use crate::constants::{USER_NETWORK_HELPERS, validate_container_id};
use crate::error::{Error, Phase, Result, ResultExt};
use crate::etc::{self, DnsOptions, EtcRequest};
use crate::hooks::{self, Hook};
use crate::mounts::run_mounts::Secret;
use crate::mounts::{MountAssembler, MountContext, MountEntry, MountSources};
use crate::namespace::{self, EffectiveNamespaces, IdMappingOptions, NamespaceKind, NamespaceOptions, NamespacePlan, NetworkPolicy, PlanRequest};
use crate::orchestrator::{AfterCreate, LifecycleState, OrchestrateRequest, Orchestrator, WaitStatus};
use crate::reexec::{self, NetworkStep, NetworkTeardown, SubprocessConfig};
use crate::relay::RelayEndpoints;
use crate::runtime::OciRuntime;
use crate::runtimes::CliRuntime;
use crate::spec::{OciBox, OciSpec};
use crate::{bundle::Bundle, sys};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Inputs
// =============================================================================

/// The working container a build step runs in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildContainer {
    /// Container name, used as the runtime container ID.
    pub name: String,
    /// Mounted root filesystem.
    pub rootfs: PathBuf,
    /// Persistent per-container state (built-in volumes, secrets).
    pub container_dir: PathBuf,
    /// Builder-level namespace layer.
    pub namespaces: NamespaceOptions,
    pub network: NetworkPolicy,
    pub id_mappings: IdMappingOptions,
    /// Declared volumes (`[src:]dst[:opts]`).
    pub volumes: Vec<String>,
    /// Image-declared volume paths.
    pub builtin_volumes: Vec<String>,
    pub hostname: Option<String>,
    /// Base environment, `KEY=value`.
    pub env: Vec<String>,
    pub work_dir: String,
    pub uid: u32,
    pub gid: u32,
    pub mount_label: Option<String>,
    pub process_label: Option<String>,
    pub dns: DnsOptions,
    /// `name:ip` entries for `/etc/hosts`.
    pub add_hosts: Vec<String>,
}

/// One command invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub args: Vec<String>,
    /// Extra environment, applied over the container's.
    pub env: Vec<String>,
    pub terminal: bool,
    pub console_size: Option<OciBox>,
    pub work_dir: Option<String>,
    /// Invocation-level namespace layer.
    pub namespaces: NamespaceOptions,
    pub network: NetworkPolicy,
    /// Explicit mounts; these win every destination conflict.
    pub mounts: Vec<MountEntry>,
    /// `--mount` style typed mounts.
    pub run_mounts: Vec<String>,
    pub context_dir: Option<PathBuf>,
    /// Mount points of earlier stages, by stage name.
    pub stage_mounts: BTreeMap<String, PathBuf>,
    pub secrets: BTreeMap<String, Secret>,
    pub ssh_sources: BTreeMap<String, SshSource>,
    pub hooks: Vec<Hook>,
    /// Bound on the whole hook chain, in seconds.
    pub hooks_timeout: Option<u64>,
    pub extra_create_args: Vec<String>,
    /// Caller descriptors; the process's stdio when unset.
    #[serde(skip)]
    pub stdio: Option<RelayEndpoints>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub status: WaitStatus,
    /// Lifecycle states observed; empty when the runtime ran in a child.
    pub transitions: Vec<LifecycleState>,
}

impl RunReport {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.exit_code()
    }
}

// =============================================================================
// Runner
// =============================================================================

/// Runs commands in build containers.
#[derive(Clone)]
pub struct Runner {
    config: EngineConfig,
    runtime: Arc<dyn OciRuntime>,
    /// Runtime binary, when known; required for the re-executed child.
    runtime_binary: Option<PathBuf>,
    collaborators: Collaborators,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("runtime", &self.runtime.name())
            .field("runtime_binary", &self.runtime_binary)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// A runner driving `runtime` in-process.
    pub fn new(config: EngineConfig, runtime: Arc<dyn OciRuntime>, collaborators: Collaborators) -> Self {
        Self {
            config,
            runtime,
            runtime_binary: None,
            collaborators,
        }
    }

    /// A runner using the runtime binary named by `config`.
    pub fn from_config(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        let runtime = CliRuntime::resolve(config.runtime.as_deref())?.with_global_args(config.runtime_args.clone());
        let binary = runtime.binary().to_path_buf();
        info!(runtime = %binary.display(), "using OCI runtime");
        Ok(Self {
            config,
            runtime: Arc::new(runtime),
            runtime_binary: Some(binary),
            collaborators,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs `options.args` in `container` and waits for it to exit.
    pub async fn run(&self, container: &BuildContainer, mut options: RunOptions) -> Result<RunReport> {
        validate_container_id(&container.name)
            .map_err(|reason| Error::InvalidContainerId {
                id: container.name.clone(),
                reason: reason.to_string(),
            })
            .phase(Phase::Namespace)?;

        let plan = self.plan(container, &options).phase(Phase::Namespace)?;
        let id_maps = effective_id_maps(container, &plan);
        let owner = host_owner(&id_maps).phase(Phase::Namespace)?;
        let mut spec = build_spec(container, &options, &plan, &id_maps);

        let mut bundle = Bundle::create(&self.config.tmp_dir, &container.name, owner).phase(Phase::Bundle)?;
        let etc_files = etc::generate(&EtcRequest {
            bundle: bundle.path(),
            rootfs: &container.rootfs,
            hostname: &plan.hostname,
            add_hosts: &container.add_hosts,
            dns: &container.dns,
            host_resolv_conf: &self.config.host_resolv_conf,
            host_network: plan.namespaces.is_host(NamespaceKind::Network),
            owner,
        })
        .phase(Phase::Bundle)?;
        let hosts_file = etc_files.get("/etc/hosts").cloned();

        let job = MountJob {
            container: container.clone(),
            config: self.config.clone(),
            collaborators: self.collaborators.clone(),
            work_dir: options.work_dir.clone().unwrap_or_else(|| container.work_dir.clone()),
            context_dir: options.context_dir.take(),
            stage_mounts: std::mem::take(&mut options.stage_mounts),
            secrets: std::mem::take(&mut options.secrets),
            ssh_sources: std::mem::take(&mut options.ssh_sources),
            id_maps: id_maps.clone(),
            namespaces: plan.namespaces.clone(),
            user_namespace: plan.has_user_namespace(),
            base_mounts: spec.mounts.clone(),
            sources: MountSources {
                option_mounts: std::mem::take(&mut options.mounts),
                volumes: container.volumes.clone(),
                builtin_volumes: container.builtin_volumes.clone(),
                run_mounts: std::mem::take(&mut options.run_mounts),
                bind_files: etc_files,
            },
        };
        // Cache locks block in flock(2); keep that off the async workers.
        let (mut artifacts, assembled) = match tokio::task::spawn_blocking(move || job.assemble()).await {
            Ok(out) => out,
            Err(e) => (
                RunMountArtifacts::new(),
                Err(Error::Internal(format!("mount assembly task failed: {e}"))),
            ),
        };

        let result = match assembled {
            Ok(mounts) => {
                spec.mounts = mounts;
                if let Some(sock) = &artifacts.ssh_auth_sock {
                    spec.set_env("SSH_AUTH_SOCK", sock);
                }
                let network = plan.configure_network.then(|| NetworkStep {
                    configurator: Arc::clone(&self.collaborators.network),
                    container: container.name.clone(),
                    networks: plan.networks.clone(),
                    hosts_file,
                });
                self.execute(&container.name, bundle.path(), spec, owner, options, network)
                    .await
            }
            Err(e) => Err(e.in_phase(Phase::MountAssembly)),
        };

        let cleanup = artifacts.cleanup(&container.rootfs, self.collaborators.images.as_ref());
        if let Err(e) = bundle.remove() {
            warn!(container = %container.name, error = %e, "failed to remove bundle");
        }
        match (result, cleanup) {
            (Err(e), Err(c)) => {
                warn!(container = %container.name, error = %c, "cleanup after failed run also failed");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(c)) => Err(c),
            (Ok(report), Ok(())) => {
                info!(container = %container.name, status = %report.status, "run finished");
                Ok(report)
            }
        }
    }

    fn plan(&self, container: &BuildContainer, options: &RunOptions) -> Result<NamespacePlan> {
        let process_id_mappings = if self.config.rootless {
            namespace::current_id_maps().unwrap_or_else(|e| {
                debug!(error = %e, "could not read process id maps");
                IdMappingOptions::default()
            })
        } else {
            IdMappingOptions::default()
        };
        let builder_network = match container.network {
            NetworkPolicy::Default => self.config.network_policy,
            explicit => explicit,
        };
        namespace::plan(&PlanRequest {
            defaults: self.config.default_namespaces.clone(),
            builder: container.namespaces.clone(),
            invocation: options.namespaces.clone(),
            builder_network,
            invocation_network: options.network,
            isolation: self.config.isolation,
            id_mappings: container.id_mappings.clone(),
            process_id_mappings,
            user_network_available: USER_NETWORK_HELPERS.iter().any(|h| which::which(h).is_ok()),
            ping_group_range_available: Path::new("/proc/sys/net/ipv4/ping_group_range").exists(),
            hostname: container.hostname.clone(),
            container_id: container.name.clone(),
        })
    }

    async fn execute(
        &self,
        name: &str,
        bundle: &Path,
        mut spec: OciSpec,
        owner: (u32, u32),
        options: RunOptions,
        network: Option<NetworkStep>,
    ) -> Result<RunReport> {
        if !options.hooks.is_empty() {
            let deadline = options
                .hooks_timeout
                .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
            let output = hooks::run_hooks(&options.hooks, serde_json::to_vec(&spec)?, deadline)
                .await
                .phase(Phase::Bundle)?;
            spec = serde_json::from_slice(&output).map_err(Error::from).phase(Phase::Bundle)?;
        }

        let interrupts = reexec::signal_forwarder()?;

        let isolated = self.config.isolated_child && network.is_some();
        if let (true, Some(binary)) = (isolated, self.runtime_binary.clone()) {
            debug!(container = name, "running runtime from a child process");
            let config = SubprocessConfig {
                runtime: binary,
                runtime_args: self.config.runtime_args.clone(),
                container_name: name.to_string(),
                bundle: bundle.to_path_buf(),
                spec,
                stdio_owner: Some(owner),
                extra_create_args: options.extra_create_args,
                configure_network: true,
            };
            let status = reexec::run_isolated(&config, network, interrupts).await?;
            return Ok(RunReport {
                status,
                transitions: Vec::new(),
            });
        }

        if let Err(e) = sys::set_child_subreaper() {
            warn!(error = %e, "could not become child subreaper, exit status may be unavailable");
        }
        let teardown: Arc<Mutex<Option<NetworkTeardown>>> = Arc::default();
        let after_create = network.map(|step| {
            let slot = Arc::clone(&teardown);
            AfterCreate::Configure(Box::new(move |pid| {
                let undo = step.apply(pid)?;
                if let Ok(mut slot) = slot.lock() {
                    *slot = undo;
                }
                Ok(())
            }))
        });
        let request = OrchestrateRequest {
            container_name: name.to_string(),
            bundle: bundle.to_path_buf(),
            spec,
            stdio_owner: Some(owner),
            extra_create_args: options.extra_create_args,
            caller: options.stdio.unwrap_or_default(),
            after_create,
        };
        let orchestrator = Orchestrator::new(Arc::clone(&self.runtime));
        let outcome = tokio::task::spawn_blocking(move || orchestrator.run_pinned(request, interrupts))
            .await
            .map_err(|e| Error::Internal(format!("container run task failed: {e}")))?;

        if let Some(undo) = teardown.lock().ok().and_then(|mut slot| slot.take()) {
            undo();
        }
        let outcome = outcome?;
        Ok(RunReport {
            status: outcome.status,
            transitions: outcome.transitions,
        })
    }
}

/// Owned inputs for mount assembly, so it can run on a blocking thread.
struct MountJob {
    container: BuildContainer,
    config: EngineConfig,
    collaborators: Collaborators,
    work_dir: String,
    context_dir: Option<PathBuf>,
    stage_mounts: BTreeMap<String, PathBuf>,
    secrets: BTreeMap<String, Secret>,
    ssh_sources: BTreeMap<String, SshSource>,
    id_maps: IdMappingOptions,
    namespaces: EffectiveNamespaces,
    user_namespace: bool,
    base_mounts: Vec<MountEntry>,
    sources: MountSources,
}

impl MountJob {
    fn assemble(self) -> (RunMountArtifacts, Result<Vec<MountEntry>>) {
        let mut artifacts = RunMountArtifacts::new();
        let ctx = MountContext {
            rootfs: &self.container.rootfs,
            container_dir: &self.container.container_dir,
            tmp_dir: &self.config.tmp_dir,
            cache_parent: &self.config.cache_parent,
            work_dir: &self.work_dir,
            context_dir: self.context_dir.as_deref(),
            stage_mounts: &self.stage_mounts,
            secrets: &self.secrets,
            ssh_sources: &self.ssh_sources,
            id_mappings: &self.id_maps,
            process_user: (self.container.uid, self.container.gid),
            mount_label: self.container.mount_label.as_deref(),
            process_label: self.container.process_label.as_deref(),
            namespaces: &self.namespaces,
            user_namespace: self.user_namespace,
            base_mounts: &self.base_mounts,
            shm_size: &self.config.shm_size,
            subscriptions_file: self.config.mounts_file.as_deref(),
        };
        let result = MountAssembler::new(ctx, &self.collaborators).assemble(&self.sources, &mut artifacts);
        (artifacts, result)
    }
}

/// The container's mappings, or the process's when a user namespace is
/// created without explicit ones.
fn effective_id_maps(container: &BuildContainer, plan: &NamespacePlan) -> IdMappingOptions {
    if container.id_mappings.has_mappings() || !plan.has_user_namespace() {
        return container.id_mappings.clone();
    }
    IdMappingOptions {
        uid_map: plan.uid_mappings.iter().copied().map(Into::into).collect(),
        gid_map: plan.gid_mappings.iter().copied().map(Into::into).collect(),
    }
}

/// Host IDs owning generated files: the mapped container root, or this
/// process when there are no mappings.
fn host_owner(maps: &IdMappingOptions) -> Result<(u32, u32)> {
    if maps.has_mappings() {
        return maps.host_root_ids();
    }
    // SAFETY: geteuid/getegid have no preconditions.
    Ok(unsafe { (libc::geteuid(), libc::getegid()) })
}

fn build_spec(
    container: &BuildContainer,
    options: &RunOptions,
    plan: &NamespacePlan,
    id_maps: &IdMappingOptions,
) -> OciSpec {
    let mut spec = OciSpec::new(&container.rootfs, options.args.clone());
    for entry in container.env.iter().chain(&options.env) {
        let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        spec.set_env(key, value);
    }
    if let Some(hostname) = plan.hostname_env() {
        spec.set_env("HOSTNAME", hostname);
    }
    spec.hostname = plan.hostname.clone();

    if let Some(process) = spec.process.as_mut() {
        process.terminal = options.terminal;
        process.console_size = options.console_size;
        process.user.uid = container.uid;
        process.user.gid = container.gid;
        let cwd = options.work_dir.as_deref().unwrap_or(&container.work_dir);
        if !cwd.is_empty() {
            process.cwd = cwd.to_string();
        }
        process.selinux_label = container.process_label.clone();
    }

    let linux = spec.linux_mut();
    linux.namespaces = plan.oci_namespaces.clone();
    if id_maps.has_mappings() {
        linux.uid_mappings = plan.uid_mappings.clone();
        linux.gid_mappings = plan.gid_mappings.clone();
    }
    linux.sysctl.extend(plan.sysctls.clone());
    linux.mount_label = container.mount_label.clone();
    spec
}
