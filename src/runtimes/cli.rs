//! OCI runtime driven through its command line (crun, runc, ...).
//!
//! Every invocation runs with `PR_SET_PDEATHSIG(SIGKILL)` so a runtime
//! process never outlives the thread that spawned it.

use crate::constants::DEFAULT_RUNTIMES;
use crate::error::{Error, Result};
use crate::runtime::{ContainerState, CreateOptions, CreateStdio, OciRuntime, Signal};
use crate::sys;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;

/// An OCI runtime binary.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    binary: PathBuf,
    name: String,
    global_args: Vec<String>,
}

impl CliRuntime {
    /// Uses the runtime at `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        let name = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| binary.to_string_lossy().into_owned());
        Self {
            binary,
            name,
            global_args: Vec::new(),
        }
    }

    /// Adds arguments placed before every subcommand (e.g. `--root`).
    pub fn with_global_args(mut self, args: Vec<String>) -> Self {
        self.global_args = args;
        self
    }

    /// Resolves a runtime by path or name, probing the defaults on `PATH`
    /// when none is configured.
    pub fn resolve(configured: Option<&Path>) -> Result<Self> {
        let not_found = |name: &str, e: which::Error| Error::Spawn {
            runtime: name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
        };
        match configured {
            Some(path) if path.components().count() > 1 => Ok(Self::new(path)),
            Some(name) => {
                let name = name.to_string_lossy();
                which::which(name.as_ref()).map(Self::new).map_err(|e| not_found(&name, e))
            }
            None => DEFAULT_RUNTIMES
                .iter()
                .find_map(|name| which::which(name).ok())
                .map(Self::new)
                .ok_or_else(|| Error::Spawn {
                    runtime: DEFAULT_RUNTIMES.join("|"),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no OCI runtime found on PATH"),
                }),
        }
    }

    /// Path of the runtime binary.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.global_args).arg(subcommand);
        // SAFETY: the closure only calls prctl, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| sys::set_parent_death_signal(libc::SIGKILL));
        }
        cmd
    }

    async fn output(&self, mut cmd: Command, subcommand: &str, id: &str) -> Result<Output> {
        tracing::debug!(runtime = %self.name, subcommand, container = id, "invoking runtime");
        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| Error::Spawn {
                runtime: self.binary.display().to_string(),
                source,
            })?;
        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
            if text.trim().is_empty() {
                text = String::from_utf8_lossy(&output.stdout).into_owned();
            }
            return Err(Error::runtime_exit(subcommand, id, output.status, &text));
        }
        Ok(output)
    }
}

#[async_trait]
impl OciRuntime for CliRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, id: &str, bundle: &Path, opts: CreateOptions) -> Result<()> {
        let mut cmd = self.command("create");
        cmd.arg("--bundle")
            .arg(bundle)
            .arg("--pid-file")
            .arg(&opts.pid_file);
        if let Some(socket) = &opts.console_socket {
            cmd.arg("--console-socket").arg(socket);
        }
        cmd.args(&opts.extra_args).arg(id).current_dir(bundle);

        match opts.stdio {
            CreateStdio::Inherit => {
                cmd.stdin(Stdio::inherit()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            CreateStdio::Pipes { stdin, stdout, stderr } => {
                cmd.stdin(Stdio::from(stdin))
                    .stdout(Stdio::from(stdout))
                    .stderr(Stdio::from(stderr));
            }
        }

        tracing::debug!(runtime = %self.name, container = id, bundle = %bundle.display(), "creating container");
        let status = cmd.status().await.map_err(|source| Error::Spawn {
            runtime: self.binary.display().to_string(),
            source,
        })?;
        // Dropping the command closes our copies of the container's stdio.
        drop(cmd);
        if !status.success() {
            return Err(Error::runtime_exit("create", id, status, ""));
        }
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut cmd = self.command("start");
        cmd.arg(id);
        self.output(cmd, "start", id).await?;
        Ok(())
    }

    async fn state(&self, id: &str) -> Result<ContainerState> {
        let mut cmd = self.command("state");
        cmd.arg(id);
        let output = self.output(cmd, "state", id).await?;
        serde_json::from_slice(&output.stdout).map_err(|e| Error::Protocol {
            id: id.to_string(),
            reason: format!("malformed state output: {e}"),
        })
    }

    async fn kill(&self, id: &str, signal: Signal) -> Result<()> {
        let mut cmd = self.command("kill");
        cmd.arg(id).arg(signal.to_string());
        self.output(cmd, "kill", id).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut cmd = self.command("delete");
        cmd.arg(id);
        self.output(cmd, "delete", id).await?;
        Ok(())
    }
}
