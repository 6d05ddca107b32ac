//! # magikbuild
//!
//! **Build-Container Run Engine**
//!
//! Turns "run this command in the build container" into an isolated Linux
//! process driven through an external OCI runtime (crun, runc, ...), and
//! cleans up everything the run created on every exit path.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Runner                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐   defaults < builder < invocation             │
//! │  │ NamespacePlanner │   isolation overrides, ID maps, network policy │
//! │  └────────┬─────────┘                                               │
//! │           ▼                                                         │
//! │  ┌──────────────────┐   option > volume > built-in > run mounts     │
//! │  │ MountAssembler   │   > subscriptions > /etc files > special      │
//! │  └────────┬─────────┘   records artifacts as they are created       │
//! │           ▼                                                         │
//! │  ┌──────────────────┐   create → [network] → start → state* → delete │
//! │  │ Orchestrator     │◄──── reaper thread (wait4, stopped flag)       │
//! │  └────────┬─────────┘◄──── StdioRelay thread (pipes or pty)          │
//! │           ▼                                                         │
//! │  ┌──────────────────┐   agents, images, targets, temp files, locks  │
//! │  │ Cleanup          │   idempotent, first error wins                │
//! │  └──────────────────┘                                               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! When the network namespace must be configured between `create` and
//! `start`, the orchestrator runs in a re-executed copy of the binary (see
//! [`reexec`]) and the parent configures the network during a pipe
//! handshake.
//!
//! # Example
//!
//! ```rust,ignore
//! use magikbuild::{BuildContainer, Collaborators, EngineConfig, RunOptions, Runner};
//!
//! #[tokio::main]
//! async fn main() -> magikbuild::Result<()> {
//!     let runner = Runner::from_config(EngineConfig::from_env(), Collaborators::default())?;
//!     let container = BuildContainer {
//!         name: "build-1".into(),
//!         rootfs: "/var/lib/build/rootfs".into(),
//!         ..Default::default()
//!     };
//!     let report = runner
//!         .run(&container, RunOptions { args: vec!["make".into()], ..Default::default() })
//!         .await?;
//!     println!("exit code: {:?}", report.exit_code());
//!     Ok(())
//! }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("magikbuild drives Linux namespaces and only builds for Linux targets");

pub mod bundle;
pub mod cleanup;
pub mod collaborators;
pub mod config;
pub mod console;
pub mod constants;
pub mod error;
pub mod etc;
pub mod hooks;
pub mod logging;
pub mod mounts;
pub mod namespace;
pub mod orchestrator;
pub mod reexec;
pub mod relay;
pub mod run;
pub mod runtime;
pub mod runtimes;
pub mod spec;
pub mod sshagent;
pub mod sys;

// Re-exports
pub use bundle::Bundle;
pub use cleanup::RunMountArtifacts;
pub use collaborators::Collaborators;
pub use config::EngineConfig;
pub use error::{Error, Phase, Result};
pub use mounts::{MountAssembler, MountEntry, MountSources};
pub use namespace::{Isolation, NamespaceKind, NamespaceOption, NamespaceOptions, NamespacePlan, NetworkPolicy};
pub use orchestrator::{OrchestrateRequest, Orchestrator, RunOutcome, WaitStatus};
pub use relay::{RelayEndpoints, StdioRelay};
pub use run::{BuildContainer, RunOptions, RunReport, Runner};
pub use runtime::{ContainerState, ContainerStatus, OciRuntime, Signal};
pub use runtimes::CliRuntime;
pub use spec::OciSpec;
