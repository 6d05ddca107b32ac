//! magikbuild - run a command in a build container
//!
//! Reads a JSON run request and runs it through an OCI runtime, exiting with
//! the container's exit code.
//!
//! ## Usage
//!
//! ```sh
//! magikbuild run <request.json> [--runtime <path>]
//! magikbuild version
//! ```
//!
//! The request document:
//!
//! ```json
//! {
//!   "config":    { "runtime": "/usr/bin/crun" },
//!   "container": { "name": "build-1", "rootfs": "/var/lib/build/rootfs" },
//!   "options":   { "args": ["make", "install"] }
//! }
//! ```
//!
//! `config` is optional and defaults to the environment (`MAGIKBUILD_*`).
//! Verbosity is taken from `LOGLEVEL`.

use anyhow::{Context, bail};
use magikbuild::reexec::Registry;
use magikbuild::{BuildContainer, Collaborators, EngineConfig, RunOptions, Runner, logging};
use serde::Deserialize;
use std::path::PathBuf;
use std::process::ExitCode;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Run {
        request: PathBuf,
        runtime: Option<PathBuf>,
    },
    Version,
    Help,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let Some(sub) = args.get(1) else {
        return Ok(Command::Help);
    };
    match sub.as_str() {
        "run" => {
            let mut request = None;
            let mut runtime = None;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--runtime" | "-r" => {
                        let value = args.get(i + 1).ok_or("--runtime requires a path")?;
                        runtime = Some(PathBuf::from(value));
                        i += 2;
                    }
                    other if other.starts_with('-') => return Err(format!("unknown option '{other}'")),
                    other => {
                        if request.replace(PathBuf::from(other)).is_some() {
                            return Err("run takes a single request file".to_string());
                        }
                        i += 1;
                    }
                }
            }
            let request = request.ok_or("run requires <request.json>")?;
            Ok(Command::Run { request, runtime })
        }
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command '{other}'")),
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Deserialize)]
struct RunRequest {
    #[serde(default)]
    config: Option<EngineConfig>,
    container: BuildContainer,
    #[serde(default)]
    options: RunOptions,
}

async fn cmd_run(request: PathBuf, runtime: Option<PathBuf>) -> anyhow::Result<u8> {
    let data = std::fs::read(&request).with_context(|| format!("reading {}", request.display()))?;
    let RunRequest {
        config,
        container,
        options,
    } = serde_json::from_slice(&data).with_context(|| format!("parsing {}", request.display()))?;
    if options.args.is_empty() {
        bail!("request has no command to run");
    }

    let mut config = config.unwrap_or_else(EngineConfig::from_env);
    if let Some(runtime) = runtime {
        config = config.with_runtime(runtime);
    }
    let runner = Runner::from_config(config, Collaborators::default())?;
    let report = runner.run(&container, options).await?;
    let code = report.exit_code().unwrap_or(1);
    Ok(u8::try_from(code).unwrap_or(1))
}

fn cmd_version() {
    println!("magikbuild version {}", env!("CARGO_PKG_VERSION"));
    println!("spec: {}", magikbuild::constants::OCI_VERSION);
}

fn cmd_help() {
    println!("magikbuild - run commands in build containers");
    println!();
    println!("USAGE:");
    println!("    magikbuild run <request.json> [--runtime <path>]");
    println!("    magikbuild version");
    println!("    magikbuild help");
    println!();
    println!("ENVIRONMENT:");
    println!("    LOGLEVEL             error|warn|info|debug|trace or 0-6");
    println!("    MAGIKBUILD_RUNTIME   OCI runtime binary (default: crun, then runc)");
    println!("    MAGIKBUILD_TMPDIR    directory for per-run bundles");
}

fn main() -> ExitCode {
    if let Some(code) = Registry::with_defaults().dispatch() {
        return ExitCode::from(u8::try_from(code).unwrap_or(1));
    }

    let args: Vec<String> = std::env::args().collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {e}");
            cmd_help();
            return ExitCode::FAILURE;
        }
    };

    match command {
        Command::Version => {
            cmd_version();
            ExitCode::SUCCESS
        }
        Command::Help => {
            cmd_help();
            ExitCode::SUCCESS
        }
        Command::Run { request, runtime } => {
            logging::init();
            let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("error: failed to start async runtime: {e}");
                    return ExitCode::FAILURE;
                }
            };
            match rt.block_on(cmd_run(request, runtime)) {
                Ok(code) => ExitCode::from(code),
                Err(e) => {
                    eprintln!("error: {e:#}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
