//! Spec hooks: external programs that may rewrite `config.json` before
//! `create`.
//!
//! Hooks run in order. Each receives the current spec on stdin and prints
//! the spec to use on stdout; empty output leaves the spec unchanged.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;

/// One hook invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hook {
    pub path: PathBuf,
    /// Arguments, not including `argv[0]`.
    pub args: Vec<String>,
    /// `KEY=value` entries; the hook gets only these.
    pub env: Vec<String>,
    /// Per-hook limit in seconds.
    pub timeout: Option<u64>,
}

/// Runs `hooks` in order, threading the spec through them.
///
/// `deadline` bounds the whole chain in addition to each hook's timeout.
pub async fn run_hooks(hooks: &[Hook], spec: Vec<u8>, deadline: Option<Instant>) -> Result<Vec<u8>> {
    let mut current = spec;
    for hook in hooks {
        let limit = effective_timeout(hook, deadline).ok_or_else(|| Error::Hook {
            path: hook.path.clone(),
            reason: "deadline passed before the hook could run".to_string(),
        })?;
        if let Some(next) = run_hook(hook, &current, limit).await? {
            current = next;
        }
    }
    Ok(current)
}

fn effective_timeout(hook: &Hook, deadline: Option<Instant>) -> Option<Option<Duration>> {
    let own = hook.timeout.map(Duration::from_secs);
    match deadline {
        None => Some(own),
        Some(deadline) => {
            let remaining = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())?;
            Some(Some(own.map_or(remaining, |own| own.min(remaining))))
        }
    }
}

async fn run_hook(hook: &Hook, spec: &[u8], limit: Option<Duration>) -> Result<Option<Vec<u8>>> {
    let fail = |reason: String| Error::Hook {
        path: hook.path.clone(),
        reason,
    };

    let mut cmd = Command::new(&hook.path);
    cmd.args(&hook.args)
        .env_clear()
        .envs(hook.env.iter().filter_map(|e| e.split_once('=')))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(hook = %hook.path.display(), "running hook");
    let mut child = cmd.spawn().map_err(|e| fail(format!("spawn: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        let input = spec.to_vec();
        tokio::spawn(async move {
            // A hook that ignores its input closes the pipe early.
            if let Err(e) = stdin.write_all(&input).await {
                tracing::debug!(error = %e, "hook did not read the whole spec");
            }
        });
    }

    let output = match limit {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| fail(format!("timed out after {limit:?}")))?,
        None => child.wait_with_output().await,
    }
    .map_err(|e| fail(e.to_string()))?;

    if !output.status.success() {
        return Err(fail(format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    if output.stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice::<serde_json::Value>(&output.stdout)
        .map_err(|e| fail(format!("invalid spec on stdout: {e}")))?;
    Ok(Some(output.stdout))
}
