//! Peer process spawner.
//!
//! Launches the peer with all three standard streams piped and
//! `kill_on_drop(true)` so a dropped supervisor never leaks a process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::info;

use crate::{AppError, Result};

/// What to launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSpec {
    /// Program to run.
    pub command: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Working directory; inherits the caller's when `None`.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables layered over the inherited environment.
    pub env: HashMap<String, String>,
}

impl PeerSpec {
    /// Spec for `command` with `args` and nothing else.
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// A freshly spawned peer with its streams detached from the [`Child`].
#[derive(Debug)]
pub struct SpawnedPeer {
    /// Process handle; keep it alive so `kill_on_drop` applies.
    pub child: Child,
    /// Peer input.
    pub stdin: ChildStdin,
    /// Peer protocol output.
    pub stdout: ChildStdout,
    /// Peer diagnostic output.
    pub stderr: ChildStderr,
}

/// Spawn the peer described by `spec`.
///
/// # Errors
///
/// - `AppError::Spawn("failed to spawn peer: …")` — OS spawn failure.
/// - `AppError::Spawn("failed to capture peer …")` — a pipe was not created.
pub fn spawn_peer(spec: &PeerSpec) -> Result<SpawnedPeer> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn peer {}: {err}", spec.command)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture peer stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture peer stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture peer stderr".into()))?;

    info!(
        command = %spec.command,
        pid = child.id().unwrap_or(0),
        "peer process spawned"
    );

    Ok(SpawnedPeer {
        child,
        stdin,
        stdout,
        stderr,
    })
}
