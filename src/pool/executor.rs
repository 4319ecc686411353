//! Unit execution backends.
//!
//! The pool only needs "run this unit, tell me how it ended". The
//! [`UnitExecutor`] trait is that seam; [`ProcessExecutor`] is the real
//! implementation that runs one child process per unit.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::pool::WorkUnit;
use crate::supervisor::ExitOutcome;
use crate::{AppError, Result};

/// Captured result of running one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutput {
    /// How the unit ended.
    pub exit: ExitOutcome,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// Runs a single [`WorkUnit`] to completion.
///
/// Implementations must not assume anything about sibling units; the pool
/// may call `execute` from several tasks at once.
pub trait UnitExecutor: Send + Sync {
    /// Execute `unit` and capture its outcome.
    ///
    /// An `Err` means the unit could not be run at all (e.g. spawn failure);
    /// the pool records it as a crash.
    fn execute<'a>(
        &'a self,
        unit: &'a WorkUnit,
    ) -> Pin<Box<dyn Future<Output = Result<UnitOutput>> + Send + 'a>>;
}

/// Runs each unit as a child process with captured output.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

impl UnitExecutor for ProcessExecutor {
    fn execute<'a>(
        &'a self,
        unit: &'a WorkUnit,
    ) -> Pin<Box<dyn Future<Output = Result<UnitOutput>> + Send + 'a>> {
        Box::pin(run_process(unit))
    }
}

async fn run_process(unit: &WorkUnit) -> Result<UnitOutput> {
    let mut cmd = Command::new(&unit.program);
    cmd.args(&unit.args)
        .stdin(if unit.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &unit.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn {}: {err}", unit.program)))?;

    // Input is fed while output drains; a unit that writes before it reads
    // would otherwise block on a full pipe.
    let stdin = child.stdin.take();
    let feed = async move {
        if let (Some(input), Some(mut stdin)) = (&unit.stdin, stdin) {
            // A unit that exits without reading its input is not an error here.
            if let Err(err) = stdin.write_all(input).await {
                debug!(unit = %unit.key, error = %err, "unit closed stdin early");
            }
        }
    };
    let ((), output) = tokio::join!(feed, child.wait_with_output());
    let output = output?;
    Ok(UnitOutput {
        exit: ExitOutcome::from(output.status),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
