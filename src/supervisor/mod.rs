//! Peer process supervision.
//!
//! [`PeerProcess`] ties a spawned peer to an [`RpcSession`]:
//!
//! 1. spawns the peer with piped stdio (`spawner`),
//! 2. starts the session over its stdin/stdout,
//! 3. drains stderr and watches for fatal markers (`stderr`),
//! 4. watches for exit and turns any exit into a session abort, so no
//!    caller waits on a dead peer.
//!
//! An exit during [`PeerProcess::shutdown`] aborts with
//! [`AbortKind::Shutdown`]; any other exit aborts with
//! [`AbortKind::ProcessExit`] and the last stderr line.

pub mod exit;
pub mod spawner;
pub mod stderr;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::errors::{AbortCause, AbortKind};
use crate::rpc::{RequestTimeouts, RpcSession, SessionOptions};
use crate::{AppError, Result};

pub use exit::ExitOutcome;
pub use spawner::{spawn_peer, PeerSpec, SpawnedPeer};
pub use stderr::{LineObserver, StderrTail};

/// Default time a peer gets to exit after the shutdown sequence.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Supervision settings.
#[derive(Clone)]
pub struct SupervisorOptions {
    /// Request deadlines for the session.
    pub timeouts: RequestTimeouts,
    /// How long to wait for exit before killing the peer.
    pub shutdown_grace: Duration,
    /// Substrings on stderr that mean the peer has crashed.
    pub fatal_markers: Vec<String>,
    /// Number of stderr lines kept for diagnostics.
    pub stderr_tail_lines: usize,
    /// Optional callback for every stderr line.
    pub stderr_observer: Option<LineObserver>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            timeouts: RequestTimeouts::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            fatal_markers: stderr::DEFAULT_FATAL_MARKERS
                .iter()
                .map(|&m| m.to_owned())
                .collect(),
            stderr_tail_lines: stderr::DEFAULT_TAIL_LINES,
            stderr_observer: None,
        }
    }
}

impl std::fmt::Debug for SupervisorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorOptions")
            .field("timeouts", &self.timeouts)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("fatal_markers", &self.fatal_markers)
            .field("stderr_tail_lines", &self.stderr_tail_lines)
            .field("stderr_observer", &self.stderr_observer.is_some())
            .finish()
    }
}

/// A supervised peer process and its RPC session.
#[derive(Debug)]
pub struct PeerProcess {
    session: RpcSession,
    tail: StderrTail,
    pid: Option<u32>,
    shutting_down: Arc<AtomicBool>,
    kill: CancellationToken,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    shutdown_grace: Duration,
}

impl PeerProcess {
    /// Spawn the peer and start supervising it.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if the process cannot be launched.
    pub fn launch(spec: &PeerSpec, options: SupervisorOptions) -> Result<Self> {
        let SpawnedPeer {
            child,
            stdin,
            stdout,
            stderr,
        } = spawn_peer(spec)?;
        let pid = child.id();

        let session = RpcSession::start(
            stdout,
            stdin,
            SessionOptions {
                timeouts: options.timeouts,
                abort_on_eof: false,
            },
        );

        let tail = StderrTail::new(options.stderr_tail_lines);
        // Detached: the drain ends on its own when the peer's stderr closes.
        let _drain = stderr::spawn_stderr_drain(
            stderr,
            session.clone(),
            options.fatal_markers,
            tail.clone(),
            options.stderr_observer,
        );

        let shutting_down = Arc::new(AtomicBool::new(false));
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        let span = info_span!("exit_monitor", session_id = %session.session_id(), pid = pid.unwrap_or(0));
        tokio::spawn(
            monitor_exit(
                child,
                session.clone(),
                tail.clone(),
                Arc::clone(&shutting_down),
                kill.clone(),
                exit_tx,
            )
            .instrument(span),
        );

        Ok(Self {
            session,
            tail,
            pid,
            shutting_down,
            kill,
            exit_rx,
            shutdown_grace: options.shutdown_grace,
        })
    }

    /// The session talking to this peer.
    #[must_use]
    pub fn session(&self) -> &RpcSession {
        &self.session
    }

    /// OS process id, if the peer was still running at launch.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Recent stderr lines.
    #[must_use]
    pub fn stderr_tail(&self) -> &StderrTail {
        &self.tail
    }

    /// Exit outcome if the peer has already exited.
    #[must_use]
    pub fn try_exit(&self) -> Option<ExitOutcome> {
        *self.exit_rx.borrow()
    }

    /// Wait for the peer to exit.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the exit monitor stopped without
    /// reporting an outcome.
    pub async fn wait_exit(&self) -> Result<ExitOutcome> {
        let mut rx = self.exit_rx.clone();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| AppError::Io("exit monitor stopped without an outcome".into()))?;
        Ok((*outcome).unwrap_or_else(ExitOutcome::unknown))
    }

    /// Kill the peer without the shutdown sequence.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Graceful shutdown.
    ///
    /// Sends the `shutdown` request and the `exit` notification, closes the
    /// peer's input, then waits up to the grace period before killing it.
    /// Failures of the individual steps are logged and do not stop the
    /// sequence.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if no exit outcome could be collected.
    pub async fn shutdown(&self) -> Result<ExitOutcome> {
        self.shutting_down.store(true, Ordering::SeqCst);

        if self.session.is_aborted() {
            debug!("session already terminal, skipping shutdown handshake");
        } else {
            if let Err(err) = self
                .session
                .request_with_timeout("shutdown", None, self.shutdown_grace)
                .await
            {
                debug!(error = %err, "shutdown request failed");
            }
            // A peer that stopped reading leaves an earlier write holding
            // its input; these steps must not outlive the grace period.
            match tokio::time::timeout(self.shutdown_grace, self.session.notify("exit", None)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %err, "exit notification failed"),
                Err(_) => debug!("exit notification stalled"),
            }
        }
        match tokio::time::timeout(self.shutdown_grace, self.session.close_input()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "closing peer input failed"),
            Err(_) => debug!("closing peer input stalled"),
        }

        if let Ok(outcome) = tokio::time::timeout(self.shutdown_grace, self.wait_exit()).await {
            outcome
        } else {
            warn!(grace = ?self.shutdown_grace, "peer did not exit in time, killing");
            self.kill();
            self.wait_exit().await
        }
    }
}

/// Await the child's exit (or a kill request), publish the outcome, and
/// abort the session with the matching cause.
async fn monitor_exit(
    mut child: Child,
    session: RpcSession,
    tail: StderrTail,
    shutting_down: Arc<AtomicBool>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            if let Err(err) = child.start_kill() {
                warn!(%err, "failed to kill peer process");
            }
            child.wait().await
        }
    };

    let outcome = match status {
        Ok(status) => ExitOutcome::from(status),
        Err(err) => {
            warn!(%err, "error waiting for peer process");
            ExitOutcome::unknown()
        }
    };
    info!(%outcome, "peer process exited");
    exit_tx.send_replace(Some(outcome));

    let cause = if shutting_down.load(Ordering::SeqCst) {
        AbortCause::new(AbortKind::Shutdown, format!("peer shut down ({outcome})"))
    } else {
        let mut message = format!("peer {outcome}");
        if let Some(line) = tail.last_line() {
            message.push_str(&format!("; last stderr: {line}"));
        }
        AbortCause::new(AbortKind::ProcessExit, message)
    };
    session.abort(cause);
}
