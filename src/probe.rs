//! Single-peer probe: handshake, optional document open, settle, shutdown.
//!
//! Drives one peer through the usual language-server opening sequence and
//! reports how long each phase took. Used by the `probe` subcommand.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{info, info_span, Instrument};

use crate::config::GlobalConfig;
use crate::rpc::RpcSession;
use crate::settle::{SettleSubject, SettleSummary, SettleTracker};
use crate::supervisor::{ExitOutcome, PeerProcess};
use crate::{AppError, Result};

/// Language id sent with `textDocument/didOpen` unless overridden.
pub const DEFAULT_LANGUAGE_ID: &str = "workman";

/// Notification whose burst decides when an opened document has settled.
pub const DIAGNOSTICS_METHOD: &str = "textDocument/publishDiagnostics";

/// What the probe should do after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    /// Document to open; when `None` the probe stops after the handshake.
    pub open: Option<PathBuf>,
    /// Language id for the opened document.
    pub language_id: String,
}

impl Default for ProbeRequest {
    fn default() -> Self {
        Self {
            open: None,
            language_id: DEFAULT_LANGUAGE_ID.to_owned(),
        }
    }
}

/// Measurements from one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    /// Round trip of the `initialize` request.
    pub initialize_time: Duration,
    /// `serverInfo.name` from the initialize result, if present.
    pub server_name: Option<String>,
    /// Diagnostics settle summary, when a document was opened.
    pub settle: Option<SettleSummary>,
    /// Peer exit after shutdown, when the probe owned the process.
    pub exit: Option<ExitOutcome>,
}

impl Display for ProbeReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "initialize: {}ms",
            self.initialize_time.as_millis()
        )?;
        if let Some(name) = &self.server_name {
            write!(f, " ({name})")?;
        }
        if let Some(settle) = &self.settle {
            write!(f, "\nsettle: {settle}")?;
        }
        if let Some(exit) = &self.exit {
            write!(f, "\nexit: {exit}")?;
        }
        Ok(())
    }
}

/// Launch the configured peer, probe it, and shut it down.
///
/// The peer is shut down even when the probe itself fails.
///
/// # Errors
///
/// Returns `AppError::Config` without a `[peer]` section, `AppError::Spawn`
/// if the peer cannot start, or whatever [`probe_session`] returns.
pub async fn run_probe(config: &GlobalConfig, request: &ProbeRequest) -> Result<ProbeReport> {
    let peer = config.require_peer()?;
    let process = PeerProcess::launch(&peer.spec(), config.supervisor_options())?;
    let tracker = SettleTracker::new(config.settle.settle_config());
    tracker.attach(process.session());

    let root = std::env::current_dir()?;
    let span = info_span!("probe", session_id = %process.session().session_id());
    let probed = probe_session(process.session(), &tracker, &root, request)
        .instrument(span)
        .await;

    let exit = process.shutdown().await;
    let mut report = probed?;
    report.exit = exit.ok();
    Ok(report)
}

/// Run the probe sequence over an already started session.
///
/// `tracker` must already receive the session's notifications.
///
/// # Errors
///
/// Returns the first request or notification failure, `AppError::Io` if the
/// document cannot be read, or `AppError::SessionAborted` if the peer dies
/// while diagnostics are settling.
pub async fn probe_session(
    session: &RpcSession,
    tracker: &SettleTracker,
    root: &Path,
    request: &ProbeRequest,
) -> Result<ProbeReport> {
    let started = Instant::now();
    let init = session
        .request(
            "initialize",
            Some(json!({
                "processId": std::process::id(),
                "rootUri": file_uri(root),
                "capabilities": {},
            })),
        )
        .await?;
    let initialize_time = started.elapsed();
    let server_name = init
        .pointer("/serverInfo/name")
        .and_then(Value::as_str)
        .map(str::to_owned);
    info!(
        initialize_ms = u64::try_from(initialize_time.as_millis()).unwrap_or(u64::MAX),
        "peer initialized"
    );
    session.notify("initialized", Some(json!({}))).await?;

    let settle = match &request.open {
        Some(path) => Some(open_and_settle(session, tracker, path, &request.language_id).await?),
        None => None,
    };

    Ok(ProbeReport {
        initialize_time,
        server_name,
        settle,
        exit: None,
    })
}

async fn open_and_settle(
    session: &RpcSession,
    tracker: &SettleTracker,
    path: &Path,
    language_id: &str,
) -> Result<SettleSummary> {
    let path = tokio::fs::canonicalize(path)
        .await
        .map_err(|err| AppError::Io(format!("cannot open {}: {err}", path.display())))?;
    let text = tokio::fs::read_to_string(&path).await?;
    let uri = file_uri(&path);

    let wait = tracker.arm(SettleSubject::method(DIAGNOSTICS_METHOD).with_param("uri", uri.clone()))?;
    session
        .notify(
            "textDocument/didOpen",
            Some(json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": language_id,
                    "version": 1,
                    "text": text,
                }
            })),
        )
        .await?;

    tokio::select! {
        summary = wait.settled() => {
            info!(%summary, "diagnostics settled");
            Ok(summary)
        }
        cause = session.aborted() => Err(AppError::SessionAborted(cause)),
    }
}

/// `file://` URI for an absolute path.
#[must_use]
pub fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}
