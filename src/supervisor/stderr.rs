//! Peer error-stream drain.
//!
//! The peer's stderr is unstructured text. It is drained continuously so
//! the peer never blocks on a full pipe, each line is handed to an optional
//! observer, and the last few lines are kept for abort messages. A line
//! containing one of the configured fatal markers aborts the session.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

use crate::errors::{AbortCause, AbortKind};
use crate::rpc::RpcSession;

/// Markers the peer runtime prints when it has crashed.
pub const DEFAULT_FATAL_MARKERS: &[&str] = &["RuntimeError:", "memory access out of bounds"];

/// Lines kept in the stderr tail by default.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Callback for each stderr line, without its trailing newline.
pub type LineObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Shared view of the most recent stderr lines.
#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrTail {
    /// Empty tail keeping at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot of the kept lines, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Most recent non-empty line.
    #[must_use]
    pub fn last_line(&self) -> Option<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }
}

/// Return the first marker contained in `line`.
#[must_use]
pub fn find_fatal_marker<'a>(line: &str, markers: &'a [String]) -> Option<&'a str> {
    markers
        .iter()
        .map(String::as_str)
        .find(|marker| !marker.is_empty() && line.contains(marker))
}

/// Spawn the drain task for `stderr`.
///
/// Runs until the stream ends. After a fatal marker the session is aborted
/// with [`AbortKind::FatalDiagnostic`] and the drain keeps going so the
/// peer's remaining output still reaches the observer and the tail.
pub fn spawn_stderr_drain<R>(
    stderr: R,
    session: RpcSession,
    markers: Vec<String>,
    tail: StderrTail,
    observer: Option<LineObserver>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let span = info_span!("stderr_drain", session_id = %session.session_id());
    tokio::spawn(
        async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => {
                        debug!("peer stderr closed");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "failed to read peer stderr");
                        break;
                    }
                }

                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_owned();
                if let Some(observer) = &observer {
                    observer(&line);
                }
                if line.trim().is_empty() {
                    continue;
                }

                if let Some(marker) = find_fatal_marker(&line, &markers) {
                    warn!(marker, line = %line, "fatal marker on peer stderr");
                    session.abort(AbortCause::new(
                        AbortKind::FatalDiagnostic,
                        format!("peer reported a fatal error: {line}"),
                    ));
                }
                tail.push(line);
            }
        }
        .instrument(span),
    )
}
