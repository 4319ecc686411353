//! Error types shared across the harness.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared harness result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Where a session abort originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    /// The peer process exited without being asked to.
    ProcessExit,
    /// A fatal marker was seen on the peer's error stream.
    FatalDiagnostic,
    /// The peer closed its output stream.
    StreamClosed,
    /// A graceful shutdown sequence finished.
    Shutdown,
    /// A caller aborted the session directly.
    Explicit,
}

impl Display for AbortKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::ProcessExit => "process exit",
            Self::FatalDiagnostic => "fatal diagnostic",
            Self::StreamClosed => "stream closed",
            Self::Shutdown => "shutdown",
            Self::Explicit => "explicit abort",
        };
        f.write_str(label)
    }
}

/// Human-readable reason a session became terminal.
///
/// The same cause is handed to every pending request and every later
/// caller, so it is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortCause {
    /// Origin of the abort.
    pub kind: AbortKind,
    /// Diagnostic detail (exit code, stderr line, caller message).
    pub message: String,
}

impl AbortCause {
    /// Build a cause of the given kind.
    pub fn new(kind: AbortKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Cause for a caller-requested abort.
    pub fn explicit(message: impl Into<String>) -> Self {
        Self::new(AbortKind::Explicit, message)
    }
}

impl Display for AbortCause {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Harness error enumeration covering all failure modes.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Transport read or write failure.
    Io(String),
    /// Child process could not be launched.
    Spawn(String),
    /// Frame header could not be parsed.
    Framing(String),
    /// Frame body was not a valid JSON-RPC payload.
    Payload(String),
    /// No response arrived before the request deadline.
    Timeout {
        /// Method of the request that timed out.
        method: String,
        /// Deadline that elapsed.
        after: Duration,
    },
    /// The session is terminal; carries the first abort cause.
    SessionAborted(AbortCause),
    /// The peer answered with a JSON-RPC error object.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message supplied by the peer.
        message: String,
    },
    /// A settle window is already waiting.
    SettleBusy(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Framing(msg) => write!(f, "framing: {msg}"),
            Self::Payload(msg) => write!(f, "payload: {msg}"),
            Self::Timeout { method, after } => {
                write!(f, "timeout: waiting for {method} after {after:?}")
            }
            Self::SessionAborted(cause) => write!(f, "session aborted: {cause}"),
            Self::Rpc { code, message } => write!(f, "rpc: error {code}: {message}"),
            Self::SettleBusy(msg) => write!(f, "settle busy: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Payload(err.to_string())
    }
}
