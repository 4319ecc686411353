//! Harness configuration parsing and validation.
//!
//! Every section is optional; an empty file yields a usable configuration.
//!
//! ```toml
//! [peer]
//! command = "grain"
//! args = ["--dir", ".", "src/cli/lsp/lsp.gr"]
//! fatal_markers = ["RuntimeError:"]
//!
//! [timeouts]
//! request_ms = 15000
//! shutdown_grace_ms = 2000
//!
//! [timeouts.methods]
//! initialize = 45000
//!
//! [settle]
//! quiet_ms = 400
//! hard_deadline_ms = 15000
//!
//! [pool]
//! jobs = 8
//! command = "grain"
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::pool::discover::DEFAULT_SUFFIXES;
use crate::pool::{PoolOptions, DEFAULT_JOBS};
use crate::rpc::RequestTimeouts;
use crate::settle::SettleConfig;
use crate::supervisor::stderr::{DEFAULT_FATAL_MARKERS, DEFAULT_TAIL_LINES};
use crate::supervisor::{PeerSpec, SupervisorOptions};
use crate::{AppError, Result};

/// Environment variable overriding the default pool size.
pub const JOBS_ENV_VAR: &str = "PEER_HARNESS_JOBS";

/// How to launch the JSON-RPC peer.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PeerConfig {
    /// Program to run.
    pub command: String,
    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for the peer.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Stderr substrings that mean the peer crashed.
    #[serde(default = "default_fatal_markers")]
    pub fatal_markers: Vec<String>,
    /// Stderr lines kept for diagnostics.
    #[serde(default = "default_tail_lines")]
    pub stderr_tail_lines: usize,
}

fn default_fatal_markers() -> Vec<String> {
    DEFAULT_FATAL_MARKERS.iter().map(|&m| m.to_owned()).collect()
}

fn default_tail_lines() -> usize {
    DEFAULT_TAIL_LINES
}

impl PeerConfig {
    /// Launch description for the spawner.
    #[must_use]
    pub fn spec(&self) -> PeerSpec {
        PeerSpec {
            command: self.command.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        }
    }
}

/// Request and shutdown deadlines, in milliseconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Deadline for requests without an override.
    #[serde(default = "default_request_ms")]
    pub request_ms: u64,
    /// Per-method overrides.
    #[serde(default = "default_method_overrides")]
    pub methods: HashMap<String, u64>,
    /// Time the peer gets to exit after the shutdown sequence.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_request_ms() -> u64 {
    15_000
}

fn default_method_overrides() -> HashMap<String, u64> {
    HashMap::from([("initialize".to_owned(), 45_000)])
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: default_request_ms(),
            methods: default_method_overrides(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Deadline policy for sessions.
    #[must_use]
    pub fn request_timeouts(&self) -> RequestTimeouts {
        self.methods.iter().fold(
            RequestTimeouts::new(Duration::from_millis(self.request_ms)),
            |policy, (method, ms)| policy.with_override(method.as_str(), Duration::from_millis(*ms)),
        )
    }
}

/// Settle tracker timers, in milliseconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SettleSection {
    /// Quiet period after the last matching notification.
    #[serde(default = "default_quiet_ms")]
    pub quiet_ms: u64,
    /// Hard deadline from the trigger.
    #[serde(default = "default_hard_deadline_ms")]
    pub hard_deadline_ms: u64,
    /// Quiet period before the first notification.
    #[serde(default)]
    pub initial_quiet_ms: Option<u64>,
}

fn default_quiet_ms() -> u64 {
    400
}

fn default_hard_deadline_ms() -> u64 {
    15_000
}

impl Default for SettleSection {
    fn default() -> Self {
        Self {
            quiet_ms: default_quiet_ms(),
            hard_deadline_ms: default_hard_deadline_ms(),
            initial_quiet_ms: None,
        }
    }
}

impl SettleSection {
    /// Timer settings for the tracker.
    #[must_use]
    pub fn settle_config(&self) -> SettleConfig {
        SettleConfig {
            quiet: Duration::from_millis(self.quiet_ms),
            hard_deadline: Duration::from_millis(self.hard_deadline_ms),
            initial_quiet: self.initial_quiet_ms.map(Duration::from_millis),
        }
    }
}

/// Worker-pool settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PoolConfig {
    /// Concurrency ceiling.
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    /// Program each unit runs; the unit's file is appended to `args`.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments placed before the unit's file.
    #[serde(default)]
    pub args: Vec<String>,
    /// File suffixes that identify units during discovery.
    #[serde(default = "default_suffixes")]
    pub suffixes: Vec<String>,
    /// Per-unit deadline.
    #[serde(default)]
    pub unit_timeout_ms: Option<u64>,
}

/// Pool size from [`JOBS_ENV_VAR`], falling back to [`DEFAULT_JOBS`].
fn default_jobs() -> usize {
    std::env::var(JOBS_ENV_VAR)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(DEFAULT_JOBS)
}

fn default_suffixes() -> Vec<String> {
    DEFAULT_SUFFIXES.iter().map(|&s| s.to_owned()).collect()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            command: None,
            args: Vec::new(),
            suffixes: default_suffixes(),
            unit_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    /// Runner settings.
    #[must_use]
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            jobs: self.jobs,
            unit_timeout: self.unit_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Top-level configuration parsed from a TOML file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Peer launch settings; required by `probe`.
    #[serde(default)]
    pub peer: Option<PeerConfig>,
    /// Request and shutdown deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Settle tracker timers.
    #[serde(default)]
    pub settle: SettleSection,
    /// Worker-pool settings.
    #[serde(default)]
    pub pool: PoolConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Supervision settings derived from the peer and timeout sections.
    #[must_use]
    pub fn supervisor_options(&self) -> SupervisorOptions {
        let mut options = SupervisorOptions {
            timeouts: self.timeouts.request_timeouts(),
            shutdown_grace: Duration::from_millis(self.timeouts.shutdown_grace_ms),
            ..SupervisorOptions::default()
        };
        if let Some(peer) = &self.peer {
            options.fatal_markers.clone_from(&peer.fatal_markers);
            options.stderr_tail_lines = peer.stderr_tail_lines;
        }
        options
    }

    /// The peer section.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no `[peer]` section is configured.
    pub fn require_peer(&self) -> Result<&PeerConfig> {
        self.peer
            .as_ref()
            .ok_or_else(|| AppError::Config("a [peer] section is required".into()))
    }

    fn validate(&self) -> Result<()> {
        if let Some(peer) = &self.peer {
            if peer.command.trim().is_empty() {
                return Err(AppError::Config("peer.command must not be empty".into()));
            }
        }

        if self.timeouts.request_ms == 0 {
            return Err(AppError::Config(
                "timeouts.request_ms must be greater than zero".into(),
            ));
        }

        if self.settle.quiet_ms == 0 {
            return Err(AppError::Config(
                "settle.quiet_ms must be greater than zero".into(),
            ));
        }

        if self.settle.hard_deadline_ms < self.settle.quiet_ms {
            return Err(AppError::Config(
                "settle.hard_deadline_ms must not be shorter than settle.quiet_ms".into(),
            ));
        }

        if self.pool.jobs == 0 {
            return Err(AppError::Config(
                "pool.jobs must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
