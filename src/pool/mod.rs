//! Bounded worker-pool runner.
//!
//! [`run`] executes independent [`WorkUnit`]s with at most `jobs` in
//! flight. Workers share an atomic cursor: each claims the next index with
//! `fetch_add`, so every unit is claimed exactly once, runs it, appends its
//! [`WorkResult`], and loops until the cursor passes the end.
//!
//! A unit's failure is data. Non-zero exits, spawn errors, per-unit
//! timeouts, and even executor panics all become a result; nothing a unit
//! does can cancel its siblings or fail the run.

pub mod discover;
pub mod executor;

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

use crate::supervisor::ExitOutcome;

pub use executor::{ProcessExecutor, UnitExecutor, UnitOutput};

/// Default worker count when nothing else is configured.
pub const DEFAULT_JOBS: usize = 8;

/// One independent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// Stable identity used to order results (typically a file path).
    pub key: String,
    /// Program to run.
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Bytes written to the unit's stdin, if any.
    pub stdin: Option<Vec<u8>>,
    /// Working directory; inherits the caller's when `None`.
    pub cwd: Option<PathBuf>,
}

impl WorkUnit {
    /// Unit running `program args..` keyed by `key`.
    pub fn new<I, S>(key: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            cwd: None,
        }
    }

    /// Attach bytes to feed on stdin.
    #[must_use]
    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// Outcome class of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitStatus {
    /// Exit code 0.
    Passed,
    /// Exit code 1: the unit ran and reported failure.
    Failed,
    /// Any other exit, a signal, a timeout, or a unit that never ran.
    Crashed,
}

impl UnitStatus {
    /// Classify an exit outcome.
    #[must_use]
    pub fn classify(exit: &ExitOutcome) -> Self {
        match exit.code {
            Some(0) => Self::Passed,
            Some(1) => Self::Failed,
            _ => Self::Crashed,
        }
    }

    /// Bracketed progress tag.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Passed => "[PASS]",
            Self::Failed => "[FAIL]",
            Self::Crashed => "[CRASH]",
        }
    }
}

impl Display for UnitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Crashed => "crashed",
        })
    }
}

/// Result of one unit. Exactly one is produced per submitted unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkResult {
    /// Key of the unit this result belongs to.
    pub key: String,
    /// Outcome class.
    pub status: UnitStatus,
    /// Raw exit outcome.
    pub exit: ExitOutcome,
    /// Wall-clock start of the unit.
    pub started_at: DateTime<Utc>,
    /// Time from claim to completion.
    pub duration: Duration,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error, or the reason the unit did not complete.
    pub stderr: String,
}

impl WorkResult {
    /// Standard output followed by standard error.
    #[must_use]
    pub fn output(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Pass / fail / crash counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    /// Units that passed.
    pub passed: usize,
    /// Units that failed.
    pub failed: usize,
    /// Units that crashed.
    pub crashed: usize,
}

/// Everything a pool run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// One result per unit, sorted by key, then by submission order.
    pub results: Vec<WorkResult>,
    /// Wall time of the whole run.
    pub elapsed: Duration,
    /// Worker count actually used.
    pub workers: usize,
}

impl RunReport {
    /// Count results by status.
    #[must_use]
    pub fn tally(&self) -> Tally {
        self.results
            .iter()
            .fold(Tally::default(), |mut tally, r| {
                match r.status {
                    UnitStatus::Passed => tally.passed += 1,
                    UnitStatus::Failed => tally.failed += 1,
                    UnitStatus::Crashed => tally.crashed += 1,
                }
                tally
            })
    }

    /// Results that did not pass, in key order.
    pub fn failures(&self) -> impl Iterator<Item = &WorkResult> {
        self.results
            .iter()
            .filter(|r| r.status != UnitStatus::Passed)
    }

    /// Process exit code for a CLI: 0 when everything passed, else 1.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(self.failures().next().is_some())
    }
}

/// Pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Concurrency ceiling; values below 1 are treated as 1.
    pub jobs: usize,
    /// Per-unit deadline; a unit past it is dropped (and killed) and
    /// recorded as crashed.
    pub unit_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            jobs: DEFAULT_JOBS,
            unit_timeout: None,
        }
    }
}

/// Run every unit through `executor` with at most `options.jobs` in flight.
///
/// Returns exactly one result per unit, ordered by [`WorkUnit::key`] and
/// then by submission order.
pub async fn run(
    units: Vec<WorkUnit>,
    options: PoolOptions,
    executor: Arc<dyn UnitExecutor>,
) -> RunReport {
    let started = Instant::now();
    let units: Arc<[WorkUnit]> = units.into();
    let workers = options.jobs.max(1).min(units.len());
    let cursor = Arc::new(AtomicUsize::new(0));
    let results = Arc::new(Mutex::new(Vec::with_capacity(units.len())));

    info!(units = units.len(), workers, "pool run starting");

    let mut set = JoinSet::new();
    for worker in 0..workers {
        let units = Arc::clone(&units);
        let cursor = Arc::clone(&cursor);
        let results = Arc::clone(&results);
        let executor = Arc::clone(&executor);
        set.spawn(
            async move {
                loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(unit) = units.get(index) else {
                        break;
                    };
                    let result = run_unit(unit, executor.as_ref(), options.unit_timeout).await;
                    info!(
                        unit = %result.key,
                        status = %result.status,
                        duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
                        "{} {} ({:.2}s)",
                        result.status.tag(),
                        result.key,
                        result.duration.as_secs_f64()
                    );
                    results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((index, result));
                }
            }
            .instrument(info_span!("pool_worker", worker)),
        );
    }

    while let Some(joined) = set.join_next().await {
        if let Err(err) = joined {
            // run_unit catches unit panics, so this is a bug in the loop itself.
            warn!(%err, "pool worker ended abnormally");
        }
    }

    let mut results = std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));
    // Submission order breaks ties between equal keys.
    results.sort_by(|(ia, a), (ib, b)| a.key.cmp(&b.key).then(ia.cmp(ib)));
    let results = results.into_iter().map(|(_, result)| result).collect();

    RunReport {
        results,
        elapsed: started.elapsed(),
        workers,
    }
}

/// Run one unit and convert every possible ending into a [`WorkResult`].
async fn run_unit(
    unit: &WorkUnit,
    executor: &dyn UnitExecutor,
    timeout: Option<Duration>,
) -> WorkResult {
    let started_at = Utc::now();
    let clock = Instant::now();

    let guarded = std::panic::AssertUnwindSafe(executor.execute(unit)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(done) => done,
            Err(_) => Ok(Err(crate::AppError::Timeout {
                method: format!("unit {}", unit.key),
                after: limit,
            })),
        },
        None => guarded.await,
    };

    let (status, exit, stdout, stderr) = match outcome {
        Ok(Ok(output)) => (
            UnitStatus::classify(&output.exit),
            output.exit,
            output.stdout,
            output.stderr,
        ),
        Ok(Err(err)) => (
            UnitStatus::Crashed,
            ExitOutcome::unknown(),
            String::new(),
            err.to_string(),
        ),
        Err(_panic) => (
            UnitStatus::Crashed,
            ExitOutcome::unknown(),
            String::new(),
            "unit executor panicked".to_owned(),
        ),
    };

    WorkResult {
        key: unit.key.clone(),
        status,
        exit,
        started_at,
        duration: clock.elapsed(),
        stdout,
        stderr,
    }
}
