//! Pure settle-window state machine.
//!
//! A [`SettleWindow`] never reads a clock. Every transition takes the
//! current [`Instant`] as an argument, which keeps the "quiet period vs.
//! hard deadline" race testable with synthetic timestamps.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

/// Default quiet period after the last matching event.
pub const DEFAULT_QUIET: Duration = Duration::from_millis(400);

/// Default hard deadline measured from the trigger.
pub const DEFAULT_HARD_DEADLINE: Duration = Duration::from_secs(15);

/// Timer settings for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleConfig {
    /// Silence after the last matching event that counts as settled.
    pub quiet: Duration,
    /// Upper bound on the whole window.
    pub hard_deadline: Duration,
    /// Silence before the first event that counts as settled; when `None`
    /// only the hard deadline applies until an event arrives.
    pub initial_quiet: Option<Duration>,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            quiet: DEFAULT_QUIET,
            hard_deadline: DEFAULT_HARD_DEADLINE,
            initial_quiet: None,
        }
    }
}

/// Which timer ended the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleReason {
    /// The quiet period elapsed.
    Quiet,
    /// The hard deadline elapsed first.
    Deadline,
}

/// Single record produced when a window settles.
#[derive(Debug, Clone, PartialEq)]
pub struct SettleSummary {
    /// Trigger to first matching event; `None` if nothing was observed.
    pub time_to_first_event: Option<Duration>,
    /// Trigger to settlement.
    pub time_to_settle: Duration,
    /// Matching events observed.
    pub event_count: u64,
    /// Parameters of the last matching event.
    pub last_payload: Option<Value>,
    /// Timer that fired.
    pub reason: SettleReason,
}

impl Display for SettleSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.time_to_first_event {
            Some(first) => write!(f, "first_event={}ms", first.as_millis())?,
            None => f.write_str("first_event=none")?,
        }
        write!(
            f,
            " settled={}ms events={} reason={}",
            self.time_to_settle.as_millis(),
            self.event_count,
            match self.reason {
                SettleReason::Quiet => "quiet",
                SettleReason::Deadline => "deadline",
            }
        )
    }
}

/// Mutable record of one trigger's notification burst.
#[derive(Debug, Clone)]
pub struct SettleWindow {
    config: SettleConfig,
    started_at: Instant,
    first_event_at: Option<Instant>,
    last_event_at: Option<Instant>,
    event_count: u64,
    last_payload: Option<Value>,
}

impl SettleWindow {
    /// Open a window for a trigger issued at `now`; the hard timer starts here.
    #[must_use]
    pub fn open(config: SettleConfig, now: Instant) -> Self {
        Self {
            config,
            started_at: now,
            first_event_at: None,
            last_event_at: None,
            event_count: 0,
            last_payload: None,
        }
    }

    /// Record a matching event seen at `now`.
    ///
    /// Returns `false` and changes nothing if a timer had already fired by
    /// `now`; an event cannot revive a window that is due to settle.
    pub fn observe(&mut self, now: Instant, payload: Option<Value>) -> bool {
        if self.poll(now).is_some() {
            return false;
        }
        self.first_event_at.get_or_insert(now);
        self.last_event_at = Some(now);
        self.event_count += 1;
        self.last_payload = payload;
        true
    }

    /// Instant the hard timer fires.
    #[must_use]
    pub fn hard_deadline(&self) -> Instant {
        self.started_at + self.config.hard_deadline
    }

    /// Instant the quiet timer fires, if it is running.
    #[must_use]
    pub fn quiet_deadline(&self) -> Option<Instant> {
        match self.last_event_at {
            Some(last) => Some(last + self.config.quiet),
            None => self.config.initial_quiet.map(|q| self.started_at + q),
        }
    }

    /// Earliest instant at which [`poll`](Self::poll) can report settlement.
    #[must_use]
    pub fn next_deadline(&self) -> Instant {
        let hard = self.hard_deadline();
        self.quiet_deadline().map_or(hard, |quiet| quiet.min(hard))
    }

    /// Which timer, if any, has fired by `now`. Ties go to the quiet timer.
    #[must_use]
    pub fn poll(&self, now: Instant) -> Option<SettleReason> {
        let hard = self.hard_deadline();
        match self.quiet_deadline() {
            Some(quiet) if quiet <= now && quiet <= hard => Some(SettleReason::Quiet),
            _ if hard <= now => Some(SettleReason::Deadline),
            _ => None,
        }
    }

    /// Close the window and build its summary.
    ///
    /// The settle time is the instant the firing timer was due, not `now`,
    /// so a late wake-up does not skew the measurement.
    #[must_use]
    pub fn finish(self, reason: SettleReason) -> SettleSummary {
        let settled_at = match reason {
            SettleReason::Quiet => self.quiet_deadline().unwrap_or_else(|| self.hard_deadline()),
            SettleReason::Deadline => self.hard_deadline(),
        };
        SettleSummary {
            time_to_first_event: self.first_event_at.map(|t| t - self.started_at),
            time_to_settle: settled_at - self.started_at,
            event_count: self.event_count,
            last_payload: self.last_payload,
            reason,
        }
    }
}
