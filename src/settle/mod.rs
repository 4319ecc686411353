//! Notification-driven settle tracking.
//!
//! After a triggering action (an edit, an open), a peer usually emits a
//! burst of notifications. The [`SettleTracker`] decides when that burst is
//! over: a quiet period with no matching notification, or a hard deadline,
//! whichever comes first.
//!
//! Phases:
//!
//! ```text
//! Armed --arm()--> Waiting --quiet or hard timer--> Settled --arm()--> Waiting
//! ```
//!
//! Arming while `Waiting` is rejected with [`AppError::SettleBusy`]; the
//! in-flight window is never overwritten. Dropping a [`SettleWait`] before
//! it settles cancels its window and returns the tracker to `Armed`.

pub mod window;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::rpc::{Notification, RpcSession};
use crate::{AppError, Result};

pub use window::{SettleConfig, SettleReason, SettleSummary, SettleWindow};

/// Which notifications count toward a window.
#[derive(Debug, Clone, PartialEq)]
pub struct SettleSubject {
    /// Notification method to track.
    pub method: String,
    /// Optional `params` field that must equal the given value.
    pub param: Option<(String, Value)>,
}

impl SettleSubject {
    /// Track every notification with `method`.
    pub fn method(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            param: None,
        }
    }

    /// Also require `params[field] == value`.
    #[must_use]
    pub fn with_param(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.param = Some((field.into(), value.into()));
        self
    }

    /// Whether `notification` belongs to this subject.
    #[must_use]
    pub fn matches(&self, notification: &Notification) -> bool {
        if notification.method != self.method {
            return false;
        }
        match &self.param {
            None => true,
            Some((field, expected)) => notification
                .params
                .as_ref()
                .and_then(|p| p.get(field))
                .is_some_and(|v| v == expected),
        }
    }
}

/// Tracker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlePhase {
    /// Ready for a trigger; nothing in flight.
    Armed,
    /// A window is open and collecting events.
    Waiting,
    /// The last window settled; ready for the next trigger.
    Settled,
}

struct TrackerState {
    phase: SettlePhase,
    generation: u64,
    subject: Option<SettleSubject>,
    window: Option<SettleWindow>,
}

struct Shared {
    config: SettleConfig,
    state: Mutex<TrackerState>,
    wake: Notify,
}

/// Shared settle tracker; clone it into a notification handler.
#[derive(Clone)]
pub struct SettleTracker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SettleTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettleTracker")
            .field("config", &self.shared.config)
            .field("phase", &self.phase())
            .finish()
    }
}

impl SettleTracker {
    /// New tracker in the `Armed` phase.
    #[must_use]
    pub fn new(config: SettleConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(TrackerState {
                    phase: SettlePhase::Armed,
                    generation: 0,
                    subject: None,
                    window: None,
                }),
                wake: Notify::new(),
            }),
        }
    }

    /// Route `session`'s notifications into this tracker.
    ///
    /// Replaces any handler already registered on the session.
    pub fn attach(&self, session: &RpcSession) {
        let tracker = self.clone();
        session.on_notification(move |n| tracker.observe(n));
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> SettlePhase {
        self.lock().phase
    }

    /// Open a window for `subject`; the hard timer starts now.
    ///
    /// Arm before sending the trigger so no early notification is missed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::SettleBusy`] if a window is already waiting.
    pub fn arm(&self, subject: SettleSubject) -> Result<SettleWait> {
        let mut state = self.lock();
        if state.phase == SettlePhase::Waiting {
            return Err(AppError::SettleBusy(format!(
                "already waiting on {}",
                state
                    .subject
                    .as_ref()
                    .map_or("<unknown>", |s| s.method.as_str())
            )));
        }
        state.generation += 1;
        state.phase = SettlePhase::Waiting;
        state.window = Some(SettleWindow::open(self.shared.config, Instant::now()));
        debug!(method = %subject.method, generation = state.generation, "settle window armed");
        state.subject = Some(subject);

        Ok(SettleWait {
            shared: Arc::clone(&self.shared),
            generation: state.generation,
            finished: false,
        })
    }

    /// Feed one inbound notification.
    pub fn observe(&self, notification: &Notification) {
        let mut state = self.lock();
        if state.phase != SettlePhase::Waiting {
            return;
        }
        let matched = state
            .subject
            .as_ref()
            .is_some_and(|s| s.matches(notification));
        if !matched {
            return;
        }
        let observed = state
            .window
            .as_mut()
            .is_some_and(|w| w.observe(Instant::now(), notification.params.clone()));
        drop(state);
        if observed {
            self.shared.wake.notify_waiters();
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pending settlement of one armed window.
#[must_use = "dropping a SettleWait cancels its window"]
pub struct SettleWait {
    shared: Arc<Shared>,
    generation: u64,
    finished: bool,
}

impl std::fmt::Debug for SettleWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettleWait")
            .field("generation", &self.generation)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl SettleWait {
    /// Wait until the quiet or hard timer fires and return the summary.
    pub async fn settled(mut self) -> SettleSummary {
        loop {
            // Register before reading state so an event in between still wakes us.
            let woken = self.shared.wake.notified();

            let deadline = {
                let mut state = self
                    .shared
                    .state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let now = Instant::now();
                let Some(window) = state.window.as_ref() else {
                    // Only reachable if the window was torn down under us.
                    self.finished = true;
                    return SettleSummary {
                        time_to_first_event: None,
                        time_to_settle: std::time::Duration::ZERO,
                        event_count: 0,
                        last_payload: None,
                        reason: SettleReason::Deadline,
                    };
                };
                match window.poll(now) {
                    Some(reason) => {
                        let summary = state.window.take().map(|w| w.finish(reason));
                        state.phase = SettlePhase::Settled;
                        state.subject = None;
                        self.finished = true;
                        if let Some(summary) = summary {
                            debug!(%summary, "settle window closed");
                            return summary;
                        }
                        now
                    }
                    None => window.next_deadline(),
                }
            };

            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                () = woken => {}
            }
        }
    }
}

impl Drop for SettleWait {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.generation == self.generation && state.phase == SettlePhase::Waiting {
            debug!(generation = self.generation, "settle window cancelled");
            state.phase = SettlePhase::Armed;
            state.window = None;
            state.subject = None;
        }
    }
}
