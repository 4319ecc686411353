//! Per-method request deadlines.

use std::collections::HashMap;
use std::time::Duration;

/// Default deadline for steady-state requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for the initial handshake, which may include peer warm-up.
pub const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(45);

/// Deadline policy: one default plus overrides keyed by method name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTimeouts {
    default: Duration,
    overrides: HashMap<String, Duration>,
}

impl RequestTimeouts {
    /// Policy with `default` and no overrides.
    #[must_use]
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Add or replace the deadline for `method`.
    #[must_use]
    pub fn with_override(mut self, method: impl Into<String>, timeout: Duration) -> Self {
        self.overrides.insert(method.into(), timeout);
        self
    }

    /// Deadline that applies to `method`.
    #[must_use]
    pub fn for_method(&self, method: &str) -> Duration {
        self.overrides.get(method).copied().unwrap_or(self.default)
    }

    /// Deadline for methods without an override.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default
    }
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT).with_override("initialize", INITIALIZE_TIMEOUT)
    }
}
