//! Exponential backoff for consecutive pipeline failures.

use std::time::Duration;

/// First backoff delay, in seconds.
const BASE_SECS: u64 = 60;
/// Delay ceiling, in seconds.
const CAP_SECS: u64 = 3600;

/// Double-then-cap backoff: 60, 120, 240, 480, 960, 1920, 3600, 3600, …
/// A single success resets to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backoff {
    consecutive_failures: u32,
}

impl Backoff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one pipeline failure.
    pub fn advance(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// Record a pipeline success.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Current delay, or `None` when no failures are outstanding.
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        if self.consecutive_failures == 0 {
            return None;
        }
        // Clamp the shift so the arithmetic saturates at the cap rather
        // than overflowing.
        let exp = (self.consecutive_failures - 1).min(6);
        let secs = (BASE_SECS << exp).min(CAP_SECS);
        Some(Duration::from_secs(secs))
    }
}
