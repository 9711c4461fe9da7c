//! Capped exponential backoff for reconnect loops.
//!
//! The supervisor retries forever.  [`Backoff`] only bounds how often: the
//! first retry waits `initial_backoff_ms`, each further one doubles the wait
//! up to `max_backoff_ms`, and [`Backoff::reset`] returns to the initial delay
//! after a successful connect.  An initial delay of zero gives the old
//! busy-retry behaviour, yielding to the scheduler between attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry pacing for surface accepts and serial reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    50
}
fn default_max_backoff_ms() -> u64 {
    2_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Stateful delay generator built from a [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_backoff_ms);
        let max = Duration::from_millis(config.max_backoff_ms).max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    /// Start over from the initial delay.
    pub fn reset(&mut self) {
        self.next = self.initial;
    }

    /// Sleep for [`next_delay`][Self::next_delay].
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}
