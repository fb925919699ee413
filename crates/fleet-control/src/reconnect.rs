//! Retry pacing for the event bus subscription loop

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub ceiling: Duration,
    pub factor: u32,
}

impl BackoffConfig {
    /// Delay after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        self.factor
            .max(1)
            .checked_pow(failures)
            .and_then(|scale| self.base.checked_mul(scale))
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
            factor: 2,
        }
    }
}

/// Delay schedule `base, base*factor, ...` capped at `ceiling`. Never gives up;
/// the caller stops it through its cancellation token.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Delay before the next retry; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Sleeps for the next delay. Returns false if cancelled first.
    pub async fn sleep(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.next_delay();
        debug!(retry = self.failures, delay_ms = delay.as_millis() as u64, "Backing off");
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
