use std::time::Duration;

use tokio::time::Instant;

use conductor_types::ErrorKind;

use crate::config::RetryConfig;

/// Backoff schedule for one logical action: jittered exponential delays,
/// with the bucket's next-token time taking over after throttling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Whether attempt `attempt` (1-based) failing with `kind` earns
    /// another try.
    pub fn should_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
        attempt < self.max_attempts() && kind.is_retriable()
    }

    /// Delay before the attempt after `failed_attempt`:
    /// `min(max_delay, initial_delay * multiplier^(failed_attempt - 1))`
    /// plus additive jitter.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let base = self.config.initial_delay_ms as f64
            * self.config.multiplier.max(1.0).powi(exponent as i32);
        let capped = base.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64) + self.jitter()
    }

    /// After a rate-limit error the bucket knows better than the schedule:
    /// wait for the next whole token (plus jitter) when it is available.
    pub fn delay_after_rate_limit(
        &self,
        failed_attempt: u32,
        next_token_at: Option<Instant>,
    ) -> Duration {
        match next_token_at {
            Some(at) => at.saturating_duration_since(Instant::now()) + self.jitter(),
            None => self.delay_after(failed_attempt),
        }
    }

    /// Additive uniform jitter over `[0, initial_delay / 2]`.
    fn jitter(&self) -> Duration {
        if !self.config.jitter {
            return Duration::ZERO;
        }
        let half = self.config.initial_delay_ms / 2;
        if half == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(fastrand::u64(0..=half))
    }
}
