//! Retry policy for language-model calls.
//!
//! Retries rate-limit, network, timeout and server errors with exponential
//! backoff and jitter. The delay sequence is clamped to be non-decreasing and
//! never below a provider-supplied `retry-after`. The operation is called at
//! most `max_attempts` times.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::errors::LlmError;
use crate::domain::models::RetryConfig;

/// Details of a failed attempt that is about to be retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryNotice {
    /// Stable label from [`LlmError::kind`].
    pub error_kind: String,
    /// Error text of the failed attempt.
    pub message: String,
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
    /// Attempt budget of the call.
    pub max_attempts: u32,
    /// Wait before the next attempt.
    pub delay: Duration,
}

/// Attempt budget and backoff shape for model calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Exponential backoff doubling from `initial_delay` up to `max_delay`, without jitter.
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Policy from the `[retry]` config section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_multiplier(config.multiplier)
        .with_jitter(config.jitter)
    }

    /// A policy that calls the operation exactly once.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Growth factor between delays. Values below 1 are raised to 1.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Random spread applied to each delay, as a fraction in [0, 0.99].
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    /// Most times an operation is called, including the first attempt.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Fresh delay schedule for one call.
    pub fn delays(&self) -> RetryDelays {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.jitter)
            .with_max_elapsed_time(None)
            .build();

        RetryDelays {
            backoff,
            previous: Duration::ZERO,
            max_delay: self.max_delay,
        }
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `on_retry` is invoked before every backoff sleep.
    pub async fn execute<T, F, Fut, N>(&self, mut operation: F, mut on_retry: N) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
        N: FnMut(&RetryNotice),
    {
        let mut delays = self.delays();
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = delays.next_delay(err.retry_after());
                    let notice = RetryNotice {
                        error_kind: err.kind().to_string(),
                        message: err.to_string(),
                        attempt,
                        max_attempts: self.max_attempts,
                        delay,
                    };
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error_kind = notice.error_kind.as_str(),
                        "transient model error, retrying: {err}"
                    );
                    on_retry(&notice);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(attempts = attempt, "giving up after retries: {err}");
                    } else {
                        debug!("permanent model error, not retrying: {err}");
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Non-decreasing backoff delays for one call.
pub struct RetryDelays {
    backoff: ExponentialBackoff,
    previous: Duration,
    max_delay: Duration,
}

impl RetryDelays {
    /// Next delay, at least as long as the previous one and as `retry_after`.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Duration {
        let sampled = self
            .backoff
            .next_backoff()
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        let mut delay = sampled.max(self.previous);
        if let Some(wait) = retry_after {
            delay = delay.max(wait);
        }
        self.previous = delay;
        delay
    }
}

impl Iterator for RetryDelays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay(None))
    }
}
