//! Bounded retry with backoff for task submission.
//!
//! Submission is idempotent by task id, so a transient failure can be
//! retried with the same id. Non-transient failures are surfaced at once.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackoffStrategy {
    /// `base * 2^retry`
    #[default]
    Exponential,
    /// `base * (retry + 1)`
    Linear,
    /// Always `base`.
    Constant,
}

/// Randomization applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JitterStrategy {
    /// The delay as computed.
    None,
    /// Uniform in `0..=delay`.
    #[default]
    Full,
    /// Half the delay plus a uniform share of the other half.
    Equal,
}

/// Retry policy for task submission (`submission.retry` in `config.yml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Maximum attempts, including the first one.
    pub max_attempts: usize,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Delay growth.
    pub backoff: BackoffStrategy,
    /// Delay randomization.
    pub jitter: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Returns the delay before retry number `retry` (zero-based).
    #[must_use]
    pub fn delay_for(&self, retry: usize) -> Duration {
        let base = self.base_delay_ms;
        let exponent = u32::try_from(retry).unwrap_or(u32::MAX);
        let delay = match self.backoff {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(exponent)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(exponent).saturating_add(1)),
            BackoffStrategy::Constant => base,
        }
        .min(self.max_delay_ms);

        let millis = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => rand::thread_rng().gen_range(0..=delay),
            JitterStrategy::Equal => delay / 2 + rand::thread_rng().gen_range(0..=delay - delay / 2),
        };
        Duration::from_millis(millis)
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or has been attempted `config.max_attempts` times.
///
/// `key` identifies the operation in log events.
pub async fn with_retry<T, E, F, Fut, P>(
    config: &RetryConfig,
    key: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retry = 0;
    loop {
        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        if !is_retryable(&e) {
            return Err(e);
        }
        if retry + 1 >= config.max_attempts {
            tracing::warn!(key, attempts = retry + 1, error = %e, "Giving up after retries");
            return Err(e);
        }

        let delay = config.delay_for(retry);
        retry += 1;
        tracing::debug!(
            key,
            retry,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %e,
            "Retrying after transient error"
        );
        tokio::time::sleep(delay).await;
    }
}
