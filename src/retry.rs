//! Bounded backoff polling.
//!
//! Used to wait for state that another controller fills in asynchronously,
//! such as the token secret the token controller attaches to a freshly
//! created ServiceAccount. The attempt count is a hard bound: the caller is
//! blocked for at most `max_attempts - 1` sleeps.
//!
//! # Example
//!
//! ```ignore
//! use impersonator::retry::{poll_with_backoff, RetryConfig};
//!
//! let sa = poll_with_backoff(&RetryConfig::default(), "wait_for_sa", || async {
//!     let sa = client.get_service_account(ns, name, Read::Cached).await?;
//!     Ok(sa.filter(has_token))
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::trace;

/// Backoff configuration for bounded polling.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (always at least one attempt is made)
    pub max_attempts: u32,
    /// Delay after the first unsuccessful attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt (1.0 = constant)
    pub backoff_multiplier: f64,
    /// Jitter fraction: each delay is scaled by a random factor in
    /// `[1 - jitter, 1 + jitter]`. Zero disables jitter.
    pub jitter: f64,
}

impl Default for RetryConfig {
    /// 10 attempts, 200ms apart, no growth and no jitter.
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Upper bound on the total time spent sleeping, ignoring jitter.
    pub fn total_delay(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut delay = self.initial_delay;
        for _ in 1..self.max_attempts.max(1) {
            total += delay;
            delay = self.next_delay(delay);
        }
        total
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..(1.0 + self.jitter));
        Duration::from_secs_f64(delay.as_secs_f64() * factor.max(0.0))
    }
}

/// Poll `check` until it yields a value, fails, or attempts run out.
///
/// `check` returns `Ok(Some(v))` when the condition holds, `Ok(None)` to keep
/// polling, or `Err` to abort immediately. Exhaustion returns `Ok(None)`; the
/// caller decides what a timeout means. No sleep follows the last attempt.
pub async fn poll_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut check: F,
) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;

    for attempt in 1..=attempts {
        if let Some(value) = check().await? {
            return Ok(Some(value));
        }
        if attempt == attempts {
            break;
        }

        let sleep_for = config.jittered(delay);
        trace!(
            operation = %operation_name,
            attempt = attempt,
            delay_ms = sleep_for.as_millis() as u64,
            "Condition not met, polling again"
        );
        tokio::time::sleep(sleep_for).await;
        delay = config.next_delay(delay);
    }

    Ok(None)
}
