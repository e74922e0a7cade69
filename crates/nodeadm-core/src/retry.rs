use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Exponential backoff with random jitter.
///
/// The delay after `n` consecutive failures is `base * 2^(n-1)`, capped at
/// `max`, plus a uniformly random extra in `[0, jitter]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
            jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    /// Deterministic part of the delay after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay after `failures` consecutive failures, with jitter applied.
    pub fn next_delay(&self, failures: u32) -> Duration {
        jittered(self.delay_for(failures), self.jitter)
    }
}

/// `base` plus a uniformly random duration in `[0, jitter]`.
pub fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let extra_ms = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
    base + Duration::from_millis(extra_ms)
}

/// Retry a fallible async operation with exponential backoff.
///
/// - `max_attempts`: Total attempts (including the first).
/// - `policy`: Delay between attempts.
/// - `label`: Description for log messages.
/// - `f`: Produces a fresh future for every attempt.
pub async fn retry<F, Fut, T, E>(
    max_attempts: u32,
    policy: BackoffPolicy,
    label: &str,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = policy.next_delay(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
