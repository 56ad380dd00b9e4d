use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

/// How often an operation body is re-run after a failed attempt.
///
/// Every error is retried the same way; callers that can tell permanent
/// failures apart should not route them through a policy with retries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once_after(Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self::new(1, Backoff::None)
    }

    /// One retry after `delay`.
    pub fn once_after(delay: Duration) -> Self {
        Self::new(2, Backoff::Fixed(delay))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt + 1`, `attempt` counting from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
                base.checked_mul(factor).unwrap_or(max).min(max)
            }
        }
    }

    /// Runs `attempt` until it succeeds or the attempts are used up, and
    /// returns the last result.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut attempt: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut tries = 1;
        loop {
            match attempt().await {
                Ok(v) => return Ok(v),
                Err(e) if tries < self.max_attempts => {
                    let delay = self.delay_after(tries);
                    warn!("{what} failed (attempt {tries}): {e}; retrying in {delay:?}");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    tries += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
