use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Time source for anything that waits. Production code uses [`SystemClock`];
/// tests swap in a clock that records sleeps instead of performing them.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Final failure of a retried operation.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Runs an async operation under a [`RetryPolicy`], sleeping on the injected clock.
#[derive(Clone)]
pub struct RetryRunner {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryRunner {
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `op` until it succeeds, `is_retryable` rejects the error, or the
    /// attempt budget runs out. Returns the value and the number of attempts used.
    pub async fn run<T, E, F, Fut, R>(
        &self,
        operation_name: &str,
        is_retryable: R,
        mut op: F,
    ) -> Result<(T, u32), RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.policy.attempts();
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) => {
                    if attempt >= max_attempts || !is_retryable(&e) {
                        return Err(RetryExhausted { attempts: attempt, last_error: e });
                    }
                    let delay = self.policy.backoff_after(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        operation_name, attempt, max_attempts, e, delay
                    );
                    self.clock.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
