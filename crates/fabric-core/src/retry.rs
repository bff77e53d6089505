//! Exponential back-off with jitter (spec §5).
//!
//! `delay = clamp(minDelay * factor^attempt, maxDelay) * (1 - jitter + 2 *
//! jitter * U[0,1))`. The canonical retryable case is a KV compare-and-swap
//! miss (JetStream KV error code 10071, "wrong last sequence"); that check
//! is bus-specific and lives in `fabric-bus`, expressed here only as the
//! `RetryableError` trait a caller's error type must implement.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::cancel::cancellable;
use crate::error::FabricError;

/// Implemented by error types a [`RetryPolicy`] can evaluate for
/// retryability, e.g. a bus error wrapping KV code 10071.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: 10,
            min_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(120),
            factor: 1.5,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Back-off delay for the given 0-based attempt number, not including
    /// jitter. Exposed separately so jitter can be tested deterministically.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let scaled = self.min_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Back-off delay with jitter applied, using `rng` for the uniform
    /// sample so callers can inject determinism in tests.
    pub fn delay_with_jitter(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let u: f64 = rng.gen_range(0.0..1.0);
        let factor = 1.0 - self.jitter + 2.0 * self.jitter * u;
        Duration::from_secs_f64((base * factor).max(0.0))
    }

    /// Retry `op` until it succeeds, `predicate` rejects the error as
    /// non-retryable, the retry budget is exhausted, or `token` is
    /// cancelled (spec §5 Cancellation: retry loops accept a token and
    /// exit with [`FabricError::cancelled`] when signalled).
    pub async fn run<F, Fut, T, E>(
        &self,
        token: &CancellationToken,
        predicate: impl Fn(&E, u32) -> bool,
        mut op: F,
    ) -> Result<T, RetryOutcome<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut rng = rand::thread_rng();
        for attempt in 0..=self.retries {
            match cancellable(token, op()).await {
                Err(cancelled) => return Err(RetryOutcome::Cancelled(cancelled)),
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    if attempt == self.retries || !predicate(&err, attempt) {
                        return Err(RetryOutcome::Exhausted(err));
                    }
                    let delay = self.delay_with_jitter(attempt, &mut rng);
                    if cancellable(token, tokio::time::sleep(delay)).await.is_err() {
                        return Err(RetryOutcome::Cancelled(FabricError::cancelled()));
                    }
                }
            }
        }
        unreachable!("loop always returns within retries + 1 iterations")
    }
}

#[derive(Debug)]
pub enum RetryOutcome<E> {
    /// The retry budget was exhausted, or the predicate rejected the error.
    Exhausted(E),
    /// The operation was cancelled via the backend's `Autoabortable`.
    Cancelled(FabricError),
}
