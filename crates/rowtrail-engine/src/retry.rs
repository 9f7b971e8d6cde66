//! Bounded exponential-backoff retry.
//!
//! A pure wrapper around an async operation: at most `max_retries + 1`
//! executions, doubling delay between attempts up to a cap, stopping
//! immediately on cancellation or a non-retryable error. Retried
//! operations must be idempotent; the harness never inspects partial
//! results.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Classifies an error as worth retrying or not.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for rowtrail_store::StoreError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Outcome of a retried operation that never succeeded.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The supplied cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Every attempt failed with a retryable error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    /// A non-retryable error; returned from the failing attempt.
    #[error(transparent)]
    Terminal(E),
}

/// Attempt count and backoff shape.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Run `op` under this policy. Sleeps between attempts race the
    /// cancellation token; cancellation wins immediately.
    ///
    /// # Errors
    ///
    /// [`RetryError::Terminal`] for a non-retryable failure,
    /// [`RetryError::Exhausted`] once the attempt budget is spent, and
    /// [`RetryError::Cancelled`] when the token fires first.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Retryable + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(RetryError::Terminal(err)),
                Err(err) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }
                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(RetryError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(self.max_delay);
                }
            }
        }
    }
}
