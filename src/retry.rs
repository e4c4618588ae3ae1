//! Pluggable retry strategies wrapped around a single fetch.
//!
//! A [`RetryHandler`] receives the fetch as an [`Operation`] and decides how many
//! physical attempts make up one logical fetch. The query layer only ever sees the
//! final outcome, so "failed after retries" and "failed on the first try" are
//! indistinguishable to observers.
//!
//! # Example
//!
//! ```rust
//! use querybind::{EndpointOptions, retry::FixedRetry};
//!
//! let options = EndpointOptions::<u32, String>::default()
//!     .with_retry_handler(FixedRetry::new(3));
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::QueryError;

/// One attempt of a fetch, given the cancellation token for that attempt.
pub type Operation<T> =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Strategy that executes a fetch and decides whether and how to retry it.
///
/// Implementations must check `token` before each attempt and must never treat
/// [`QueryError::Cancelled`] as a retryable failure.
pub trait RetryHandler<T>: Send + Sync {
    fn execute(
        &self,
        operation: Operation<T>,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<T, QueryError>>;
}

/// Invokes the operation exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl<T: Send + 'static> RetryHandler<T> for NoRetry {
    fn execute(
        &self,
        operation: Operation<T>,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<T, QueryError>> {
        async move {
            if token.is_cancelled() {
                return Err(QueryError::Cancelled);
            }
            operation(token).await
        }
        .boxed()
    }
}

/// Re-invokes the operation immediately on failure, up to `retries` extra attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedRetry {
    retries: usize,
}

impl FixedRetry {
    #[must_use]
    pub const fn new(retries: usize) -> Self {
        Self { retries }
    }

    #[must_use]
    pub const fn retries(&self) -> usize {
        self.retries
    }
}

impl<T: Send + 'static> RetryHandler<T> for FixedRetry {
    fn execute(
        &self,
        operation: Operation<T>,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<T, QueryError>> {
        let retries = self.retries;
        async move {
            let mut attempt = 0;
            loop {
                if token.is_cancelled() {
                    return Err(QueryError::Cancelled);
                }
                match operation(token.clone()).await {
                    Err(err) if !err.is_cancelled() && attempt < retries => {
                        attempt += 1;
                        debug!(attempt, retries, error = %err, "retrying failed fetch");
                    }
                    outcome => return outcome,
                }
            }
        }
        .boxed()
    }
}

/// Retries with an exponentially growing delay between attempts.
///
/// The delay starts at `base_delay`, doubles after each failure and never
/// exceeds `max_delay`. Cancellation during a delay ends the fetch at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffRetry {
    retries: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl BackoffRetry {
    #[must_use]
    pub const fn new(retries: usize, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(2u32.saturating_pow(attempt))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl<T: Send + 'static> RetryHandler<T> for BackoffRetry {
    fn execute(
        &self,
        operation: Operation<T>,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<T, QueryError>> {
        let policy = *self;
        async move {
            let mut attempt: u32 = 0;
            loop {
                if token.is_cancelled() {
                    return Err(QueryError::Cancelled);
                }
                match operation(token.clone()).await {
                    Err(err) if !err.is_cancelled() && (attempt as usize) < policy.retries => {
                        let delay = policy.delay_for(attempt);
                        attempt += 1;
                        debug!(attempt, ?delay, error = %err, "backing off before retry");
                        tokio::select! {
                            () = token.cancelled() => return Err(QueryError::Cancelled),
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    outcome => return outcome,
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing_operation(calls: Arc<AtomicUsize>, succeed_on: usize) -> Operation<u32> {
        Arc::new(move |_token| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call >= succeed_on {
                    Ok(call as u32)
                } else {
                    Err(QueryError::fetch(format!("attempt {call}")))
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_no_retry_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = NoRetry
            .execute(failing_operation(calls.clone(), 2), CancellationToken::new())
            .await;
        assert_eq!(result, Err(QueryError::fetch("attempt 1")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fixed_retry_succeeds_within_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = FixedRetry::new(3)
            .execute(failing_operation(calls.clone(), 3), CancellationToken::new())
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fixed_retry_surfaces_last_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = FixedRetry::new(2)
            .execute(failing_operation(calls.clone(), 10), CancellationToken::new())
            .await;
        assert_eq!(result, Err(QueryError::fetch("attempt 3")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fixed_retry_does_not_retry_cancellation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let operation: Operation<u32> = Arc::new(move |_token| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(QueryError::Cancelled) }.boxed()
        });
        let result = FixedRetry::new(5)
            .execute(operation, CancellationToken::new())
            .await;
        assert_eq!(result, Err(QueryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        token.cancel();
        let result = FixedRetry::new(5)
            .execute(failing_operation(calls.clone(), 1), token)
            .await;
        assert_eq!(result, Err(QueryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_backoff_delays() {
        let policy = BackoffRetry::new(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retry_eventually_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = BackoffRetry::new(2, Duration::from_secs(1))
            .execute(failing_operation(calls.clone(), 3), CancellationToken::new())
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retry_cancelled_while_waiting() {
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let fut = BackoffRetry::new(2, Duration::from_secs(10))
            .execute(failing_operation(calls.clone(), 10), token.clone());
        let handle = tokio::spawn(fut);
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        let result = handle.await.expect("retry task should not panic");
        assert_eq!(result, Err(QueryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
