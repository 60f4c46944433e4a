use std::future::Future;
use std::time::Duration;

use futures_retry::{ErrorHandler, FutureRetry, RetryPolicy};
use tracing::warn;

use crate::config::BackoffPolicy;
use crate::error::StoreError;

/// Retries transient store failures with exponentially growing delays.
/// Conditional-check failures and other non-transient errors are forwarded
/// immediately.
pub(crate) struct ExponentialRetry {
    op: &'static str,
    worker_id: String,
    max_attempts: usize,
    policy: BackoffPolicy,
}

impl ExponentialRetry {
    pub(crate) fn new(
        op: &'static str,
        worker_id: &str,
        max_attempts: usize,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            op,
            worker_id: worker_id.to_string(),
            max_attempts,
            policy,
        }
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let factor = self.policy.factor.powi(attempt.saturating_sub(1) as i32);
        self.policy.initial.mul_f64(factor).min(self.policy.cap)
    }
}

impl ErrorHandler<StoreError> for ExponentialRetry {
    type OutError = StoreError;

    fn handle(&mut self, attempt: usize, err: StoreError) -> RetryPolicy<StoreError> {
        if attempt >= self.max_attempts {
            return RetryPolicy::ForwardError(err);
        }
        match err {
            StoreError::Transient(_) => {
                let backoff = self.delay_for(attempt);
                warn!(
                    worker = %self.worker_id,
                    op = self.op,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "store call failed, backing off"
                );
                RetryPolicy::WaitRetry(backoff)
            }
            other => RetryPolicy::ForwardError(other),
        }
    }
}

/// Drive `operation` until it succeeds, the strategy forwards an error, or
/// the attempt budget runs out.
pub(crate) async fn with_retries<T, F, Fut>(
    strategy: ExponentialRetry,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut + Unpin,
    Fut: Future<Output = Result<T, StoreError>>,
{
    FutureRetry::new(move || Box::pin(operation()), strategy)
        .await
        .map(|(value, _)| value)
        .map_err(|(err, _)| err)
}
