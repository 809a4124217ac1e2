// Deadline and retry wrapper around a single parse attempt. Retries use a
// short fixed delay rather than exponential backoff: the per-attempt
// deadline is already tight, so backing off further only burns the session
// budget.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::watch;
use tokio::time;

use crate::models::Strategy;
use crate::utils::ScanError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

/// Runs operations under a hard per-attempt deadline with bounded retries.
///
/// Every wait this runner creates (deadlines and inter-retry delays) is
/// tied to one cancellation channel; a single `cancel_all` sweeps them all,
/// so no timer can fire after the session is gone.
pub struct RetryRunner {
    cancel_tx: watch::Sender<bool>,
}

impl Default for RetryRunner {
    fn default() -> Self {
        RetryRunner::new()
    }
}

impl RetryRunner {
    pub fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        RetryRunner { cancel_tx }
    }

    /// Cancel every in-flight and future wait owned by this runner.
    /// Idempotent.
    pub fn cancel_all(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Sleep under this runner's cancellation umbrella. Used for the
    /// strategy hand-off delay so even that wait is swept by `cancel_all`.
    pub async fn delay(&self, duration: Duration) -> Result<(), ScanError> {
        let mut cancel_rx = self.cancel_tx.subscribe();
        if *cancel_rx.borrow() {
            return Err(ScanError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = wait_for_cancel(&mut cancel_rx) => Err(ScanError::Cancelled),
            _ = time::sleep(duration) => Ok(()),
        }
    }

    /// Run `op` under the policy. The closure receives the 1-based attempt
    /// number. Errors that are deterministic for a fixed input short-circuit
    /// the retry loop; transient ones are retried until the budget is spent,
    /// after which a `RetryExhausted` carrying the last error is returned.
    pub async fn run<T, F, Fut>(
        &self,
        strategy: Strategy,
        policy: RetryPolicy,
        mut op: F,
    ) -> Result<T, ScanError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ScanError>>,
    {
        let mut cancel_rx = self.cancel_tx.subscribe();
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = ScanError::ParsingFailed("no attempt was made".into());

        for attempt in 1..=max_attempts {
            if *cancel_rx.borrow() {
                return Err(ScanError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = wait_for_cancel(&mut cancel_rx) => return Err(ScanError::Cancelled),
                outcome = time::timeout(policy.attempt_timeout, op(attempt)) => outcome,
            };

            match outcome {
                Ok(Ok(value)) => {
                    debug!("{} attempt {} succeeded", strategy, attempt);
                    return Ok(value);
                }
                Ok(Err(error)) => {
                    if !error.retryable_within_strategy() {
                        return Err(error);
                    }
                    debug!("{} attempt {} failed: {}", strategy, attempt, error);
                    last_error = error;
                }
                Err(_elapsed) => {
                    let timeout = ScanError::Timeout {
                        strategy,
                        elapsed_ms: policy.attempt_timeout.as_millis() as u64,
                    };
                    debug!("{} attempt {} hit its deadline", strategy, attempt);
                    last_error = timeout;
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    biased;
                    _ = wait_for_cancel(&mut cancel_rx) => return Err(ScanError::Cancelled),
                    _ = time::sleep(policy.retry_delay) => {}
                }
            }
        }

        warn!(
            "{} retries exhausted after {} attempts: {}",
            strategy, max_attempts, last_error
        );
        Err(ScanError::RetryExhausted {
            strategy,
            attempts: max_attempts,
            last: Box::new(last_error),
        })
    }
}

/// Resolves once the cancel flag is raised; pends forever otherwise.
async fn wait_for_cancel(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            // Sender dropped without cancelling; nothing left to wait on.
            std::future::pending::<()>().await;
        }
    }
}
