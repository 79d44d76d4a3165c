use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tabchat_core::{ChatError, ChatResult};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Configures retry behaviour for non-streaming completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Fixed pause between attempts, in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
        }
    }

    /// Pause between attempts.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent.
///
/// Only [`ChatError::is_retryable`] errors (API errors with a 5xx status)
/// are retried; the last error is returned unchanged. Cancelling `cancel`
/// during the pause between attempts ends the loop with
/// [`ChatError::Aborted`].
pub async fn retry_server_errors<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> ChatResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ChatResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= attempts {
            warn!(attempts, error = %err, "Retries exhausted");
            return Err(err);
        }

        info!(
            attempt,
            delay_ms = policy.delay_ms,
            error = %err,
            "Server error, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(ChatError::Aborted),
            _ = tokio::time::sleep(policy.delay()) => {}
        }
        attempt += 1;
    }
}
