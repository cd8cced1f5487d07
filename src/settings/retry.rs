use crate::error::{SettingsError, StoreError};
use std::future::Future;
use std::time::Duration;

/// Errors that may succeed when the operation is re-run from scratch
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        self.is_conflict()
    }
}

impl Retryable for SettingsError {
    fn is_retryable(&self) -> bool {
        self.is_conflict()
    }
}

/// Bounded retry: `attempts` total tries with a fixed pause in between
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(200),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempts are used up
///
/// `op` receives the 1-based attempt number and must be safe to repeat: it
/// should re-read whatever state it mutates.
pub async fn retry_on_conflict<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    "Write conflict ({}), retrying in {:?} (attempt {}/{})",
                    e,
                    policy.delay,
                    attempt,
                    attempts
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
