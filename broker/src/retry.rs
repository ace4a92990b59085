//! Caller-side retry policy for `Conflict`, `IndexWrite` and `Timeout` errors.
//!
//! The engine never retries internally; ingestion loops wrap whole calls in
//! [`RetryPolicy::run`].

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

use crate::errors::BrokerError;

const DEFAULT_ATTEMPTS: usize = 5;
const DEFAULT_BASE_DELAY_MS: u64 = 10;
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first call included.
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Read `BROKER_RETRY_ATTEMPTS` (default 5, at least 1).
    pub fn from_env() -> Self {
        let max_attempts = std::env::var("BROKER_RETRY_ATTEMPTS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_ATTEMPTS);
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    fn strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.base_delay_ms)
            .factor(2)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1))
    }

    /// Run `action` until it succeeds, fails with a non-retryable error, or
    /// the attempts are used up. The last error is returned.
    pub async fn run<T, A, F>(&self, mut action: A) -> Result<T, BrokerError>
    where
        A: FnMut() -> F,
        F: Future<Output = Result<T, BrokerError>>,
    {
        RetryIf::spawn(self.strategy(), || action(), |e: &BrokerError| {
            let retry = e.is_retryable();
            if retry {
                warn!(error = %e, "Retrying after failure");
            }
            retry
        })
        .await
    }
}
