/// Per-row retry with exponential backoff and jitter.
///
/// The store has no transactions, so a failed write is retried where it
/// happened instead of rolled back.
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::constants::{INITIAL_RETRY_BACKOFF_MS, MAX_RETRY_BACKOFF_MS, SHIFT_WRITE_ATTEMPTS};
use crate::error::StoreError;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryConfig {
    /// Total attempts per write, including the first. At least 1 is used.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in [0.7, 1.3).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: SHIFT_WRITE_ATTEMPTS,
            initial_backoff: Duration::from_millis(INITIAL_RETRY_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_RETRY_BACKOFF_MS),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts. For tests and local stores.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts. Returns the last error on exhaustion.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, what: &str, mut f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut backoff = config.initial_backoff;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = jittered(backoff, config.jitter);
                warn!(what, attempt, max_attempts, error = %e, ?delay, "store write failed, retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                backoff = Duration::from_millis(
                    (backoff.as_millis() as f64 * config.backoff_multiplier)
                        .min(config.max_backoff.as_millis() as f64) as u64,
                );
            }
        }
    }
}

fn jittered(base: Duration, jitter: bool) -> Duration {
    if !jitter || base.is_zero() {
        return base;
    }
    let factor = rand::rng().random_range(0.7..1.3);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}
