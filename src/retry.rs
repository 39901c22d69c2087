//! Bounded retry with exponential backoff
//!
//! Used for cloud calls that fail transiently right after a resource is
//! created, before the provider's eventual consistency catches up.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 9,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects the error, or the
/// attempt budget is spent. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt >= config.max_attempts || !should_retry(&e) {
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay
                    .mul_f64(config.backoff_multiplier.max(1.0))
                    .min(config.max_delay);
            }
        }
    }
}
