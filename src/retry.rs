//! Retry configuration and exponential backoff logic.
//!
//! This module provides the [`RetryConfig`] type and the [`retry_with_backoff`]
//! helper used by backend constructors to ride out a broker that is still
//! starting up when the client connects.
//!
//! # Retry Strategy
//!
//! - Only retries errors for which [`Error::is_retryable`](crate::Error::is_retryable) holds
//! - Uses exponential backoff with randomized jitter to prevent thundering herd
//! - Caps delay at `max_delay` to prevent excessive wait times
//! - The overall budget is bounded by the caller (see `connect_timeout`
//!   on the backend configs)

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;

use crate::log_debug;

/// Retry configuration with exponential backoff.
///
/// # Example
///
/// ```
/// use mom_pubsub::RetryConfig;
/// use std::time::Duration;
///
/// let retry = RetryConfig {
///     max_attempts: 5,
///     multiplier: 2.0,
///     initial_delay: Duration::from_millis(100),
///     max_delay: Duration::from_secs(10),
/// };
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    pub multiplier: f32,

    /// Initial delay before the first retry.
    #[serde(with = "crate::config::duration_ms")]
    pub initial_delay: Duration,

    /// Maximum delay between retry attempts (caps exponential growth).
    #[serde(with = "crate::config::duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// Connect-oriented defaults.
    ///
    /// - `max_attempts`: 30
    /// - `multiplier`: 1.5
    /// - `initial_delay`: 250ms
    /// - `max_delay`: 1s
    ///
    /// Combined with the 30s default `connect_timeout` this approximates a
    /// once-per-second liveness probe for half a minute.
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 30,
            multiplier: 1.5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// A configuration that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Executes the provided operation and retries it according to the retry
/// configuration if it fails with a retryable error. Non-retryable errors
/// cause immediate failure. If `retry_config` is `None`, the operation
/// executes exactly once.
///
/// # Backoff Algorithm
///
/// - First retry: `initial_delay` (with jitter)
/// - Subsequent retries: `min(current_delay * multiplier, max_delay)` (with jitter)
/// - Jitter: ±25% randomization to prevent synchronized retries
#[cfg_attr(not(any(feature = "redis", feature = "gcp")), allow(dead_code))]
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    retry_config: Option<&RetryConfig>,
    mut operation: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let Some(retry_config) = retry_config else {
        return operation().await;
    };

    let mut attempt = 0;
    let mut current_delay = retry_config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() => {
                attempt += 1;

                if attempt > retry_config.max_attempts {
                    log_debug!(
                        "retry exhausted after {} attempts, last error: {err}",
                        retry_config.max_attempts
                    );
                    return Err(err);
                }

                let jittered_delay = apply_jitter(current_delay);

                log_debug!(
                    "retry attempt {attempt}/{}, waiting {jittered_delay:?} before retry (error: {err})",
                    retry_config.max_attempts
                );

                sleep(jittered_delay).await;

                let next_delay = Duration::from_secs_f64(
                    current_delay.as_secs_f64() * retry_config.multiplier as f64,
                );
                current_delay = next_delay.min(retry_config.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Apply ±25% jitter to a duration.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
#[cfg_attr(not(any(feature = "redis", feature = "gcp")), allow(dead_code))]
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    let random_factor = (hash % 1000) as f64 / 1000.0;
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}
