//! Rate limiting and retry logic for metadata lookups
//!
//! Lookups against an external metadata capability are throttled with a
//! governor limiter and retried with exponential backoff, so a slow or
//! flaky provider never stalls a scan indefinitely.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use tracing::warn;

/// Shared direct (un-keyed) limiter
pub type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Configuration for rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per second
    pub requests_per_second: u32,
    /// Burst capacity (allows short bursts above the rate)
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2,
            burst_size: 5,
        }
    }
}

impl RateLimitConfig {
    /// Build a limiter from this config
    pub fn build(&self) -> Arc<DirectLimiter> {
        let quota = Quota::per_second(
            NonZeroU32::new(self.requests_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(self.burst_size).unwrap_or(NonZeroU32::MIN));

        Arc::new(RateLimiter::direct(quota))
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_interval: Duration,
    /// Maximum backoff duration
    pub max_interval: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create an ExponentialBackoff from this config
    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            max_elapsed_time: Some(Duration::from_secs(120)),
            ..Default::default()
        }
    }
}

/// Execute an async operation with retry logic
pub async fn retry_async<T, E, Fut, F>(
    operation: F,
    config: &RetryConfig,
    operation_name: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    let mut backoff = config.to_backoff();

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= config.max_retries {
                    warn!(
                        operation = %operation_name,
                        attempts = attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                if let Some(duration) = backoff.next_backoff() {
                    let retry_ms: u128 = duration.as_millis();
                    warn!(
                        operation = %operation_name,
                        attempt = attempts,
                        error = %e,
                        retry_in_ms = retry_ms,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(duration).await;
                } else {
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_rate_limit_config_default() {
        let config = RateLimitConfig::default();
        assert_eq!(config.requests_per_second, 2);
        assert_eq!(config.burst_size, 5);
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
    }

    #[tokio::test]
    async fn test_retry_async_stops_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            ..Default::default()
        };

        let counter = &attempts;
        let result: Result<(), String> = retry_async(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            },
            &config,
            "test",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_limiter_allows_burst() {
        let limiter = RateLimitConfig {
            requests_per_second: 1,
            burst_size: 2,
        }
        .build();
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }
}
