//! Retrying, rate-limited execution of outbound API calls
//!
//! Every call acquires a rate-limit token before each attempt, then failures
//! are handled by class:
//! - Throttled (429): sleep for the server-advised delay and retry, without
//!   spending the retry budget
//! - Transient (5xx): retry up to `max_retries` times with `base × 2^attempt`
//!   backoff, then surface the last error
//! - Permanent: surface immediately

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{ErrorClass, Result, DEFAULT_RETRY_AFTER_SECS};
use crate::rate_limiter::{ServiceClass, TenantRateLimiter};

/// Bounded exponential backoff for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before transient retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(1000))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, Duration::from_millis(config.base_delay_ms))
    }
}

/// Wraps outbound calls with rate limiting and failure classification
#[derive(Debug, Clone)]
pub struct RetryingClient {
    limiter: TenantRateLimiter,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(limiter: TenantRateLimiter, policy: RetryPolicy) -> Self {
        Self { limiter, policy }
    }

    pub fn limiter(&self) -> &TenantRateLimiter {
        &self.limiter
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `operation` until it succeeds or fails terminally
    ///
    /// `operation` is invoked once per attempt and must build a fresh request
    /// each time.
    pub async fn execute<T, F, Fut>(
        &self,
        tenant_id: &str,
        class: ServiceClass,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut transient_retries = 0u32;

        loop {
            self.limiter.acquire(tenant_id, class).await;

            let error = match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            match error.class() {
                ErrorClass::Throttled => {
                    let delay = error
                        .retry_after()
                        .unwrap_or(Duration::from_secs(DEFAULT_RETRY_AFTER_SECS));
                    warn!(
                        tenant = tenant_id,
                        class = %class,
                        "{} throttled, retrying in {:?}",
                        operation_name,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                ErrorClass::Transient if transient_retries < self.policy.max_retries => {
                    let delay = self.policy.backoff(transient_retries);
                    transient_retries += 1;
                    warn!(
                        tenant = tenant_id,
                        class = %class,
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name,
                        transient_retries,
                        self.policy.max_retries + 1,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    debug!(
                        tenant = tenant_id,
                        class = %class,
                        "{} failed terminally: {}",
                        operation_name,
                        error
                    );
                    return Err(error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MigrationError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn client(max_retries: u32) -> RetryingClient {
        RetryingClient::new(
            TenantRateLimiter::new(),
            RetryPolicy::new(max_retries, Duration::from_millis(1000)),
        )
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        // Saturates instead of overflowing
        assert!(policy.backoff(64) >= policy.backoff(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_retries_after_advised_delay_without_budget() {
        // No transient retries allowed: the 429 retry must not count
        let client = client(0);
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = client
            .execute("tenant", ServiceClass::General, "get item", || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(MigrationError::from_status(429, Some("5"), ""))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_millis(5000));
        assert!(start.elapsed() < Duration::from_millis(5100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_back_off_exponentially() {
        let client = client(3);
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = client
            .execute("tenant", ServiceClass::General, "get item", || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(MigrationError::from_status(500, None, ""))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        // 1000 + 2000 + 4000
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(7000), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(7100), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_exhaust_budget() {
        let client = client(3);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = client
            .execute("tenant", ServiceClass::Files, "upload", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(MigrationError::from_status(503, None, "unavailable"))
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(MigrationError::ServerError { status: 503, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_fail_immediately() {
        let client = client(3);
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result: Result<()> = client
            .execute("tenant", ServiceClass::Mail, "get message", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(MigrationError::NetworkError("connection reset".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(MigrationError::NetworkError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_acquired_before_every_attempt() {
        let client = client(3);
        let calls = Arc::new(AtomicU32::new(0));

        let _ = client
            .execute("tenant", ServiceClass::General, "get", || {
                let calls = calls.clone();
                async move {
                    match calls.fetch_add(1, Ordering::SeqCst) {
                        0 => Err(MigrationError::from_status(429, Some("1"), "")),
                        1 => Err(MigrationError::from_status(502, None, "")),
                        _ => Ok(()),
                    }
                }
            })
            .await;

        assert_eq!(client.limiter().stats().total_acquisitions, 3);
    }
}
