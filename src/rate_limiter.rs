//! Per-tenant, per-service token bucket rate limiter
//!
//! The Graph API enforces independent quotas per tenant and per service
//! surface. Each `(tenant, service class)` pair gets its own bucket:
//! - Buckets start full and refill continuously at `capacity / window`
//! - A call consumes one token
//! - When fewer than one token is available the caller sleeps for exactly
//!   the time needed to refill the deficit, then tries again
//!
//! Buckets are created lazily on first acquisition and live until
//! [`TenantRateLimiter::reset`] evicts every bucket of a tenant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Independently quota'd API surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceClass {
    /// Directory, groups and anything without a dedicated quota
    General,
    /// Exchange mailboxes: messages, folders, events, contacts
    Mail,
    /// OneDrive and SharePoint drives, sites and lists
    Files,
    /// Teams, channels, members and planner
    Teams,
    /// Channel message writes, which are limited far more strictly
    TeamsMessages,
}

impl ServiceClass {
    pub const ALL: [ServiceClass; 5] = [
        ServiceClass::General,
        ServiceClass::Mail,
        ServiceClass::Files,
        ServiceClass::Teams,
        ServiceClass::TeamsMessages,
    ];

    /// Built-in quota for this service class
    pub fn default_quota(&self) -> Quota {
        match self {
            ServiceClass::General => Quota::new(2_000, 60_000),
            // Exchange allows 10k requests per mailbox per 10 minutes
            ServiceClass::Mail => Quota::new(10_000, 600_000),
            ServiceClass::Files => Quota::new(1_200, 60_000),
            ServiceClass::Teams => Quota::new(30, 1_000),
            ServiceClass::TeamsMessages => Quota::new(1, 1_000),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceClass::General => "general",
            ServiceClass::Mail => "mail",
            ServiceClass::Files => "files",
            ServiceClass::Teams => "teams",
            ServiceClass::TeamsMessages => "teams_messages",
        }
    }
}

impl std::fmt::Display for ServiceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed `(capacity, window)` quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Requests allowed per window, also the burst size
    pub capacity: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl Quota {
    pub fn new(capacity: u32, window_ms: u64) -> Self {
        Self {
            capacity,
            window_ms,
        }
    }

    /// Tokens added per millisecond
    pub fn refill_rate_per_ms(&self) -> f64 {
        if self.window_ms == 0 {
            return 0.0;
        }
        self.capacity as f64 / self.window_ms as f64
    }
}

/// Token bucket for one `(tenant, service class)` key
///
/// Invariant: `0 <= tokens <= capacity` after every operation.
#[derive(Debug, Clone)]
pub struct RateLimitBucket {
    tokens: f64,
    capacity: f64,
    refill_rate_per_ms: f64,
    last_refill_at: Instant,
}

impl RateLimitBucket {
    /// Create a full bucket
    pub fn new(quota: Quota, now: Instant) -> Self {
        let capacity = quota.capacity as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_rate_per_ms: quota.refill_rate_per_ms(),
            last_refill_at: now,
        }
    }

    /// Add the tokens accrued since the last refill
    pub fn refill(&mut self, now: Instant) {
        // Instants earlier than the last refill add nothing
        let elapsed_ms = now
            .saturating_duration_since(self.last_refill_at)
            .as_secs_f64()
            * 1000.0;
        self.tokens = (self.tokens + elapsed_ms * self.refill_rate_per_ms).clamp(0.0, self.capacity);
        if now > self.last_refill_at {
            self.last_refill_at = now;
        }
    }

    /// Refill, then consume one token or report how long until one is available
    pub fn try_consume(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }

        Err(self.wait_for_token())
    }

    /// `ceil((1 - tokens) / refill_rate)` milliseconds, at least 1ms
    fn wait_for_token(&self) -> Duration {
        if self.refill_rate_per_ms <= 0.0 {
            // A zero quota never refills; poll slowly rather than spin
            return Duration::from_secs(1);
        }
        let wait_ms = ((1.0 - self.tokens) / self.refill_rate_per_ms).ceil().max(1.0);
        Duration::from_millis(wait_ms as u64)
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// Composite bucket key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub tenant_id: String,
    pub class: ServiceClass,
}

/// Rate limiter shared by every job running in the process
///
/// Cloning is cheap and clones share all buckets, so two jobs against the
/// same tenant draw from the same quota.
#[derive(Debug, Clone)]
pub struct TenantRateLimiter {
    inner: Arc<LimiterInner>,
}

#[derive(Debug)]
struct LimiterInner {
    buckets: DashMap<BucketKey, Arc<Mutex<RateLimitBucket>>>,
    quotas: HashMap<ServiceClass, Quota>,
    total_acquisitions: AtomicU64,
    delayed_acquisitions: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl TenantRateLimiter {
    /// Create a limiter with the built-in quotas
    pub fn new() -> Self {
        Self::with_quotas(std::iter::empty())
    }

    /// Create a limiter, overriding the built-in quota of some service classes
    pub fn with_quotas(overrides: impl IntoIterator<Item = (ServiceClass, Quota)>) -> Self {
        let mut quotas: HashMap<ServiceClass, Quota> = ServiceClass::ALL
            .iter()
            .map(|class| (*class, class.default_quota()))
            .collect();
        quotas.extend(overrides);

        Self {
            inner: Arc::new(LimiterInner {
                buckets: DashMap::new(),
                quotas,
                total_acquisitions: AtomicU64::new(0),
                delayed_acquisitions: AtomicU64::new(0),
                total_wait_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Quota in effect for a service class
    pub fn quota(&self, class: ServiceClass) -> Quota {
        self.inner
            .quotas
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_quota())
    }

    fn bucket(&self, tenant_id: &str, class: ServiceClass) -> Arc<Mutex<RateLimitBucket>> {
        let key = BucketKey {
            tenant_id: tenant_id.to_string(),
            class,
        };
        let quota = self.quota(class);
        // The map shard guard is released at the end of this statement,
        // before any await on the bucket itself
        self.inner
            .buckets
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(RateLimitBucket::new(quota, Instant::now()))))
            .clone()
    }

    /// Wait until one token is available for `(tenant_id, class)`, then consume it
    pub async fn acquire(&self, tenant_id: &str, class: ServiceClass) {
        let bucket = self.bucket(tenant_id, class);
        let started = Instant::now();
        let mut delayed = false;

        loop {
            let wait_time = {
                let mut state = bucket.lock().await;
                match state.try_consume(Instant::now()) {
                    Ok(()) => {
                        trace!(
                            tenant = tenant_id,
                            class = %class,
                            "Acquired token, {:.2} remaining",
                            state.tokens()
                        );
                        None
                    }
                    Err(wait) => Some(wait),
                }
            };

            let Some(wait_time) = wait_time else {
                break;
            };

            // Wait outside the lock so other acquirers can refill and consume
            delayed = true;
            debug!(
                tenant = tenant_id,
                class = %class,
                "Rate limit reached, waiting {}ms",
                wait_time.as_millis()
            );
            tokio::time::sleep(wait_time).await;
        }

        self.inner.total_acquisitions.fetch_add(1, Ordering::Relaxed);
        if delayed {
            self.inner.delayed_acquisitions.fetch_add(1, Ordering::Relaxed);
            self.inner
                .total_wait_ms
                .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        }
    }

    /// Consume a token only if one is available right now
    pub async fn try_acquire(&self, tenant_id: &str, class: ServiceClass) -> bool {
        let bucket = self.bucket(tenant_id, class);
        let mut state = bucket.lock().await;
        let acquired = state.try_consume(Instant::now()).is_ok();
        if acquired {
            self.inner.total_acquisitions.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    /// Tokens currently available, without consuming any
    ///
    /// A key that has never been used reports its full capacity.
    pub async fn remaining(&self, tenant_id: &str, class: ServiceClass) -> f64 {
        let key = BucketKey {
            tenant_id: tenant_id.to_string(),
            class,
        };
        let bucket = match self.inner.buckets.get(&key) {
            Some(entry) => Arc::clone(entry.value()),
            None => return self.quota(class).capacity as f64,
        };

        let mut state = bucket.lock().await;
        state.refill(Instant::now());
        state.tokens()
    }

    /// Drop every bucket belonging to a tenant
    ///
    /// Returns the number of buckets removed.
    pub fn reset(&self, tenant_id: &str) -> usize {
        let before = self.inner.buckets.len();
        self.inner.buckets.retain(|key, _| key.tenant_id != tenant_id);
        let removed = before.saturating_sub(self.inner.buckets.len());
        debug!(tenant = tenant_id, "Reset {} rate limit buckets", removed);
        removed
    }

    /// Get current statistics about limiter usage
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            buckets: self.inner.buckets.len(),
            total_acquisitions: self.inner.total_acquisitions.load(Ordering::Relaxed),
            delayed_acquisitions: self.inner.delayed_acquisitions.load(Ordering::Relaxed),
            total_wait_ms: self.inner.total_wait_ms.load(Ordering::Relaxed),
        }
    }
}

impl Default for TenantRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about limiter usage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    /// Live buckets
    pub buckets: usize,
    /// Tokens handed out since creation
    pub total_acquisitions: u64,
    /// Acquisitions that had to wait for a refill
    pub delayed_acquisitions: u64,
    /// Total time spent waiting for tokens
    pub total_wait_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_quotas() {
        assert_eq!(ServiceClass::General.default_quota(), Quota::new(2_000, 60_000));
        assert_eq!(ServiceClass::TeamsMessages.default_quota(), Quota::new(1, 1_000));
        assert!((Quota::new(30, 1_000).refill_rate_per_ms() - 0.03).abs() < f64::EPSILON);
        assert_eq!(Quota::new(10, 0).refill_rate_per_ms(), 0.0);
    }

    #[test]
    fn test_bucket_starts_full_and_reports_wait() {
        let t0 = Instant::now();
        let mut bucket = RateLimitBucket::new(Quota::new(2, 1_000), t0);

        assert!(bucket.try_consume(t0).is_ok());
        assert!(bucket.try_consume(t0).is_ok());

        // 2 tokens per second: one token takes 500ms
        assert_eq!(bucket.try_consume(t0), Err(Duration::from_millis(500)));

        // Half a token after 250ms, so 250ms more
        assert_eq!(
            bucket.try_consume(t0 + Duration::from_millis(250)),
            Err(Duration::from_millis(250))
        );
        assert!(bucket.try_consume(t0 + Duration::from_millis(500)).is_ok());
    }

    #[test]
    fn test_bucket_refill_is_capped() {
        let t0 = Instant::now();
        let mut bucket = RateLimitBucket::new(Quota::new(5, 1_000), t0);
        bucket.try_consume(t0).unwrap();
        bucket.refill(t0 + Duration::from_secs(3600));
        assert_eq!(bucket.tokens(), 5.0);
    }

    #[derive(Debug, Clone)]
    enum BucketOp {
        Advance(u64),
        Consume,
    }

    fn bucket_op() -> impl Strategy<Value = BucketOp> {
        prop_oneof![
            (0u64..5_000).prop_map(BucketOp::Advance),
            Just(BucketOp::Consume),
        ]
    }

    proptest! {
        #[test]
        fn prop_tokens_stay_within_bounds(
            capacity in 1u32..100,
            window_ms in 1u64..120_000,
            ops in proptest::collection::vec(bucket_op(), 0..200),
        ) {
            let t0 = Instant::now();
            let mut now = t0;
            let mut bucket = RateLimitBucket::new(Quota::new(capacity, window_ms), t0);

            for op in ops {
                match op {
                    BucketOp::Advance(ms) => {
                        now += Duration::from_millis(ms);
                        bucket.refill(now);
                    }
                    BucketOp::Consume => {
                        if let Err(wait) = bucket.try_consume(now) {
                            prop_assert!(wait >= Duration::from_millis(1));
                        }
                    }
                }
                prop_assert!(bucket.tokens() >= 0.0);
                prop_assert!(bucket.tokens() <= bucket.capacity());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = TenantRateLimiter::new();

        // TeamsMessages allows one request per second
        limiter.acquire("tenant-a", ServiceClass::TeamsMessages).await;

        let start = Instant::now();
        limiter.acquire("tenant-a", ServiceClass::TeamsMessages).await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(1_000), "waited {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1_100), "waited {:?}", elapsed);

        let stats = limiter.stats();
        assert_eq!(stats.total_acquisitions, 2);
        assert_eq!(stats.delayed_acquisitions, 1);
        assert!(stats.total_wait_ms >= 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenants_and_classes_are_isolated() {
        let limiter = TenantRateLimiter::new();

        limiter.acquire("tenant-a", ServiceClass::TeamsMessages).await;
        assert!(!limiter.try_acquire("tenant-a", ServiceClass::TeamsMessages).await);

        // Other tenant, same class
        assert!(limiter.try_acquire("tenant-b", ServiceClass::TeamsMessages).await);
        // Same tenant, other class
        assert!(limiter.try_acquire("tenant-a", ServiceClass::Teams).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquirers_share_bucket() {
        let limiter = TenantRateLimiter::with_quotas([(ServiceClass::General, Quota::new(2, 1_000))]);
        let start = Instant::now();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire("tenant-a", ServiceClass::General).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        // 2 immediately, then 4 more at 2 per second
        assert!(start.elapsed() >= Duration::from_millis(2_000));
        assert_eq!(limiter.stats().total_acquisitions, 6);
    }

    #[tokio::test]
    async fn test_remaining_and_reset() {
        let limiter = TenantRateLimiter::with_quotas([(ServiceClass::Files, Quota::new(10, 60_000))]);

        assert_eq!(limiter.remaining("tenant-a", ServiceClass::Files).await, 10.0);

        limiter.acquire("tenant-a", ServiceClass::Files).await;
        limiter.acquire("tenant-a", ServiceClass::Mail).await;
        limiter.acquire("tenant-b", ServiceClass::Files).await;
        assert!(limiter.remaining("tenant-a", ServiceClass::Files).await < 9.1);

        assert_eq!(limiter.reset("tenant-a"), 2);
        assert_eq!(limiter.stats().buckets, 1);
        assert_eq!(limiter.remaining("tenant-a", ServiceClass::Files).await, 10.0);
        assert!(limiter.remaining("tenant-b", ServiceClass::Files).await < 9.1);
    }
}
