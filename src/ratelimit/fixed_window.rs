//! Fixed-window counter limiter.
//!
//! Each caller gets one counter per clock-aligned window, stored under
//! `{prefix}:{caller}:{window_start_epoch_secs}`. A burst straddling a window
//! boundary can therefore admit up to twice the limit in a short span; that
//! is how fixed windows behave and is kept as-is.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::{Algorithm, RateLimiterBackend};
use super::caller::CallerKey;
use super::verdict::Verdict;
use super::{DEFAULT_KEY_PREFIX, MAX_WINDOW};
use crate::error::{Result, StoreResult, TurnstileError};
use crate::store::CounterStore;

/// Millisecond bounds of the window containing an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WindowBounds {
    start_ms: i64,
    end_ms: i64,
}

impl WindowBounds {
    /// Truncate `now_ms` down to a multiple of `window_ms`.
    fn containing(now_ms: i64, window_ms: i64) -> Self {
        let window_ms = window_ms.max(1);
        let start_ms = now_ms.div_euclid(window_ms) * window_ms;
        Self {
            start_ms,
            end_ms: start_ms + window_ms,
        }
    }

    fn start_secs(&self) -> i64 {
        self.start_ms.div_euclid(1000)
    }
}

/// Allows `limit` requests per caller in every window.
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    limit: u64,
    window: Duration,
    prefix: String,
}

impl FixedWindowLimiter {
    /// Create a limiter; `limit` must be positive and `window` between one
    /// second and [`MAX_WINDOW`].
    pub fn new(
        store: Arc<dyn CounterStore>,
        limit: u64,
        window: Duration,
        prefix: impl Into<String>,
    ) -> Result<Self> {
        if limit == 0 {
            return Err(TurnstileError::Config(
                "fixed window limit must be positive".to_string(),
            ));
        }
        // Window starts are keyed in whole seconds.
        if window < Duration::from_secs(1) {
            return Err(TurnstileError::Config(
                "fixed window duration must be at least one second".to_string(),
            ));
        }
        if window > MAX_WINDOW {
            return Err(TurnstileError::Config(format!(
                "fixed window duration must not exceed {}s",
                MAX_WINDOW.as_secs()
            )));
        }

        let mut prefix = prefix.into();
        if prefix.is_empty() {
            prefix = DEFAULT_KEY_PREFIX.to_string();
        }

        Ok(Self {
            store,
            limit,
            window,
            prefix,
        })
    }

    fn window_millis(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX).max(1)
    }

    /// Store key for `caller` in the window starting at `window_start_secs`.
    pub fn key_for(&self, caller: &CallerKey, window_start_secs: i64) -> String {
        format!("{}:{}:{}", self.prefix, caller, window_start_secs)
    }
}

#[async_trait]
impl RateLimiterBackend for FixedWindowLimiter {
    async fn allow(&self, key: &CallerKey, now: DateTime<Utc>) -> StoreResult<Verdict> {
        let now_ms = now.timestamp_millis();
        let bounds = WindowBounds::containing(now_ms, self.window_millis());
        let until_end_ms = bounds.end_ms - now_ms;
        let reset_at = now + chrono::Duration::milliseconds(until_end_ms);
        let store_key = self.key_for(key, bounds.start_secs());

        trace!(key = %key, store_key = %store_key, "Checking fixed window");

        // Only applied if this call creates the window's counter.
        let ttl = if until_end_ms > 0 {
            Duration::from_millis(until_end_ms as u64)
        } else {
            self.window
        };
        let count = self.store.increment(&store_key, ttl).await?;

        let limit = i64::try_from(self.limit).unwrap_or(i64::MAX);
        if count <= limit {
            Ok(Verdict::allow((limit - count) as u64, reset_at))
        } else {
            debug!(key = %key, count = count, limit = limit, "Fixed window limit exceeded");
            Ok(Verdict::deny(reset_at))
        }
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    fn limit(&self) -> u64 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{BucketOutcome, BucketParams, MemoryStore};
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn limiter(limit: u64, window_secs: u64) -> FixedWindowLimiter {
        FixedWindowLimiter::new(
            Arc::new(MemoryStore::new()),
            limit,
            Duration::from_secs(window_secs),
            "rl",
        )
        .unwrap()
    }

    fn at(secs: i64, millis: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, millis * 1_000_000).unwrap()
    }

    fn key(value: &str) -> CallerKey {
        CallerKey::new(value).unwrap()
    }

    #[test]
    fn test_window_bounds() {
        let bounds = WindowBounds::containing(61_500, 60_000);
        assert_eq!(bounds.start_ms, 60_000);
        assert_eq!(bounds.end_ms, 120_000);
        assert_eq!(bounds.start_secs(), 60);

        let on_boundary = WindowBounds::containing(120_000, 60_000);
        assert_eq!(on_boundary.start_ms, 120_000);
    }

    #[test]
    fn test_window_bounds_before_epoch() {
        let bounds = WindowBounds::containing(-500, 1_000);
        assert_eq!(bounds.start_ms, -1_000);
        assert_eq!(bounds.end_ms, 0);
    }

    #[test]
    fn test_rejects_non_positive_parameters() {
        let store: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());
        assert!(FixedWindowLimiter::new(store.clone(), 0, Duration::from_secs(1), "rl").is_err());
        assert!(FixedWindowLimiter::new(store.clone(), 1, Duration::ZERO, "rl").is_err());
        assert!(
            FixedWindowLimiter::new(store.clone(), 1, Duration::from_millis(500), "rl").is_err()
        );
        assert!(FixedWindowLimiter::new(store.clone(), 1, MAX_WINDOW * 2, "rl").is_err());
        assert!(FixedWindowLimiter::new(store.clone(), 1, MAX_WINDOW, "rl").is_ok());
        assert!(
            FixedWindowLimiter::new(store, 1, Duration::from_millis(1_500), "rl").is_ok()
        );
    }

    #[tokio::test]
    async fn test_fractional_windows_get_distinct_keys() {
        let limiter = FixedWindowLimiter::new(
            Arc::new(MemoryStore::new()),
            1,
            Duration::from_millis(1_500),
            "rl",
        )
        .unwrap();
        let caller = key("userC");

        // Windows [99.0, 100.5) and [100.5, 102.0) start in different seconds.
        assert!(limiter.allow(&caller, at(100, 0)).await.unwrap().allowed());
        assert!(!limiter.allow(&caller, at(100, 400)).await.unwrap().allowed());
        assert!(limiter.allow(&caller, at(100, 600)).await.unwrap().allowed());
    }

    #[test]
    fn test_key_layout() {
        let limiter = limiter(3, 1);
        assert_eq!(limiter.key_for(&key("userA"), 1_700_000_000), "rl:userA:1700000000");

        let unprefixed =
            FixedWindowLimiter::new(Arc::new(MemoryStore::new()), 3, Duration::from_secs(1), "")
                .unwrap();
        assert_eq!(unprefixed.key_for(&key("u"), 5), "rl:u:5");
    }

    #[tokio::test]
    async fn test_allows_up_to_limit_then_denies() {
        let limiter = limiter(3, 1);
        let caller = key("userA");
        let now = at(1_000, 0);

        let mut allowed = Vec::new();
        for i in 0..5 {
            let verdict = limiter
                .allow(&caller, now + chrono::Duration::milliseconds(i * 100))
                .await
                .unwrap();
            allowed.push(verdict.allowed());
        }

        assert_eq!(allowed, vec![true, true, true, false, false]);
    }

    #[tokio::test]
    async fn test_remaining_and_reset() {
        let limiter = limiter(3, 60);
        let caller = key("userA");
        let now = at(1_210, 250);

        let first = limiter.allow(&caller, now).await.unwrap();
        assert_eq!(first.remaining(), 2);
        assert_eq!(first.reset_at(), at(1_260, 0));

        limiter.allow(&caller, now).await.unwrap();
        limiter.allow(&caller, now).await.unwrap();
        let denied = limiter.allow(&caller, now).await.unwrap();
        assert!(!denied.allowed());
        assert_eq!(denied.remaining(), 0);
        assert_eq!(denied.reset_at(), at(1_260, 0));
    }

    #[tokio::test]
    async fn test_window_reset() {
        let limiter = limiter(3, 1);
        let caller = key("userB");
        let start = at(2_000, 0);

        let mut allowed = Vec::new();
        for _ in 0..3 {
            allowed.push(limiter.allow(&caller, start).await.unwrap().allowed());
        }
        // 1.1 seconds later the next window has begun.
        let later = start + chrono::Duration::milliseconds(1_100);
        allowed.push(limiter.allow(&caller, later).await.unwrap().allowed());

        assert_eq!(allowed, vec![true, true, true, true]);
    }

    #[tokio::test]
    async fn test_boundary_burst() {
        let limiter = limiter(2, 1);
        let caller = key("bursty");

        let end_of_window = at(3_000, 999);
        let next_window = at(3_001, 0);

        assert!(limiter.allow(&caller, end_of_window).await.unwrap().allowed());
        assert!(limiter.allow(&caller, end_of_window).await.unwrap().allowed());
        assert!(!limiter.allow(&caller, end_of_window).await.unwrap().allowed());

        // One millisecond later the quota is whole again.
        assert!(limiter.allow(&caller, next_window).await.unwrap().allowed());
        assert!(limiter.allow(&caller, next_window).await.unwrap().allowed());
    }

    #[tokio::test]
    async fn test_callers_are_independent() {
        let limiter = limiter(1, 1);
        let now = at(4_000, 0);

        assert!(limiter.allow(&key("a"), now).await.unwrap().allowed());
        assert!(limiter.allow(&key("b"), now).await.unwrap().allowed());
        assert!(!limiter.allow(&key("a"), now).await.unwrap().allowed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls() {
        let limiter = Arc::new(limiter(10, 60));
        let now = at(5_000, 0);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow(&key("shared"), now).await.unwrap() })
            })
            .collect();

        let verdicts: Vec<Verdict> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(verdicts.iter().filter(|v| v.allowed()).count(), 10);
        assert_eq!(verdicts.iter().filter(|v| !v.allowed()).count(), 40);
    }

    /// Records the ttl of every increment and fails on request.
    #[derive(Default)]
    struct FlakyStore {
        fail_increment: bool,
        ttls: Mutex<Vec<Duration>>,
        inner: MemoryStore,
    }

    #[async_trait]
    impl CounterStore for FlakyStore {
        async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
            if self.fail_increment {
                return Err(StoreError::Decode("boom".to_string()));
            }
            self.ttls.lock().unwrap().push(ttl);
            self.inner.increment(key, ttl).await
        }

        async fn take_token(
            &self,
            key: &str,
            params: &BucketParams,
            now: f64,
        ) -> StoreResult<BucketOutcome> {
            self.inner.take_token(key, params, now).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_not_a_verdict() {
        let store = Arc::new(FlakyStore {
            fail_increment: true,
            ..FlakyStore::default()
        });
        let limiter = FixedWindowLimiter::new(store, 3, Duration::from_secs(1), "rl").unwrap();

        let result = limiter.allow(&key("x"), at(6_000, 0)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ttl_runs_to_window_end() {
        let store = Arc::new(FlakyStore::default());
        let limiter =
            FixedWindowLimiter::new(store.clone(), 3, Duration::from_secs(60), "rl").unwrap();

        limiter.allow(&key("x"), at(7_200, 0)).await.unwrap();
        limiter.allow(&key("x"), at(7_230, 500)).await.unwrap();

        let ttls = store.ttls.lock().unwrap().clone();
        assert_eq!(
            ttls,
            vec![Duration::from_secs(60), Duration::from_millis(29_500)]
        );
    }
}
