//! In-process store backed by a sharded concurrent map.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::bucket::{take_token, BucketOutcome, BucketParams, BucketState};
use super::CounterStore;
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy)]
enum Value {
    Counter(i64),
    Bucket(BucketState),
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A [`CounterStore`] that keeps state in this process.
///
/// Each operation holds the shard lock for its key for the whole
/// read-modify-write, which gives the same per-key serialization Redis does.
/// State is not shared with other processes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired key.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        debug!(purged = before.saturating_sub(self.entries.len()), "Purged expired keys");
    }

    /// Purge expired keys every `every` until the store is dropped.
    pub fn spawn_purger(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => store.purge_expired(),
                    None => break,
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let now = Instant::now();
        let created = || Slot {
            value: Value::Counter(0),
            expires_at: now.checked_add(ttl),
        };

        let mut slot = self.entries.entry(key.to_string()).or_insert_with(created);
        if slot.is_expired(now) {
            *slot = created();
        }

        match &mut slot.value {
            Value::Counter(count) => {
                *count += 1;
                trace!(key = %key, count = *count, "Incremented counter");
                Ok(*count)
            }
            Value::Bucket(_) => Err(StoreError::Decode(format!(
                "key {} holds a token bucket, not a counter",
                key
            ))),
        }
    }

    async fn take_token(
        &self,
        key: &str,
        params: &BucketParams,
        now: f64,
    ) -> StoreResult<BucketOutcome> {
        let instant = Instant::now();
        let fresh = |state: BucketState| Slot {
            value: Value::Bucket(state),
            expires_at: instant.checked_add(params.idle_ttl),
        };

        let outcome = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = *occupied.get();
                let current = match slot.value {
                    _ if slot.is_expired(instant) => None,
                    Value::Bucket(state) => Some(state),
                    Value::Counter(_) => {
                        return Err(StoreError::Decode(format!(
                            "key {} holds a counter, not a token bucket",
                            key
                        )))
                    }
                };
                let (state, outcome) = take_token(current, now, params);
                occupied.insert(fresh(state));
                outcome
            }
            Entry::Vacant(vacant) => {
                let (state, outcome) = take_token(None, now, params);
                vacant.insert(fresh(state));
                outcome
            }
        };

        trace!(key = %key, allowed = outcome.allowed, tokens = outcome.tokens, "Token bucket step");
        Ok(outcome)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BucketParams {
        BucketParams {
            capacity: 2.0,
            refill_rate: 2.0,
            idle_ttl: Duration::from_secs(60),
        }
    }

    const LONG: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_increment_creates_at_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("a", LONG).await.unwrap(), 1);
        assert_eq!(store.increment("a", LONG).await.unwrap(), 2);
        assert_eq!(store.increment("b", LONG).await.unwrap(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_expired_counter_restarts() {
        let store = MemoryStore::new();
        let short = Duration::from_millis(10);
        store.increment("a", short).await.unwrap();
        store.increment("a", short).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.increment("a", short).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ttl_only_applies_on_creation() {
        let store = MemoryStore::new();
        store.increment("a", Duration::from_millis(10)).await.unwrap();
        // A later, longer ttl must not extend the window.
        store.increment("a", LONG).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.increment("a", LONG).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_huge_ttl_never_expires() {
        let store = MemoryStore::new();
        store.increment("a", Duration::MAX).await.unwrap();
        store.purge_expired();
        assert_eq!(store.increment("a", Duration::MAX).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.increment("short", Duration::from_millis(5)).await.unwrap();
        store.increment("long", LONG).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.purge_expired();

        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_purger_stops_with_store() {
        let store = Arc::new(MemoryStore::new());
        store.increment("k", Duration::from_millis(1)).await.unwrap();

        let handle = store.spawn_purger(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());

        drop(store);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_take_token_persists_state() {
        let store = MemoryStore::new();
        let p = params();

        assert!(store.take_token("tb", &p, 10.0).await.unwrap().allowed);
        assert!(store.take_token("tb", &p, 10.0).await.unwrap().allowed);
        let outcome = store.take_token("tb", &p, 10.0).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.tokens, 0.0);
    }

    #[tokio::test]
    async fn test_idle_bucket_expires_full() {
        let store = MemoryStore::new();
        let p = BucketParams {
            idle_ttl: Duration::from_millis(5),
            ..params()
        };

        store.take_token("tb", &p, 10.0).await.unwrap();
        store.take_token("tb", &p, 10.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The caller clock has not moved; only expiry can refill the bucket.
        let outcome = store.take_token("tb", &p, 10.0).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.tokens, 1.0);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_decode_error() {
        let store = MemoryStore::new();
        store.increment("k", LONG).await.unwrap();
        let err = store.take_token("k", &params(), 1.0).await.unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("shared", LONG).await.unwrap() })
            })
            .collect();

        let mut seen: Vec<i64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        seen.sort_unstable();

        assert_eq!(seen, (1..=64).collect::<Vec<_>>());
    }
}
