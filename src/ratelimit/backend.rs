//! Rate limiter trait for abstracting over the decision algorithms.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::caller::CallerKey;
use super::fixed_window::FixedWindowLimiter;
use super::token_bucket::TokenBucketLimiter;
use super::verdict::Verdict;
use crate::config::LimiterConfig;
use crate::error::{Result, StoreError, StoreResult};
use crate::store::CounterStore;

/// Trait for rate limiter implementations.
///
/// Implementations hold no mutable state of their own; everything that
/// changes between calls lives in the [`CounterStore`], so one instance can be
/// shared by every request task.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Decide whether `key` may make a request at `now`.
    ///
    /// A store failure is returned as an error, never as a verdict.
    async fn allow(&self, key: &CallerKey, now: DateTime<Utc>) -> StoreResult<Verdict>;

    /// The algorithm this limiter runs.
    fn algorithm(&self) -> Algorithm;

    /// Requests per window, or bucket capacity.
    fn limit(&self) -> u64;

    /// [`allow`](Self::allow) bounded by `deadline`.
    ///
    /// Running out of time is reported as [`StoreError::Timeout`]. The
    /// abandoned store operation is atomic, so it either applied fully or not
    /// at all.
    async fn allow_within(
        &self,
        key: &CallerKey,
        now: DateTime<Utc>,
        deadline: Duration,
    ) -> StoreResult<Verdict> {
        match tokio::time::timeout(deadline, self.allow(key, now)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(deadline)),
        }
    }
}

/// Available decision algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter per clock-aligned window
    FixedWindow,
    /// Continuously refilling bucket
    #[default]
    TokenBucket,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::FixedWindow => write!(f, "fixed_window"),
            Algorithm::TokenBucket => write!(f, "token_bucket"),
        }
    }
}

/// Build the limiter selected by `config` on top of `store`.
pub fn build_limiter(
    config: &LimiterConfig,
    store: Arc<dyn CounterStore>,
) -> Result<Arc<dyn RateLimiterBackend>> {
    let limiter: Arc<dyn RateLimiterBackend> = match config.algorithm {
        Algorithm::FixedWindow => Arc::new(FixedWindowLimiter::new(
            store,
            config.limit,
            config.window(),
            config.key_prefix.clone(),
        )?),
        Algorithm::TokenBucket => Arc::new(TokenBucketLimiter::new(
            store,
            config.limit,
            config.window(),
            config.idle_ttl(),
            config.key_prefix.clone(),
        )?),
    };
    Ok(limiter)
}
