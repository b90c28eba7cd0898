//! Token-bucket limiter with continuous refill.
//!
//! The bucket for a caller lives under `{prefix}:tb:{caller}` and is updated
//! by a single store transaction per decision. `remaining` and `reset_at` are
//! derived afterwards from the transaction's output:
//!
//! - allowed: `reset_at` is when the bucket is full again
//! - denied: `reset_at` is when the next token becomes available

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
use crate::store::{BucketOutcome, BucketParams, CounterStore};

/// Shortest window the refill rate is derived from.
const MIN_WINDOW: Duration = Duration::from_millis(1);

/// Allows bursts of up to `capacity` requests, refilling `capacity` tokens
/// per window.
pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
    capacity: u64,
    params: BucketParams,
    prefix: String,
}

impl TokenBucketLimiter {
    /// Create a limiter; `capacity` and `window` must both be positive.
    ///
    /// `idle_ttl` bounds how long an unused bucket is kept; twice the window
    /// is a sensible value.
    pub fn new(
        store: Arc<dyn CounterStore>,
        capacity: u64,
        window: Duration,
        idle_ttl: Duration,
        prefix: impl Into<String>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(TurnstileError::Config(
                "token bucket capacity must be positive".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(TurnstileError::Config(
                "token bucket window must be positive".to_string(),
            ));
        }
        if window > MAX_WINDOW {
            return Err(TurnstileError::Config(format!(
                "token bucket window must not exceed {}s",
                MAX_WINDOW.as_secs()
            )));
        }

        let mut prefix = prefix.into();
        if prefix.is_empty() {
            prefix = DEFAULT_KEY_PREFIX.to_string();
        }

        let window = window.max(MIN_WINDOW);
        let idle_ttl = if idle_ttl.is_zero() { window * 2 } else { idle_ttl };

        Ok(Self {
            store,
            capacity,
            params: BucketParams {
                capacity: capacity as f64,
                refill_rate: capacity as f64 / window.as_secs_f64(),
                idle_ttl,
            },
            prefix,
        })
    }

    /// Store key for `caller`'s bucket.
    pub fn key_for(&self, caller: &CallerKey) -> String {
        format!("{}:tb:{}", self.prefix, caller)
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.params.refill_rate
    }

    /// Turn a transaction outcome into the verdict reported to the caller.
    fn verdict(&self, outcome: BucketOutcome, now: DateTime<Utc>) -> Verdict {
        let tokens = outcome.tokens.max(0.0);
        let missing = if outcome.allowed {
            self.params.capacity - tokens
        } else {
            1.0 - tokens
        };
        let seconds = (missing.max(0.0) / self.params.refill_rate).ceil() as i64;
        let reset_at = now + chrono::Duration::seconds(seconds);

        if outcome.allowed {
            Verdict::allow(tokens.floor() as u64, reset_at)
        } else {
            Verdict::deny(reset_at)
        }
    }
}

/// Epoch seconds with microsecond resolution.
fn epoch_seconds(now: DateTime<Utc>) -> f64 {
    now.timestamp_micros() as f64 / 1_000_000.0
}

#[async_trait]
impl RateLimiterBackend for TokenBucketLimiter {
    async fn allow(&self, key: &CallerKey, now: DateTime<Utc>) -> StoreResult<Verdict> {
        let store_key = self.key_for(key);
        trace!(key = %key, store_key = %store_key, "Checking token bucket");

        let outcome = self
            .store
            .take_token(&store_key, &self.params, epoch_seconds(now))
            .await?;

        let verdict = self.verdict(outcome, now);
        if !verdict.allowed() {
            debug!(key = %key, tokens = outcome.tokens, "Token bucket empty");
        }
        Ok(verdict)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn limit(&self) -> u64 {
        self.capacity
    }
}
