//! Shared counter store port and its adapters.
//!
//! All mutable rate-limit state lives behind [`CounterStore`]. Limiters never
//! read a value and write it back in two calls; every read-modify-write is a
//! single store operation so concurrent instances cannot interleave.

mod bucket;
mod memory;
mod redis_store;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use bucket::{take_token, BucketOutcome, BucketParams, BucketState, TAKE_TOKEN_SCRIPT};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Result, StoreResult};

/// Primitive operations the decision engine needs from the shared store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to the integer at `key`, creating it at zero, and
    /// return the new value. A key created by this call expires after `ttl`;
    /// an existing key keeps its expiry.
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// Run the token-bucket transaction against `key` as one indivisible
    /// operation. `now` is in epoch seconds.
    async fn take_token(
        &self,
        key: &str,
        params: &BucketParams,
        now: f64,
    ) -> StoreResult<BucketOutcome>;

    /// Adapter name for logs.
    fn name(&self) -> &'static str;
}

/// Open the store selected by `config`.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(config).await?;
            info!(address = %config.address, db = config.db, "Connected to Redis");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; limits are not shared between instances");
            let store = Arc::new(MemoryStore::new());
            store.spawn_purger(config.purge_interval());
            Ok(store)
        }
    }
}
