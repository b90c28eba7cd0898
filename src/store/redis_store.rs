//! Redis-backed shared counter store.
//!
//! Both operations are server-side scripts, which Redis executes without
//! interleaving any other command: fixed windows run `INCR` plus a first-hit
//! `PEXPIRE`, and the token bucket runs [`TAKE_TOKEN_SCRIPT`].

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, RedisError, Script};
use std::fmt;
use std::time::Duration;
use tracing::trace;

use super::bucket::{BucketOutcome, BucketParams, TAKE_TOKEN_SCRIPT};
use super::CounterStore;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

/// `INCR` and, only when that created the key, `PEXPIRE` in one step, so a
/// counter can never be left without an expiry. `ARGV[1]` is the TTL in
/// milliseconds.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// A [`CounterStore`] shared by every service instance through Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    increment_script: Script,
    take_token_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("increment_script", &self.increment_script.get_hash())
            .field("take_token_script", &self.take_token_script.get_hash())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect using the address, password and database from `config`.
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let mut info = format!("redis://{}", config.address).into_connection_info()?;
        info.redis.db = config.db;
        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
        }
        Self::open(Client::open(info)?).await
    }

    /// Connect to a Redis URL such as `redis://127.0.0.1/`.
    pub async fn connect_url(url: &str) -> StoreResult<Self> {
        Self::open(Client::open(url)?).await
    }

    async fn open(client: Client) -> StoreResult<Self> {
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            increment_script: Script::new(INCREMENT_SCRIPT),
            take_token_script: Script::new(TAKE_TOKEN_SCRIPT),
        })
    }
}

/// Whole milliseconds, at least one; Redis rejects a zero TTL.
fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// A reply that could not be converted is a shape problem, not a transport one.
fn classify(err: RedisError) -> StoreError {
    if err.kind() == redis::ErrorKind::TypeError {
        StoreError::Decode(err.to_string())
    } else {
        StoreError::Redis(err)
    }
}

/// Decode `{allowed, tokens, ts}` as returned by the script.
fn parse_outcome(reply: &[String]) -> StoreResult<BucketOutcome> {
    let [allowed, tokens, ..] = reply else {
        return Err(StoreError::Decode(format!(
            "expected at least 2 fields from token bucket script, got {:?}",
            reply
        )));
    };

    let allowed = match allowed.as_str() {
        "1" => true,
        "0" => false,
        other => {
            return Err(StoreError::Decode(format!(
                "allowed flag should be 0 or 1, got {:?}",
                other
            )))
        }
    };
    let tokens: f64 = tokens
        .parse()
        .map_err(|_| StoreError::Decode(format!("token count is not a number: {:?}", tokens)))?;

    Ok(BucketOutcome { allowed, tokens })
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.connection.clone();
        let count: i64 = self
            .increment_script
            .key(key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;
        trace!(key = %key, count = count, "INCR");
        Ok(count)
    }

    async fn take_token(
        &self,
        key: &str,
        params: &BucketParams,
        now: f64,
    ) -> StoreResult<BucketOutcome> {
        let mut conn = self.connection.clone();
        let reply: Vec<String> = self
            .take_token_script
            .key(key)
            .arg(params.capacity)
            .arg(params.refill_rate)
            .arg(format!("{:.6}", now))
            .arg(ttl_millis(params.idle_ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        trace!(key = %key, reply = ?reply, "Token bucket script");
        parse_outcome(&reply)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
