//! The token-bucket read-modify-write transaction.
//!
//! Both store adapters run exactly this step as one indivisible unit: the
//! memory store under the key's entry lock, Redis as [`TAKE_TOKEN_SCRIPT`].

use std::time::Duration;

/// Inputs to one bucket transaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    /// Maximum number of tokens the bucket holds
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Expiry applied to the stored state after every access
    pub idle_ttl: Duration,
}

/// Persisted bucket state, stored as `{tokens, ts}`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens currently available, fractional
    pub tokens: f64,
    /// Epoch seconds of the last refill
    pub last_refill: f64,
}

/// What the transaction reports back to the limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether a token was taken
    pub allowed: bool,
    /// Tokens left after the decision
    pub tokens: f64,
}

/// Refill the bucket up to `now` and try to take one token.
///
/// A missing state starts full. Time running backwards counts as zero
/// elapsed, and a zero-elapsed access leaves `last_refill` where it was.
pub fn take_token(
    state: Option<BucketState>,
    now: f64,
    params: &BucketParams,
) -> (BucketState, BucketOutcome) {
    let mut state = match state {
        None => BucketState {
            tokens: params.capacity,
            last_refill: now,
        },
        Some(mut state) => {
            let elapsed = (now - state.last_refill).max(0.0);
            state.tokens = (state.tokens + elapsed * params.refill_rate).min(params.capacity);
            if elapsed > 0.0 {
                state.last_refill = now;
            }
            state
        }
    };

    let allowed = state.tokens >= 1.0;
    if allowed {
        state.tokens -= 1.0;
    }

    (
        state,
        BucketOutcome {
            allowed,
            tokens: state.tokens,
        },
    )
}

/// Server-side version of [`take_token`].
///
/// `KEYS[1]` is the bucket key; `ARGV` is capacity, refill rate, now (epoch
/// seconds) and the idle TTL in milliseconds. Numbers are stored and returned
/// as `%.17g` strings: fractional token counts survive Redis' integer reply
/// conversion, and a stored `ts` reads back as exactly the `now` it came from.
/// Lua's `tostring` keeps only 14 significant digits, which is too coarse for
/// an epoch timestamp.
pub const TAKE_TOKEN_SCRIPT: &str = r#"
local function num(x)
  return string.format('%.17g', x)
end

local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])

if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
else
  local elapsed = now - ts
  if elapsed < 0 then elapsed = 0 end
  tokens = math.min(capacity, tokens + elapsed * rate)
  if elapsed > 0 then ts = now end
end

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

redis.call('HSET', key, 'tokens', num(tokens), 'ts', num(ts))
redis.call('PEXPIRE', key, ttl_ms)

return {tostring(allowed), num(tokens), num(ts)}
"#;
