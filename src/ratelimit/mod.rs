//! Rate limiting decisions.

mod backend;
mod caller;
mod fixed_window;
mod token_bucket;
mod verdict;

pub use backend::{build_limiter, Algorithm, RateLimiterBackend};
pub use caller::{client_address, CallerKey, SESSION_COOKIE};
pub use fixed_window::FixedWindowLimiter;
pub use token_bucket::TokenBucketLimiter;
pub use verdict::Verdict;

/// Key prefix used when a limiter is given an empty one.
pub const DEFAULT_KEY_PREFIX: &str = "rl";

/// Longest window a limiter accepts: 365 days.
pub const MAX_WINDOW: std::time::Duration = std::time::Duration::from_secs(365 * 24 * 60 * 60);
