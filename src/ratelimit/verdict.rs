//! The result of one rate-limit decision.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// An allow/deny decision with the quota metadata reported to the caller.
///
/// A denial always carries `remaining == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    allowed: bool,
    remaining: u64,
    reset_at: DateTime<Utc>,
}

impl Verdict {
    /// An admitted request with `remaining` units left.
    pub fn allow(remaining: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
        }
    }

    /// A rejected request.
    pub fn deny(reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
        }
    }

    /// Whether the request may proceed.
    pub fn allowed(&self) -> bool {
        self.allowed
    }

    /// Quota units usable before the next denial.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// When quota is next expected back.
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.reset_at
    }

    /// Whole seconds from `now` until `reset_at`, rounded up, never negative.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        Duration::from_secs(millis.div_ceil(1000))
    }
}
