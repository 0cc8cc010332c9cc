//! Rate limit admission results.

use crate::error::ResilienceError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current allowance
    pub remaining: u32,
    /// Configured limit (bucket capacity for token buckets)
    pub limit: u32,
    /// When the allowance is fully restored
    pub reset_at: DateTime<Utc>,
    /// How long a denied caller should wait; zero when allowed
    pub retry_after: Duration,
}

impl RateLimitDecision {
    /// Convert a denial into a `RateLimitExceeded` error.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitExceeded` carrying the `retry_after` hint when the
    /// request was denied.
    pub fn into_result(self, service_name: &str) -> Result<Self, ResilienceError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(ResilienceError::rate_limit_exceeded(service_name, self.retry_after)
                .with_metadata("limit", self.limit.to_string()))
        }
    }

    /// Header view of this decision.
    #[must_use]
    pub fn headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining,
            reset: self.reset_at.timestamp(),
        }
    }
}

/// Values for `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    /// Configured limit
    pub limit: u32,
    /// Requests left
    pub remaining: u32,
    /// Unix timestamp (seconds) when the allowance resets
    pub reset: i64,
}

impl RateLimitHeaders {
    /// Header name/value pairs.
    #[must_use]
    pub fn to_header_pairs(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset.to_string()),
        ]
    }
}

/// Value for a `Retry-After` header, rounded up to whole seconds.
#[must_use]
pub fn retry_after_header(retry_after: Duration) -> String {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.to_string()
}
