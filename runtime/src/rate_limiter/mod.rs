//! Admission control: three interchangeable rate limiting algorithms.
//!
//! ```text
//! Token Bucket     continuous refill at R tokens/s, bursts up to capacity
//! Sliding Window   at most `limit` requests in any window ending now
//! Fixed Window     at most `limit` requests per discrete window
//! ```
//!
//! Every limiter keeps per-key state in a map guarded by one lock per
//! instance. Calls never fail; a denial is a [`RateLimitDecision`] with
//! `allowed == false` and a `retry_after` hint.
//!
//! ## Usage
//!
//! ```
//! use resilience_runtime::rate_limiter::{RateLimiter, TokenBucket};
//!
//! let limiter = TokenBucket::new("login", 3, 10.0).unwrap();
//! let decision = limiter.allow(&"user-42".to_string());
//! assert!(decision.allowed);
//! assert_eq!(decision.remaining, 2);
//! ```
//!
//! Key maps are unbounded. Long-running processes with high key cardinality
//! should call [`RateLimiter::evict_idle`] periodically; it only drops keys
//! whose state is indistinguishable from a key never seen before.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use crate::metrics::RateLimitMetrics;
use chrono::{DateTime, TimeDelta, Utc};
use resilience_core::config::{RateLimitAlgorithm, RateLimitConfig};
use resilience_core::environment::{Clock, SystemClock};
use resilience_core::event::{EventSink, EventType, NoopEventSink, ResilienceEvent};
use resilience_core::rate_limit::{RateLimitDecision, RateLimitHeaders};
use resilience_core::ResilienceError;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// Common contract of the rate limiting algorithms.
pub trait RateLimiter<K = String>: Send + Sync {
    /// Admission check for `key`. Consumes allowance when allowed.
    fn allow(&self, key: &K) -> RateLimitDecision;

    /// Current allowance for `key` without consuming any.
    fn headers(&self, key: &K) -> RateLimitHeaders;

    /// Drop keys idle for at least `idle_for` whose state equals a fresh key.
    ///
    /// Returns the number of keys removed.
    fn evict_idle(&self, idle_for: Duration) -> usize;

    /// Number of keys currently tracked.
    fn tracked_keys(&self) -> usize;

    /// Limiter name used in logs, events and metrics.
    fn name(&self) -> &str;
}

/// Bounds a rate limiter key must satisfy.
pub trait LimiterKey: Eq + Hash + Clone + Display + Send + Sync {}

impl<T: Eq + Hash + Clone + Display + Send + Sync> LimiterKey for T {}

/// Build a limiter for `config.algorithm`.
///
/// # Errors
///
/// Returns `InvalidPolicy` if the config is invalid.
pub fn build_rate_limiter<K: LimiterKey + 'static>(
    name: &str,
    config: &RateLimitConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
) -> Result<Box<dyn RateLimiter<K>>, ResilienceError> {
    config.validate()?;
    let limiter: Box<dyn RateLimiter<K>> = match config.algorithm {
        RateLimitAlgorithm::TokenBucket => Box::new(
            TokenBucket::from_config(name, config)?
                .with_clock(clock)
                .with_event_sink(events),
        ),
        RateLimitAlgorithm::SlidingWindow => Box::new(
            SlidingWindow::from_config(name, config)?
                .with_clock(clock)
                .with_event_sink(events),
        ),
        RateLimitAlgorithm::FixedWindow => Box::new(
            FixedWindow::from_config(name, config)?
                .with_clock(clock)
                .with_event_sink(events),
        ),
    };
    Ok(limiter)
}

/// Name, clock and sinks shared by every limiter.
struct LimiterHooks {
    name: String,
    algorithm: RateLimitAlgorithm,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl LimiterHooks {
    fn new(name: &str, algorithm: RateLimitAlgorithm) -> Self {
        Self {
            name: name.to_string(),
            algorithm,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopEventSink),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Report a decision. Called after the state lock is released.
    fn record<K: Display>(&self, key: &K, decision: &RateLimitDecision, now: DateTime<Utc>) {
        RateLimitMetrics::record_decision(&self.name, decision.allowed);

        if decision.allowed {
            tracing::trace!(
                limiter = %self.name,
                key = %key,
                remaining = decision.remaining,
                "Request admitted"
            );
            return;
        }

        tracing::debug!(
            limiter = %self.name,
            key = %key,
            retry_after_ms = decision.retry_after.as_millis(),
            "Rate limit exceeded"
        );

        self.events.emit(
            ResilienceEvent::new(EventType::RateLimitHit, &self.name, now)
                .with_metadata("key", key)
                .with_metadata("algorithm", algorithm_name(self.algorithm))
                .with_metadata("limit", decision.limit)
                .with_metadata("retry_after_ms", decision.retry_after.as_millis()),
        );
    }
}

const fn algorithm_name(algorithm: RateLimitAlgorithm) -> &'static str {
    match algorithm {
        RateLimitAlgorithm::TokenBucket => "token_bucket",
        RateLimitAlgorithm::SlidingWindow => "sliding_window",
        RateLimitAlgorithm::FixedWindow => "fixed_window",
    }
}

/// Seconds to `Duration`, saturating; negative and NaN become zero.
pub(crate) fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// `at + delta`, saturating at the maximum representable instant.
fn instant_after(at: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delta)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
