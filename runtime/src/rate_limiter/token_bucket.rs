//! Token bucket limiter.
//!
//! ```text
//! capacity C = 3, refill R = 10 tokens/s
//!
//! t=0ms     3.0 ─allow→ 2.0 ─allow→ 1.0 ─allow→ 0.0 ─deny (retry in 100ms)
//! t=100ms   1.0 ─allow→ 0.0
//! ```

use super::{instant_after, secs_to_duration, LimiterHooks, LimiterKey, RateLimiter};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use resilience_core::config::{RateLimitAlgorithm, RateLimitConfig};
use resilience_core::environment::{elapsed_between, Clock};
use resilience_core::event::EventSink;
use resilience_core::rate_limit::{RateLimitDecision, RateLimitHeaders};
use resilience_core::ResilienceError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Refillable per-key token bucket.
pub struct TokenBucket<K = String> {
    capacity: f64,
    refill_rate: f64,
    buckets: Mutex<HashMap<K, TokenBucketState>>,
    hooks: LimiterHooks,
}

impl<K: LimiterKey> TokenBucket<K> {
    /// Create a bucket with `capacity` tokens refilled at `refill_rate` tokens/s.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if `capacity` is zero or `refill_rate` is not a
    /// positive finite number.
    pub fn new(name: &str, capacity: u32, refill_rate: f64) -> Result<Self, ResilienceError> {
        if capacity == 0 {
            return Err(ResilienceError::invalid_policy("capacity", "must be at least 1"));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(ResilienceError::invalid_policy("refill_rate", "must be positive"));
        }

        Ok(Self {
            capacity: f64::from(capacity),
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
            hooks: LimiterHooks::new(name, RateLimitAlgorithm::TokenBucket),
        })
    }

    /// Create a bucket from a rate limit config.
    ///
    /// Capacity is `burst_size` (or `limit` when zero); the refill rate is
    /// `limit / window`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if the config is invalid.
    pub fn from_config(name: &str, config: &RateLimitConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Self::new(name, config.capacity(), config.refill_rate())
    }

    /// Use `clock` as the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.hooks.clock = clock;
        self
    }

    /// Emit rate-limit-hit events to `events`.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.hooks.events = events;
        self
    }

    /// Bucket capacity.
    #[must_use]
    pub const fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Refill rate in tokens per second.
    #[must_use]
    pub const fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Tokens currently available for `key`, after refill.
    #[must_use]
    pub fn tokens(&self, key: &K) -> f64 {
        let now = self.hooks.now();
        self.buckets
            .lock()
            .get(key)
            .map_or(self.capacity, |state| self.refilled(state, now))
    }

    fn refilled(&self, state: &TokenBucketState, now: DateTime<Utc>) -> f64 {
        let elapsed = elapsed_between(state.last_refill, now).as_secs_f64();
        (state.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    fn full_at(&self, tokens: f64, now: DateTime<Utc>) -> DateTime<Utc> {
        instant_after(now, secs_to_duration((self.capacity - tokens) / self.refill_rate))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn limit(&self) -> u32 {
        self.capacity as u32
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_tokens(tokens: f64) -> u32 {
    tokens.max(0.0).floor() as u32
}

impl<K: LimiterKey> RateLimiter<K> for TokenBucket<K> {
    fn allow(&self, key: &K) -> RateLimitDecision {
        let now = self.hooks.now();

        let decision = {
            let mut buckets = self.buckets.lock();
            let state = buckets.entry(key.clone()).or_insert(TokenBucketState {
                tokens: self.capacity,
                last_refill: now,
            });

            state.tokens = self.refilled(state, now);
            state.last_refill = state.last_refill.max(now);

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                RateLimitDecision {
                    allowed: true,
                    remaining: whole_tokens(state.tokens),
                    limit: self.limit(),
                    reset_at: self.full_at(state.tokens, now),
                    retry_after: Duration::ZERO,
                }
            } else {
                RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    limit: self.limit(),
                    reset_at: self.full_at(state.tokens, now),
                    retry_after: secs_to_duration((1.0 - state.tokens) / self.refill_rate),
                }
            }
        };

        self.hooks.record(key, &decision, now);
        decision
    }

    fn headers(&self, key: &K) -> RateLimitHeaders {
        let now = self.hooks.now();
        let tokens = self.tokens(key);
        RateLimitHeaders {
            limit: self.limit(),
            remaining: whole_tokens(tokens),
            reset: self.full_at(tokens, now).timestamp(),
        }
    }

    fn evict_idle(&self, idle_for: Duration) -> usize {
        let now = self.hooks.now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, state| {
            let full = self.refilled(state, now) >= self.capacity;
            !(full && elapsed_between(state.last_refill, now) >= idle_for)
        });
        before - buckets.len()
    }

    fn tracked_keys(&self) -> usize {
        self.buckets.lock().len()
    }

    fn name(&self) -> &str {
        &self.hooks.name
    }
}
