//! Fixed window counter limiter.

use super::{instant_after, LimiterHooks, LimiterKey, RateLimiter};
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
struct FixedWindowState {
    count: u32,
    window_start: DateTime<Utc>,
}

/// Per-key counter reset at the end of each window.
///
/// Windows start at a key's first request, not at wall-clock boundaries.
pub struct FixedWindow<K = String> {
    limit: u32,
    window: Duration,
    counters: Mutex<HashMap<K, FixedWindowState>>,
    hooks: LimiterHooks,
}

impl<K> std::fmt::Debug for FixedWindow<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindow")
            .field("name", &self.hooks.name)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl<K: LimiterKey> FixedWindow<K> {
    /// Allow `limit` requests per `window`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if `limit` or `window` is zero.
    pub fn new(name: &str, limit: u32, window: Duration) -> Result<Self, ResilienceError> {
        if limit == 0 {
            return Err(ResilienceError::invalid_policy("limit", "must be at least 1"));
        }
        if window.is_zero() {
            return Err(ResilienceError::invalid_policy("window", "must be positive"));
        }

        Ok(Self {
            limit,
            window,
            counters: Mutex::new(HashMap::new()),
            hooks: LimiterHooks::new(name, RateLimitAlgorithm::FixedWindow),
        })
    }

    /// Create a limiter from a rate limit config.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if the config is invalid.
    pub fn from_config(name: &str, config: &RateLimitConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Self::new(name, config.limit, config.window)
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

    fn expired(&self, state: &FixedWindowState, now: DateTime<Utc>) -> bool {
        elapsed_between(state.window_start, now) >= self.window
    }
}

impl<K: LimiterKey> RateLimiter<K> for FixedWindow<K> {
    fn allow(&self, key: &K) -> RateLimitDecision {
        let now = self.hooks.now();

        let decision = {
            let mut counters = self.counters.lock();
            let state = counters.entry(key.clone()).or_insert(FixedWindowState {
                count: 0,
                window_start: now,
            });

            if self.expired(state, now) {
                state.count = 0;
                state.window_start = now;
            }

            let reset_at = instant_after(state.window_start, self.window);
            if state.count < self.limit {
                state.count += 1;
                RateLimitDecision {
                    allowed: true,
                    remaining: self.limit - state.count,
                    limit: self.limit,
                    reset_at,
                    retry_after: Duration::ZERO,
                }
            } else {
                RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    limit: self.limit,
                    reset_at,
                    retry_after: self
                        .window
                        .saturating_sub(elapsed_between(state.window_start, now)),
                }
            }
        };

        self.hooks.record(key, &decision, now);
        decision
    }

    fn headers(&self, key: &K) -> RateLimitHeaders {
        let now = self.hooks.now();
        let counters = self.counters.lock();
        match counters.get(key) {
            Some(state) if !self.expired(state, now) => RateLimitHeaders {
                limit: self.limit,
                remaining: self.limit.saturating_sub(state.count),
                reset: instant_after(state.window_start, self.window).timestamp(),
            },
            _ => RateLimitHeaders {
                limit: self.limit,
                remaining: self.limit,
                reset: instant_after(now, self.window).timestamp(),
            },
        }
    }

    fn evict_idle(&self, idle_for: Duration) -> usize {
        let now = self.hooks.now();
        let mut counters = self.counters.lock();
        let before = counters.len();
        counters.retain(|_, state| {
            !(self.expired(state, now) && elapsed_between(state.window_start, now) >= idle_for)
        });
        before - counters.len()
    }

    fn tracked_keys(&self) -> usize {
        self.counters.lock().len()
    }

    fn name(&self) -> &str {
        &self.hooks.name
    }
}
