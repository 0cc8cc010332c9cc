//! Sliding window log limiter.
//!
//! Keeps the ascending timestamps of admitted requests per key. Entries older
//! than `now - window` are trimmed from the front on every access, so the
//! in-window count can never exceed `limit`.

use super::{instant_after, LimiterHooks, LimiterKey, RateLimiter};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use resilience_core::config::{RateLimitAlgorithm, RateLimitConfig};
use resilience_core::environment::{elapsed_between, Clock};
use resilience_core::event::EventSink;
use resilience_core::rate_limit::{RateLimitDecision, RateLimitHeaders};
use resilience_core::ResilienceError;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Per-key sliding window over a timestamp log.
pub struct SlidingWindow<K = String> {
    limit: u32,
    window: Duration,
    logs: Mutex<HashMap<K, VecDeque<DateTime<Utc>>>>,
    hooks: LimiterHooks,
}

impl<K: LimiterKey> SlidingWindow<K> {
    /// Allow `limit` requests in any `window`.
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
            logs: Mutex::new(HashMap::new()),
            hooks: LimiterHooks::new(name, RateLimitAlgorithm::SlidingWindow),
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

    /// Requests currently inside the window for `key`.
    #[must_use]
    pub fn in_window(&self, key: &K) -> usize {
        let now = self.hooks.now();
        self.logs
            .lock()
            .get(key)
            .map_or(0, |log| log.iter().filter(|ts| self.in_window_at(**ts, now)).count())
    }

    fn in_window_at(&self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        elapsed_between(ts, now) <= self.window
    }

    fn prune(&self, log: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        while log.front().is_some_and(|oldest| !self.in_window_at(*oldest, now)) {
            log.pop_front();
        }
    }

    fn remaining(&self, len: usize) -> u32 {
        self.limit
            .saturating_sub(u32::try_from(len).unwrap_or(u32::MAX))
    }
}

impl<K: LimiterKey> RateLimiter<K> for SlidingWindow<K> {
    fn allow(&self, key: &K) -> RateLimitDecision {
        let now = self.hooks.now();

        let decision = {
            let mut logs = self.logs.lock();
            let log = logs.entry(key.clone()).or_default();
            self.prune(log, now);

            if log.len() < self.limit as usize {
                log.push_back(now);
                let oldest = log.front().copied().unwrap_or(now);
                RateLimitDecision {
                    allowed: true,
                    remaining: self.remaining(log.len()),
                    limit: self.limit,
                    reset_at: instant_after(oldest, self.window),
                    retry_after: Duration::ZERO,
                }
            } else {
                let oldest = log.front().copied().unwrap_or(now);
                RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    limit: self.limit,
                    reset_at: instant_after(oldest, self.window),
                    retry_after: self.window.saturating_sub(elapsed_between(oldest, now)),
                }
            }
        };

        self.hooks.record(key, &decision, now);
        decision
    }

    fn headers(&self, key: &K) -> RateLimitHeaders {
        let now = self.hooks.now();
        let logs = self.logs.lock();
        let mut live = logs
            .get(key)
            .into_iter()
            .flatten()
            .filter(|ts| self.in_window_at(**ts, now));

        let oldest = live.next().copied();
        let count = oldest.map_or(0, |_| 1 + live.count());

        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining(count),
            reset: oldest
                .map_or(now, |oldest| instant_after(oldest, self.window))
                .timestamp(),
        }
    }

    fn evict_idle(&self, idle_for: Duration) -> usize {
        let now = self.hooks.now();
        let mut logs = self.logs.lock();
        let before = logs.len();
        logs.retain(|_, log| {
            log.back().is_some_and(|newest| {
                let idle = elapsed_between(*newest, now);
                idle <= self.window || idle < idle_for
            })
        });
        before - logs.len()
    }

    fn tracked_keys(&self) -> usize {
        self.logs.lock().len()
    }

    fn name(&self) -> &str {
        &self.hooks.name
    }
}
