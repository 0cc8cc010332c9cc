//! Circuit breaker for protecting call sites from a failing dependency.
//!
//! # States
//!
//! ```text
//!            failure_threshold consecutive failures
//!   CLOSED ─────────────────────────────────────────▶ OPEN
//!     ▲                                                │
//!     │ success_threshold                              │ timeout elapsed
//!     │ successes                                      │ (observed on read)
//!     │                                                ▼
//!     └──────────────────────────────────────────── HALF_OPEN
//!                        any failure ──▶ OPEN
//! ```
//!
//! The Open → Half-Open move happens inside [`CircuitBreaker::state`] when it
//! notices the cooldown has passed, so callers must ask for the state before
//! every attempt instead of caching it. While half-open at most `probe_count`
//! callers are admitted through [`CircuitBreaker::try_acquire`] at once.
//!
//! All transitions happen under one lock per breaker, so two concurrent
//! failures can never both open the circuit with different `opened_at`.
//!
//! # Example
//!
//! ```
//! use resilience_core::config::CircuitBreakerConfig;
//! use resilience_runtime::circuit_breaker::{CircuitBreaker, CircuitState};
//!
//! let config = CircuitBreakerConfig::builder().failure_threshold(2).build().unwrap();
//! let breaker = CircuitBreaker::new("inventory", config).unwrap();
//!
//! breaker.record_failure();
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! breaker.record_failure();
//! assert_eq!(breaker.state(), CircuitState::Open);
//! ```

use crate::context::CallContext;
use crate::metrics::CircuitBreakerMetrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use resilience_core::config::CircuitBreakerConfig;
use resilience_core::environment::{elapsed_between, Clock, SystemClock};
use resilience_core::event::{EventSink, EventType, NoopEventSink, ResilienceEvent};
use resilience_core::ResilienceError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls pass through, failures are counted
    Closed,
    /// Calls are rejected immediately
    Open,
    /// A bounded number of probe calls test recovery
    HalfOpen,
}

impl CircuitState {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge value: 0 = closed, 1 = half-open, 2 = open.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error from [`CircuitBreaker::call`].
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// The breaker rejected the call (`CircuitOpen`) or it was cancelled
    #[error(transparent)]
    Rejected(ResilienceError),
    /// The operation ran and failed
    #[error("operation failed: {0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    probes_in_flight: u32,
    opened_at: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
    at: DateTime<Utc>,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

/// Three-state failure-accrual breaker for one protected resource.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    inner: Mutex<BreakerState>,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.inner.lock().state)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if the config is invalid.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let now = clock.now();

        Ok(Self {
            name: name.into(),
            config,
            clock,
            events: Arc::new(NoopEventSink),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                probes_in_flight: 0,
                opened_at: None,
                last_state_change: now,
            }),
            total_calls: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        })
    }

    /// Use `clock` as the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.inner.get_mut().last_state_change = clock.now();
        self.clock = clock;
        self
    }

    /// Emit circuit-state-change events to `events`.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, moving Open → Half-Open once the cooldown has elapsed.
    #[doc(alias = "get_state")]
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner, now);
            (inner.state, transition)
        };
        self.publish(transition);
        state
    }

    /// Admit one call: [`state`](Self::state) plus half-open probe accounting.
    ///
    /// A successful acquire in half-open state takes a probe slot that the
    /// next [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure) releases.
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` while open, or while half-open with every probe
    /// slot taken.
    pub fn try_acquire(&self) -> Result<(), ResilienceError> {
        let now = self.clock.now();
        let (result, transition) = {
            let mut inner = self.inner.lock();
            let transition = self.refresh(&mut inner, now);
            let result = match inner.state {
                CircuitState::Closed => Ok(()),
                CircuitState::HalfOpen if inner.probes_in_flight < self.config.probe_count => {
                    inner.probes_in_flight += 1;
                    Ok(())
                }
                CircuitState::HalfOpen => Err(ResilienceError::circuit_open(
                    &self.name,
                    Duration::ZERO,
                )
                .with_metadata("state", CircuitState::HalfOpen.as_str())),
                CircuitState::Open => Err(ResilienceError::circuit_open(
                    &self.name,
                    self.remaining_cooldown(&inner, now),
                )
                .with_metadata("state", CircuitState::Open.as_str())),
            };
            (result, transition)
        };
        self.publish(transition);

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            CircuitBreakerMetrics::record_rejection(&self.name);
            tracing::warn!(breaker = %self.name, "Circuit breaker is OPEN, rejecting request");
        }
        result
    }

    /// Report a successful call.
    pub fn record_success(&self) {
        let now = self.clock.now();
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        CircuitBreakerMetrics::record_outcome(&self.name, true);

        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        tracing::info!(
                            breaker = %self.name,
                            successes = inner.consecutive_successes,
                            "Circuit breaker transitioning HALF_OPEN -> CLOSED"
                        );
                        Some(Self::transition(&mut inner, CircuitState::Closed, now))
                    } else {
                        None
                    }
                }
                // Late result of a call admitted before the circuit opened
                CircuitState::Open => None,
            }
        };
        self.publish(transition);
    }

    /// Report a failed call.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        CircuitBreakerMetrics::record_outcome(&self.name, false);

        let transition = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        tracing::warn!(
                            breaker = %self.name,
                            failures = inner.consecutive_failures,
                            threshold = self.config.failure_threshold,
                            "Circuit breaker transitioning CLOSED -> OPEN"
                        );
                        Some(Self::transition(&mut inner, CircuitState::Open, now))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    tracing::warn!(
                        breaker = %self.name,
                        "Circuit breaker transitioning HALF_OPEN -> OPEN (recovery failed)"
                    );
                    Some(Self::transition(&mut inner, CircuitState::Open, now))
                }
                // openedAt is not extended by late failures
                CircuitState::Open => None,
            }
        };
        self.publish(transition);
    }

    /// Force the breaker closed and clear all counters.
    pub fn reset(&self) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.inner.lock();
            tracing::info!(breaker = %self.name, "Circuit breaker manually reset to CLOSED");
            if inner.state == CircuitState::Closed {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                inner.probes_in_flight = 0;
                None
            } else {
                Some(Self::transition(&mut inner, CircuitState::Closed, now))
            }
        };
        self.publish(transition);
    }

    /// Time left before an open circuit starts probing; zero otherwise.
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        let now = self.clock.now();
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => self.remaining_cooldown(&inner, now),
            CircuitState::Closed | CircuitState::HalfOpen => Duration::ZERO,
        }
    }

    /// Full state for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let state = self.state();
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            probes_in_flight: inner.probes_in_flight,
            opened_at: inner.opened_at,
            last_state_change: inner.last_state_change,
            stats: self.stats(),
        }
    }

    /// Lifetime call counters.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Give back a half-open probe slot without reporting an outcome.
    ///
    /// For calls admitted by [`try_acquire`](Self::try_acquire) that were
    /// abandoned before producing a result.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    /// Run one operation through the breaker.
    ///
    /// The operation is abandoned if `ctx` is cancelled while it runs.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Rejected` if the breaker refuses the call
    /// or the call is cancelled, `CircuitBreakerError::Inner` if the
    /// operation fails.
    pub async fn call<F, Fut, T, E>(
        &self,
        ctx: &CallContext,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cancelled = || {
            CircuitBreakerError::Rejected(
                ResilienceError::cancelled(&self.name).with_correlation_id_opt(ctx.correlation_id()),
            )
        };

        if ctx.is_cancelled() {
            return Err(cancelled());
        }
        self.try_acquire().map_err(|err| {
            CircuitBreakerError::Rejected(err.with_correlation_id_opt(ctx.correlation_id()))
        })?;

        let outcome = tokio::select! {
            biased;
            () = ctx.cancelled() => None,
            result = operation() => Some(result),
        };

        match outcome {
            None => {
                self.release();
                Err(cancelled())
            }
            Some(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Some(Err(err)) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    fn refresh(&self, inner: &mut BreakerState, now: DateTime<Utc>) -> Option<Transition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let opened_at = inner.opened_at?;
        if elapsed_between(opened_at, now) < self.config.timeout {
            return None;
        }

        tracing::info!(breaker = %self.name, "Circuit breaker transitioning OPEN -> HALF_OPEN");
        Some(Self::transition(inner, CircuitState::HalfOpen, now))
    }

    fn remaining_cooldown(&self, inner: &BreakerState, now: DateTime<Utc>) -> Duration {
        inner.opened_at.map_or(Duration::ZERO, |opened_at| {
            self.config
                .timeout
                .saturating_sub(elapsed_between(opened_at, now))
        })
    }

    fn transition(inner: &mut BreakerState, to: CircuitState, now: DateTime<Utc>) -> Transition {
        let record = Transition {
            from: inner.state,
            to,
            at: now,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
        };

        inner.state = to;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.probes_in_flight = 0;
        inner.last_state_change = now;
        inner.opened_at = match to {
            CircuitState::Open => Some(now),
            CircuitState::HalfOpen => inner.opened_at,
            CircuitState::Closed => None,
        };
        record
    }

    /// Report a transition. Called after the state lock is released.
    fn publish(&self, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };

        CircuitBreakerMetrics::record_transition(&self.name, transition.from, transition.to);
        self.events.emit(
            ResilienceEvent::new(EventType::CircuitStateChange, &self.name, transition.at)
                .with_metadata("from", transition.from)
                .with_metadata("to", transition.to)
                .with_metadata("consecutive_failures", transition.consecutive_failures)
                .with_metadata("consecutive_successes", transition.consecutive_successes),
        );
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerSnapshot {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub consecutive_failures: u32,
    /// Consecutive successes while half-open
    pub consecutive_successes: u32,
    /// Half-open probes admitted and not yet reported
    pub probes_in_flight: u32,
    /// When the circuit last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// When the state last changed
    pub last_state_change: DateTime<Utc>,
    /// Lifetime counters
    pub stats: CircuitBreakerStats,
}

/// Lifetime counters of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    /// Admission checks made
    pub total_calls: u64,
    /// Successes reported
    pub total_successes: u64,
    /// Failures reported
    pub total_failures: u64,
    /// Admission checks rejected
    pub total_rejections: u64,
}

impl CircuitBreakerStats {
    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let outcomes = self.total_successes + self.total_failures;
        if outcomes == 0 {
            return 1.0;
        }
        self.total_successes as f64 / outcomes as f64
    }

    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use resilience_core::ErrorKind;
    use resilience_testing::{test_clock, ManualClock, RecordingEventSink};

    fn breaker(
        failure_threshold: u32,
        success_threshold: u32,
        timeout: Duration,
    ) -> (CircuitBreaker, Arc<ManualClock>, Arc<RecordingEventSink>) {
        let clock = Arc::new(ManualClock::new(test_clock().now()));
        let events = Arc::new(RecordingEventSink::new());
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(failure_threshold)
            .success_threshold(success_threshold)
            .timeout(timeout)
            .build()
            .unwrap();
        let breaker = CircuitBreaker::new("test", config)
            .unwrap()
            .with_clock(clock.clone())
            .with_event_sink(events.clone());
        (breaker, clock, events)
    }

    #[test]
    fn test_opens_on_exactly_threshold_failures() {
        let (breaker, _clock, events) = breaker(5, 2, Duration::from_secs(30));

        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let changes = events.events_of(EventType::CircuitStateChange);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].get("from"), Some("closed"));
        assert_eq!(changes[0].get("to"), Some("open"));
        assert_eq!(changes[0].get("consecutive_failures"), Some("5"));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let (breaker, _clock, _events) = breaker(3, 1, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_rejects_while_open() {
        let (breaker, clock, _events) = breaker(1, 1, Duration::from_secs(30));
        breaker.record_failure();

        clock.advance(Duration::from_secs(10));
        let err = breaker.try_acquire().unwrap_err();
        assert!(err.is(ErrorKind::CircuitOpen));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(20)));
        assert_eq!(breaker.retry_after(), Duration::from_secs(20));
        assert_eq!(breaker.stats().total_rejections, 1);
    }

    #[test]
    fn test_half_open_only_after_timeout() {
        let (breaker, clock, _events) = breaker(1, 1, Duration::from_secs(30));
        breaker.record_failure();

        clock.advance(Duration::from_millis(29_999));
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(1));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let (breaker, clock, events) = breaker(1, 2, Duration::from_secs(5));
        breaker.record_failure();
        clock.advance(Duration::from_secs(5));

        breaker.try_acquire().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.try_acquire().unwrap();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let transitions: Vec<_> = events
            .events_of(EventType::CircuitStateChange)
            .iter()
            .map(|e| format!("{}->{}", e.get("from").unwrap(), e.get("to").unwrap()))
            .collect();
        assert_eq!(transitions, vec!["closed->open", "open->half_open", "half_open->closed"]);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (breaker, clock, _events) = breaker(1, 3, Duration::from_secs(5));
        breaker.record_failure();
        clock.advance(Duration::from_secs(5));

        breaker.try_acquire().unwrap();
        breaker.record_success();
        breaker.try_acquire().unwrap();
        breaker.record_failure();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_successes, 0);
        assert_eq!(snapshot.opened_at, Some(clock.now()));
    }

    #[test]
    fn test_probe_count_limits_half_open_admissions() {
        let clock = Arc::new(ManualClock::new(test_clock().now()));
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .success_threshold(5)
            .timeout(Duration::from_secs(1))
            .probe_count(2)
            .build()
            .unwrap();
        let breaker = CircuitBreaker::new("probes", config)
            .unwrap()
            .with_clock(clock.clone());

        breaker.record_failure();
        clock.advance(Duration::from_secs(1));

        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.try_acquire().is_ok());
        assert!(breaker.try_acquire().is_err());

        breaker.record_success();
        assert_eq!(breaker.snapshot().probes_in_flight, 1);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_reset_closes() {
        let (breaker, _clock, events) = breaker(1, 1, Duration::from_secs(60));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(events.count_of(EventType::CircuitStateChange), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..CircuitBreakerConfig::default()
        };
        let err = CircuitBreaker::new("bad", config).unwrap_err();
        assert!(err.is(ErrorKind::InvalidPolicy));
    }

    #[test]
    fn test_stats_rates() {
        let stats = CircuitBreakerStats {
            total_calls: 10,
            total_successes: 6,
            total_failures: 2,
            total_rejections: 2,
        };
        assert!((stats.success_rate() - 0.75).abs() < f64::EPSILON);
        assert!((stats.rejection_rate() - 0.2).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_call_wraps_operation() {
        let (breaker, _clock, _events) = breaker(1, 1, Duration::from_secs(60));

        let ctx = CallContext::new();

        let ok: Result<i32, CircuitBreakerError<String>> =
            breaker.call(&ctx, || async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let failed = breaker
            .call(&ctx, || async { Err::<i32, _>("boom".to_string()) })
            .await;
        assert!(matches!(failed, Err(CircuitBreakerError::Inner(ref e)) if e == "boom"));

        let rejected = breaker.call(&ctx, || async { Ok::<_, String>(1) }).await;
        match rejected {
            Err(CircuitBreakerError::Rejected(err)) => assert!(err.is(ErrorKind::CircuitOpen)),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_probe_releases_slot() {
        let (breaker, clock, _events) = breaker(1, 1, Duration::from_secs(5));
        breaker.record_failure();
        clock.advance(Duration::from_secs(5));

        let ctx = CallContext::new().with_correlation_id("req-9");
        let cancel = ctx.clone();
        let result = breaker
            .call(&ctx, || async move {
                cancel.cancel();
                std::future::pending::<Result<(), String>>().await
            })
            .await;

        match result {
            Err(CircuitBreakerError::Rejected(err)) => {
                assert!(err.is(ErrorKind::Cancelled));
                assert_eq!(err.correlation_id(), Some("req-9"));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(breaker.snapshot().probes_in_flight, 0);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let (breaker, _clock, events) = breaker(50, 1, Duration::from_secs(60));
        let breaker = Arc::new(breaker);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        breaker.record_failure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(events.count_of(EventType::CircuitStateChange), 1);
        assert_eq!(breaker.stats().total_failures, 100);
    }
}
