//! Retry logic with exponential backoff and jitter for transient failures.
//!
//! [`RetryPolicy`] is a validated, immutable backoff configuration.
//! [`RetryExecutor`] runs an operation under it, optionally through a
//! [`CircuitBreaker`]. The wait between attempts is the only suspension point
//! and it always races the call's cancellation token.
//!
//! # Example
//!
//! ```rust
//! use resilience_runtime::context::CallContext;
//! use resilience_runtime::retry::{RetryExecutor, RetryPolicy};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .base_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .multiplier(2.0)
//!     .build()?;
//!
//! let executor = RetryExecutor::new("inventory", policy);
//! let value = executor
//!     .execute(&CallContext::new(), || async {
//!         // Your fallible operation here
//!         Ok::<_, std::io::Error>(42)
//!     })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::context::CallContext;
use crate::metrics::RetryMetrics;
use crate::rate_limiter::secs_to_duration;
use rand::rngs::OsRng;
use rand::Rng;
use resilience_core::config::RetryConfig;
use resilience_core::environment::{Clock, SystemClock};
use resilience_core::event::{EventSink, EventType, NoopEventSink, ResilienceEvent};
use resilience_core::{BoxError, ResilienceError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Validated backoff configuration.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 100ms
/// - `max_delay`: 10 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter_percent`: 0.1
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }
}

impl RetryPolicy {
    /// Validate `config` into a policy.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if `max_attempts` is zero, `multiplier <= 1`
    /// or `jitter_percent` is outside `[0, 1]`.
    pub fn new(config: RetryConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Create a new policy builder starting from the defaults.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            config: RetryConfig::default(),
        }
    }

    /// Total attempts including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Underlying configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `attempt + 1`, without jitter.
    ///
    /// `min(base_delay * multiplier^attempt, max_delay)`, saturating.
    #[must_use]
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.config.base_delay.as_secs_f64() * self.config.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.config.max_delay.as_secs_f64() {
            return self.config.max_delay;
        }
        secs_to_duration(secs).min(self.config.max_delay)
    }

    /// Delay before retry number `attempt + 1` with symmetric jitter.
    ///
    /// The jitter is drawn uniformly from `±jitter_percent * base` using the
    /// operating system's random source, then clamped to be non-negative.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt).as_secs_f64();
        let spread = base * self.config.jitter_percent;
        if spread <= 0.0 {
            return secs_to_duration(base);
        }

        let jitter = OsRng.gen_range(-spread..=spread);
        secs_to_duration(base + jitter)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    config: RetryConfig,
}

impl RetryPolicyBuilder {
    /// Set total attempts including the first.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    /// Set the jitter fraction in `[0, 1]`.
    #[must_use]
    pub const fn jitter_percent(mut self, jitter_percent: f64) -> Self {
        self.config.jitter_percent = jitter_percent;
        self
    }

    /// Build the [`RetryPolicy`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if the configuration is invalid.
    pub fn build(self) -> Result<RetryPolicy, ResilienceError> {
        RetryPolicy::new(self.config)
    }
}

/// Runs operations under a [`RetryPolicy`].
pub struct RetryExecutor {
    service: String,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("service", &self.service)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Executor for calls to `service`.
    pub fn new(service: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            service: service.into(),
            policy,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopEventSink),
        }
    }

    /// Use `clock` for event timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Emit retry-attempt events to `events`.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Service name used in errors, events and logs.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds or `max_attempts` calls have failed.
    ///
    /// # Errors
    ///
    /// Returns `RetryExhausted` (with the last failure as its cause) after the
    /// final attempt fails, or `Cancelled` as soon as `ctx` is cancelled.
    pub async fn execute<F, Fut, T, E>(
        &self,
        ctx: &CallContext,
        operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(ctx, None, operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but stops at the first failure for
    /// which `is_retryable` returns `false`.
    ///
    /// # Errors
    ///
    /// As [`execute`](Self::execute); a non-retryable failure ends the loop
    /// with `RetryExhausted` carrying the attempts actually made.
    pub async fn execute_if<F, Fut, T, E, P>(
        &self,
        ctx: &CallContext,
        operation: F,
        is_retryable: P,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
        P: Fn(&E) -> bool,
    {
        self.run(ctx, None, operation, is_retryable).await
    }

    /// Run `operation` with retries, consulting `breaker` before each attempt.
    ///
    /// A rejected admission does not use up an attempt: it ends the call with
    /// `CircuitOpen` at once. A failure that opens the circuit also ends it
    /// with `CircuitOpen` instead of backing off.
    ///
    /// # Errors
    ///
    /// `CircuitOpen`, `Cancelled` or `RetryExhausted`.
    pub async fn execute_with_circuit_breaker<F, Fut, T, E>(
        &self,
        ctx: &CallContext,
        breaker: &CircuitBreaker,
        operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(ctx, Some(breaker), operation, |_| true).await
    }

    /// [`execute_with_circuit_breaker`](Self::execute_with_circuit_breaker)
    /// with a retryability predicate.
    ///
    /// # Errors
    ///
    /// `CircuitOpen`, `Cancelled` or `RetryExhausted`.
    pub async fn execute_with_circuit_breaker_if<F, Fut, T, E, P>(
        &self,
        ctx: &CallContext,
        breaker: &CircuitBreaker,
        operation: F,
        is_retryable: P,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
        P: Fn(&E) -> bool,
    {
        self.run(ctx, Some(breaker), operation, is_retryable).await
    }

    async fn run<F, Fut, T, E, P>(
        &self,
        ctx: &CallContext,
        breaker: Option<&CircuitBreaker>,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempts: u32 = 0;

        loop {
            if ctx.is_cancelled() {
                return Err(self.cancelled(ctx, attempts, None));
            }
            if let Some(breaker) = breaker {
                breaker
                    .try_acquire()
                    .map_err(|err| err.with_correlation_id_opt(ctx.correlation_id()))?;
            }

            attempts += 1;
            let outcome = tokio::select! {
                biased;
                () = ctx.cancelled() => None,
                result = operation() => Some(result),
            };

            let err = match outcome {
                None => {
                    if let Some(breaker) = breaker {
                        breaker.release();
                    }
                    return Err(self.cancelled(ctx, attempts, None));
                }
                Some(Ok(value)) => {
                    if let Some(breaker) = breaker {
                        breaker.record_success();
                    }
                    if attempts > 1 {
                        tracing::info!(service = %self.service, attempt = attempts, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Some(Err(err)) => err,
            };

            let retryable = is_retryable(&err);
            let err: BoxError = err.into();

            if let Some(breaker) = breaker {
                breaker.record_failure();
                if breaker.state() == CircuitState::Open {
                    tracing::warn!(
                        service = %self.service,
                        attempt = attempts,
                        error = %err,
                        "Circuit opened, abandoning retries"
                    );
                    return Err(ResilienceError::circuit_open(&self.service, breaker.retry_after())
                        .with_metadata("attempts", attempts.to_string())
                        .with_cause(err)
                        .with_correlation_id_opt(ctx.correlation_id()));
                }
            }

            if !retryable {
                tracing::warn!(
                    service = %self.service,
                    attempt = attempts,
                    error = %err,
                    "Error is not retryable, failing immediately"
                );
                return Err(self.exhausted(ctx, attempts, err));
            }

            if attempts >= max_attempts {
                tracing::error!(
                    service = %self.service,
                    attempt = attempts,
                    error = %err,
                    "Operation failed after max retries"
                );
                return Err(self.exhausted(ctx, attempts, err));
            }

            let delay = self.policy.calculate_delay(attempts - 1);
            tracing::warn!(
                service = %self.service,
                attempt = attempts,
                delay_ms = delay.as_millis(),
                error = %err,
                "Operation failed, retrying..."
            );
            RetryMetrics::record_attempt(&self.service);
            self.events.emit(
                ResilienceEvent::new(EventType::RetryAttempt, &self.service, self.clock.now())
                    .with_correlation_id(ctx.correlation_id())
                    .with_metadata("attempt", attempts)
                    .with_metadata("max_attempts", max_attempts)
                    .with_metadata("delay_ms", delay.as_millis())
                    .with_metadata("error", &err),
            );

            tokio::select! {
                biased;
                () = ctx.cancelled() => return Err(self.cancelled(ctx, attempts, Some(err))),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn exhausted(&self, ctx: &CallContext, attempts: u32, cause: BoxError) -> ResilienceError {
        RetryMetrics::record_exhausted(&self.service);
        ResilienceError::retry_exhausted(&self.service, attempts, cause)
            .with_correlation_id_opt(ctx.correlation_id())
    }

    fn cancelled(&self, ctx: &CallContext, attempts: u32, last: Option<BoxError>) -> ResilienceError {
        tracing::debug!(service = %self.service, attempt = attempts, "Call cancelled");
        let err = ResilienceError::cancelled(&self.service)
            .with_metadata("attempts", attempts.to_string())
            .with_correlation_id_opt(ctx.correlation_id());
        match last {
            Some(cause) => err.with_cause(cause),
            None => err,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use resilience_core::config::CircuitBreakerConfig;
    use resilience_core::ErrorKind;
    use resilience_testing::{test_clock, ManualClock, RecordingEventSink, ScriptedFailure, ScriptedOperation};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(10))
            .max_delay(Duration::from_secs(1))
            .jitter_percent(0.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_retry_policy_delay_calculation() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_secs(10))
            .jitter_percent(0.0)
            .build()
            .unwrap();

        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_retry_policy_max_delay_cap() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(1000))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build()
            .unwrap();

        // 1000ms * 10^5 is capped at 2000ms before jitter
        assert_eq!(policy.base_delay_for(5), Duration::from_secs(2));
        assert_eq!(policy.base_delay_for(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .jitter_percent(0.5)
            .build()
            .unwrap();

        for _ in 0..200 {
            let delay = policy.calculate_delay(0);
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(150), "{delay:?}");
        }
    }

    #[test]
    fn test_full_jitter_never_negative() {
        let policy = RetryPolicy::builder().jitter_percent(1.0).build().unwrap();
        for attempt in 0..10 {
            let ceiling = policy.base_delay_for(attempt) * 2 + Duration::from_micros(1);
            assert!(policy.calculate_delay(attempt) <= ceiling);
        }
    }

    #[test]
    fn test_invalid_policies_rejected() {
        for builder in [
            RetryPolicy::builder().max_attempts(0),
            RetryPolicy::builder().multiplier(1.0),
            RetryPolicy::builder().multiplier(0.5),
            RetryPolicy::builder().jitter_percent(-0.1),
            RetryPolicy::builder().jitter_percent(1.5),
        ] {
            let err = builder.build().unwrap_err();
            assert!(err.is(ErrorKind::InvalidPolicy));
            assert!(!err.kind().is_retryable());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_first_try() {
        let op = ScriptedOperation::succeeding();
        let executor = RetryExecutor::new("svc", RetryPolicy::default());

        let result = executor.execute(&CallContext::new(), || op.call()).await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let op = ScriptedOperation::failing(2);
        let events = Arc::new(RecordingEventSink::new());
        let executor = RetryExecutor::new("svc", policy(3)).with_event_sink(events.clone());

        let result = executor.execute(&CallContext::new(), || op.call()).await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(op.calls(), 3);
        assert_eq!(events.count_of(EventType::RetryAttempt), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts() {
        let op = ScriptedOperation::always_failing();
        let events = Arc::new(RecordingEventSink::new());
        let clock = Arc::new(ManualClock::new(test_clock().now()));
        let executor = RetryExecutor::new("svc", policy(4))
            .with_event_sink(events.clone())
            .with_clock(clock);
        let ctx = CallContext::new().with_correlation_id("req-1");

        let err = executor.execute(&ctx, || op.call()).await.unwrap_err();

        assert!(err.is(ErrorKind::RetryExhausted));
        assert_eq!(err.attempts(), Some(4));
        assert_eq!(err.correlation_id(), Some("req-1"));
        assert_eq!(op.calls(), 4);

        let cause = err.cause().unwrap().downcast_ref::<ScriptedFailure>().unwrap();
        assert_eq!(cause.call, 4);

        let attempts = events.events_of(EventType::RetryAttempt);
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].get("attempt"), Some("1"));
        assert_eq!(attempts[0].get("delay_ms"), Some("10"));
        assert_eq!(attempts[1].get("delay_ms"), Some("20"));
        assert_eq!(attempts[2].correlation_id.as_deref(), Some("req-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_predicate_skips_non_retryable() {
        let op = ScriptedOperation::always_failing();
        let executor = RetryExecutor::new("svc", policy(5));

        let err = executor
            .execute_if(&CallContext::new(), || op.call(), |e: &ScriptedFailure| e.call > 1)
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::RetryExhausted));
        assert_eq!(err.attempts(), Some(1));
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_first_attempt() {
        let op = ScriptedOperation::succeeding();
        let executor = RetryExecutor::new("svc", policy(3));
        let ctx = CallContext::new();
        ctx.cancel();

        let err = executor.execute(&ctx, || op.call()).await.unwrap_err();

        assert!(err.is(ErrorKind::Cancelled));
        assert_eq!(op.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_wins_during_backoff() {
        let op = ScriptedOperation::always_failing();
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .base_delay(Duration::from_secs(3600))
            .max_delay(Duration::from_secs(3600))
            .build()
            .unwrap();
        let executor = RetryExecutor::new("svc", policy);
        let ctx = CallContext::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        let err = executor.execute(&ctx, || op.call()).await.unwrap_err();

        assert!(err.is(ErrorKind::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(op.calls(), 1);
        assert!(err.cause().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_rejects_without_attempt() {
        let config = CircuitBreakerConfig::builder().failure_threshold(1).build().unwrap();
        let breaker = CircuitBreaker::new("svc", config).unwrap();
        breaker.record_failure();

        let op = ScriptedOperation::succeeding();
        let executor = RetryExecutor::new("svc", policy(3));
        let err = executor
            .execute_with_circuit_breaker(&CallContext::new(), &breaker, || op.call())
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::CircuitOpen));
        assert_eq!(op.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_that_opens_breaker_stops_retries() {
        let config = CircuitBreakerConfig::builder().failure_threshold(2).build().unwrap();
        let breaker = CircuitBreaker::new("svc", config).unwrap();

        let op = ScriptedOperation::always_failing();
        let executor = RetryExecutor::new("svc", policy(5));
        let err = executor
            .execute_with_circuit_breaker(&CallContext::new(), &breaker, || op.call())
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::CircuitOpen));
        assert_eq!(op.calls(), 2);
        assert!(err.retry_after().is_some());
        assert!(err.cause().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opened_during_backoff_rejects_next_attempt() {
        let config = CircuitBreakerConfig::builder().failure_threshold(3).build().unwrap();
        let breaker = Arc::new(CircuitBreaker::new("svc", config).unwrap());
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .base_delay(Duration::from_secs(1))
            .jitter_percent(0.0)
            .build()
            .unwrap();

        // Another caller's failures land while this one is backing off
        let other = Arc::clone(&breaker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            other.record_failure();
            other.record_failure();
        });

        let op = ScriptedOperation::always_failing();
        let executor = RetryExecutor::new("svc", policy);
        let err = executor
            .execute_with_circuit_breaker(&CallContext::new(), &breaker, || op.call())
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::CircuitOpen));
        assert_eq!(op.calls(), 1);
        assert!(err.cause().is_none());
        assert_eq!(breaker.stats().total_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_records_success() {
        let breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::default()).unwrap();
        let op = ScriptedOperation::failing(1);
        let executor = RetryExecutor::new("svc", policy(3));

        let value = executor
            .execute_with_circuit_breaker(&CallContext::new(), &breaker, || op.call())
            .await
            .unwrap();

        assert_eq!(value, 2);
        let stats = breaker.stats();
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.total_successes, 1);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }
}
