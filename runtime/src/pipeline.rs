//! One call path with every configured protection applied in order.
//!
//! ```text
//! rate limit(key) ─▶ bulkhead permit ─▶ retry loop ─┬─▶ circuit breaker admission
//!                                                    └─▶ attempt under timeout
//! ```
//!
//! Sections missing from the [`ResiliencePolicy`] are skipped; without a
//! retry section each call makes a single attempt.
//!
//! # Example
//!
//! ```
//! use resilience_core::config::{ResiliencePolicy, RetryConfig};
//! use resilience_runtime::context::CallContext;
//! use resilience_runtime::pipeline::ResiliencePipeline;
//!
//! # async fn example() -> Result<(), resilience_core::ResilienceError> {
//! let mut policy = ResiliencePolicy::new("inventory");
//! policy.retry = Some(RetryConfig::default());
//!
//! let pipeline = ResiliencePipeline::builder(policy).build()?;
//! let stock = pipeline
//!     .execute(&CallContext::new(), "tenant-1", "get_stock", || async {
//!         Ok::<_, std::io::Error>(12)
//!     })
//!     .await?;
//! assert_eq!(stock, 12);
//! # Ok(())
//! # }
//! ```

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::context::CallContext;
use crate::metrics::OperationMetrics;
use crate::rate_limiter::{build_rate_limiter, RateLimiter};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::timeout::TimeoutManager;
use resilience_core::config::{ResiliencePolicy, RetryConfig};
use resilience_core::environment::{Clock, SystemClock};
use resilience_core::error::kind_of;
use resilience_core::event::{EventSink, MetricsSink, NoopEventSink, NoopMetricsSink};
use resilience_core::rate_limit::RateLimitHeaders;
use resilience_core::{BoxError, ResilienceError};
use std::future::Future;
use std::sync::Arc;

/// Builder for [`ResiliencePipeline`].
pub struct ResiliencePipelineBuilder {
    policy: ResiliencePolicy,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
}

impl ResiliencePipelineBuilder {
    /// Time source for every component.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Event sink for every component.
    #[must_use]
    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sink for end-to-end call latency.
    #[must_use]
    pub fn metrics_sink(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Validate the policy and construct every configured component.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if any section is invalid.
    pub fn build(self) -> Result<ResiliencePipeline, ResilienceError> {
        let Self {
            policy,
            clock,
            events,
            metrics,
        } = self;
        policy.validate()?;
        let name = policy.name.as_str();

        let limiter = policy
            .rate_limit
            .as_ref()
            .map(|config| {
                build_rate_limiter::<String>(name, config, Arc::clone(&clock), Arc::clone(&events))
            })
            .transpose()?;

        let bulkhead = policy
            .bulkhead
            .clone()
            .map(|config| {
                Bulkhead::new(name, config).map(|b| {
                    b.with_clock(Arc::clone(&clock))
                        .with_event_sink(Arc::clone(&events))
                })
            })
            .transpose()?;

        let breaker = policy
            .circuit_breaker
            .clone()
            .map(|config| {
                CircuitBreaker::new(name, config).map(|b| {
                    b.with_clock(Arc::clone(&clock))
                        .with_event_sink(Arc::clone(&events))
                })
            })
            .transpose()?;

        let timeouts = policy
            .timeout
            .clone()
            .map(|config| {
                TimeoutManager::new(name, config).map(|t| {
                    t.with_clock(Arc::clone(&clock))
                        .with_event_sink(Arc::clone(&events))
                })
            })
            .transpose()?;

        let retry_config = policy.retry.clone().unwrap_or(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        });
        let retry = RetryExecutor::new(name, RetryPolicy::new(retry_config)?)
            .with_clock(Arc::clone(&clock))
            .with_event_sink(events);

        tracing::debug!(
            policy = %name,
            rate_limit = limiter.is_some(),
            bulkhead = bulkhead.is_some(),
            circuit_breaker = breaker.is_some(),
            timeout = timeouts.is_some(),
            max_attempts = retry.policy().max_attempts(),
            "Resilience pipeline built"
        );

        Ok(ResiliencePipeline {
            name: policy.name,
            limiter,
            bulkhead,
            breaker,
            timeouts,
            retry,
            metrics,
        })
    }
}

/// Rate limiter, bulkhead, retry, circuit breaker and timeout for one call path.
pub struct ResiliencePipeline {
    name: String,
    limiter: Option<Box<dyn RateLimiter<String>>>,
    bulkhead: Option<Bulkhead>,
    breaker: Option<CircuitBreaker>,
    timeouts: Option<TimeoutManager>,
    retry: RetryExecutor,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for ResiliencePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResiliencePipeline")
            .field("name", &self.name)
            .field("bulkhead", &self.bulkhead)
            .field("breaker", &self.breaker)
            .field("timeouts", &self.timeouts)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ResiliencePipeline {
    /// Start building a pipeline for `policy`.
    #[must_use]
    pub fn builder(policy: ResiliencePolicy) -> ResiliencePipelineBuilder {
        ResiliencePipelineBuilder {
            policy,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopEventSink),
            metrics: Arc::new(NoopMetricsSink),
        }
    }

    /// Policy name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The circuit breaker, if configured.
    #[must_use]
    pub const fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// The bulkhead, if configured.
    #[must_use]
    pub const fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    /// The rate limiter, if configured.
    #[must_use]
    pub fn rate_limiter(&self) -> Option<&dyn RateLimiter<String>> {
        self.limiter.as_deref()
    }

    /// Rate limit headers for `key`, if a rate limiter is configured.
    #[must_use]
    pub fn headers(&self, key: &str) -> Option<RateLimitHeaders> {
        self.limiter
            .as_ref()
            .map(|limiter| limiter.headers(&key.to_string()))
    }

    /// Run `operation` through every configured protection.
    ///
    /// `key` selects the rate limit bucket; `operation_name` selects the
    /// timeout. Failures that classify as a non-retryable [`ResilienceError`]
    /// kind end the retry loop early.
    ///
    /// # Errors
    ///
    /// `RateLimitExceeded`, `BulkheadFull`, `CircuitOpen`, `Cancelled` or
    /// `RetryExhausted` (whose cause is the last failure, possibly a
    /// `Timeout`).
    pub async fn execute<F, Fut, T, E>(
        &self,
        ctx: &CallContext,
        key: &str,
        operation_name: &str,
        operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let started = tokio::time::Instant::now();
        let result = self.run(ctx, key, operation_name, operation).await;
        let elapsed = started.elapsed();

        self.metrics.observe_latency(&self.name, elapsed);
        OperationMetrics::record_duration(&self.name, elapsed, result.is_ok());
        if let Err(err) = &result {
            tracing::debug!(policy = %self.name, operation = operation_name, error = %err, "Pipeline call failed");
        }
        result
    }

    async fn run<F, Fut, T, E>(
        &self,
        ctx: &CallContext,
        key: &str,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if let Some(limiter) = &self.limiter {
            limiter
                .allow(&key.to_string())
                .into_result(&self.name)
                .map_err(|err| err.with_correlation_id_opt(ctx.correlation_id()))?;
        }

        let _permit = match &self.bulkhead {
            Some(bulkhead) => Some(bulkhead.acquire(ctx).await?),
            None => None,
        };

        let timeouts = self.timeouts.as_ref();
        let attempt = || attempt_with_timeout(timeouts, ctx, operation_name, operation());

        match &self.breaker {
            Some(breaker) => {
                self.retry
                    .execute_with_circuit_breaker_if(ctx, breaker, attempt, is_retryable)
                    .await
            }
            None => self.retry.execute_if(ctx, attempt, is_retryable).await,
        }
    }
}

async fn attempt_with_timeout<Fut, T, E>(
    timeouts: Option<&TimeoutManager>,
    ctx: &CallContext,
    operation_name: &str,
    attempt: Fut,
) -> Result<T, BoxError>
where
    Fut: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    match timeouts {
        Some(timeouts) => match timeouts.run(ctx, operation_name, attempt).await {
            Ok(outcome) => outcome.map_err(Into::into),
            Err(timed_out) => Err(timed_out.into()),
        },
        None => attempt.await.map_err(Into::into),
    }
}

/// Failures from outside the taxonomy are retried; taxonomy kinds decide for themselves.
fn is_retryable(err: &BoxError) -> bool {
    kind_of(err.as_ref()).is_none_or(|kind| kind.is_retryable())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use resilience_core::config::{
        BulkheadConfig, CircuitBreakerConfig, RateLimitAlgorithm, RateLimitConfig, TimeoutConfig,
    };
    use resilience_core::ErrorKind;
    use resilience_testing::{RecordingMetricsSink, ScriptedOperation};
    use std::time::Duration;

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter_percent: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_without_retry_section() {
        let pipeline = ResiliencePipeline::builder(ResiliencePolicy::new("bare")).build().unwrap();
        let op = ScriptedOperation::always_failing();

        let err = pipeline
            .execute(&CallContext::new(), "k", "op", || op.call())
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::RetryExhausted));
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_rejects_before_running() {
        let mut policy = ResiliencePolicy::new("api");
        policy.rate_limit = Some(RateLimitConfig {
            algorithm: RateLimitAlgorithm::FixedWindow,
            limit: 1,
            window: Duration::from_secs(60),
            burst_size: 0,
        });
        let pipeline = ResiliencePipeline::builder(policy).build().unwrap();
        let op = ScriptedOperation::succeeding();
        let ctx = CallContext::new();

        pipeline.execute(&ctx, "user-1", "op", || op.call()).await.unwrap();
        let err = pipeline
            .execute(&ctx, "user-1", "op", || op.call())
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::RateLimitExceeded));
        assert!(err.retry_after().unwrap() > Duration::ZERO);
        assert_eq!(op.calls(), 1);

        // Other keys have their own allowance
        pipeline.execute(&ctx, "user-2", "op", || op.call()).await.unwrap();
        assert_eq!(pipeline.headers("user-2").unwrap().remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried() {
        let mut policy = ResiliencePolicy::new("slow");
        policy.retry = Some(retry());
        policy.timeout = Some(TimeoutConfig {
            default: Duration::from_millis(50),
            max: Duration::from_secs(1),
            per_operation: std::collections::HashMap::new(),
        });
        let pipeline = ResiliencePipeline::builder(policy).build().unwrap();

        let calls = std::sync::atomic::AtomicU32::new(0);
        let value = pipeline
            .execute(&CallContext::new(), "k", "query", || {
                let call = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                async move {
                    if call == 1 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok::<_, std::io::Error>(call)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_inside_pipeline() {
        let mut policy = ResiliencePolicy::new("flaky");
        policy.retry = Some(retry());
        policy.circuit_breaker = Some(
            CircuitBreakerConfig::builder()
                .failure_threshold(2)
                .build()
                .unwrap(),
        );
        policy.bulkhead = Some(BulkheadConfig::default());
        let pipeline = ResiliencePipeline::builder(policy).build().unwrap();
        let op = ScriptedOperation::always_failing();

        let err = pipeline
            .execute(&CallContext::new(), "k", "op", || op.call())
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::CircuitOpen));
        assert_eq!(op.calls(), 2);

        let err = pipeline
            .execute(&CallContext::new(), "k", "op", || op.call())
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::CircuitOpen));
        assert_eq!(op.calls(), 2);
        assert_eq!(pipeline.bulkhead().unwrap().metrics().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_reported_under_policy_name() {
        let metrics = Arc::new(RecordingMetricsSink::new());
        let pipeline = ResiliencePipeline::builder(ResiliencePolicy::new("orders"))
            .metrics_sink(metrics.clone())
            .build()
            .unwrap();
        let op = ScriptedOperation::succeeding();

        pipeline.execute(&CallContext::new(), "k", "op", || op.call()).await.unwrap();
        let _ = pipeline
            .execute(&CallContext::new(), "k", "op", || async {
                Err::<u32, _>(std::io::Error::other("down"))
            })
            .await;

        assert_eq!(metrics.count_for("orders"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_kind_stops_loop() {
        let mut policy = ResiliencePolicy::new("validate");
        policy.retry = Some(retry());
        let pipeline = ResiliencePipeline::builder(policy).build().unwrap();

        let calls = std::sync::atomic::AtomicU32::new(0);
        let err = pipeline
            .execute(&CallContext::new(), "k", "op", || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err::<(), _>(ResilienceError::validation("sku", "unknown")) }
            })
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::RetryExhausted));
        assert_eq!(err.attempts(), Some(1));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_policy_fails_build() {
        let mut policy = ResiliencePolicy::new("bad");
        policy.retry = Some(RetryConfig {
            multiplier: 1.0,
            ..RetryConfig::default()
        });
        let err = ResiliencePipeline::builder(policy).build().unwrap_err();
        assert!(err.is(ErrorKind::InvalidPolicy));
    }
}
