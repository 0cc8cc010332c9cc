//! Per-operation timeouts.
//!
//! The timeout for an operation is its override if one is configured, else
//! the default, and never more than `max`.

use crate::context::CallContext;
use crate::metrics::TimeoutMetrics;
use resilience_core::config::TimeoutConfig;
use resilience_core::environment::{Clock, SystemClock};
use resilience_core::event::{EventSink, EventType, NoopEventSink, ResilienceEvent};
use resilience_core::ResilienceError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Resolves and enforces operation timeouts for one service.
pub struct TimeoutManager {
    service: String,
    config: TimeoutConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("service", &self.service)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TimeoutManager {
    /// Manager for calls to `service`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if the config is invalid.
    pub fn new(service: impl Into<String>, config: TimeoutConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            service: service.into(),
            config,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopEventSink),
        })
    }

    /// Use `clock` for event timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Emit timeout events to `events`.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Effective timeout for `operation`.
    #[must_use]
    pub fn timeout_for(&self, operation: &str) -> Duration {
        self.config
            .per_operation
            .get(operation)
            .copied()
            .unwrap_or(self.config.default)
            .min(self.config.max)
    }

    /// Run `future` under the timeout for `operation`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if the future does not finish in time, `Cancelled`
    /// if `ctx` is cancelled first.
    pub async fn run<F>(
        &self,
        ctx: &CallContext,
        operation: &str,
        future: F,
    ) -> Result<F::Output, ResilienceError>
    where
        F: Future,
    {
        let limit = self.timeout_for(operation);

        let outcome = tokio::select! {
            biased;
            () = ctx.cancelled() => {
                return Err(ResilienceError::cancelled(&self.service)
                    .with_correlation_id_opt(ctx.correlation_id()));
            }
            outcome = tokio::time::timeout(limit, future) => outcome,
        };

        outcome.map_err(|_elapsed| {
            tracing::warn!(
                service = %self.service,
                operation,
                timeout_ms = limit.as_millis(),
                "Operation timed out"
            );
            TimeoutMetrics::record_timeout(operation);
            self.events.emit(
                ResilienceEvent::new(EventType::Timeout, &self.service, self.clock.now())
                    .with_correlation_id(ctx.correlation_id())
                    .with_metadata("operation", operation)
                    .with_metadata("timeout_ms", limit.as_millis()),
            );
            ResilienceError::timeout(&self.service, limit)
                .with_metadata("operation", operation)
                .with_correlation_id_opt(ctx.correlation_id())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use resilience_core::ErrorKind;
    use resilience_testing::RecordingEventSink;
    use std::collections::HashMap;

    fn manager() -> TimeoutManager {
        let config = TimeoutConfig {
            default: Duration::from_secs(2),
            max: Duration::from_secs(5),
            per_operation: HashMap::from([
                ("fast".to_string(), Duration::from_millis(100)),
                ("export".to_string(), Duration::from_secs(600)),
            ]),
        };
        TimeoutManager::new("reports", config).unwrap()
    }

    #[test]
    fn test_timeout_resolution() {
        let manager = manager();
        assert_eq!(manager.timeout_for("fast"), Duration::from_millis(100));
        assert_eq!(manager.timeout_for("unknown"), Duration::from_secs(2));
        // Overrides are capped at max
        assert_eq!(manager.timeout_for("export"), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_within_timeout() {
        let value = manager()
            .run(&CallContext::new(), "fast", async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                7
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let events = Arc::new(RecordingEventSink::new());
        let manager = manager().with_event_sink(events.clone());
        let ctx = CallContext::new().with_correlation_id("req-5");

        let err = manager
            .run(&ctx, "fast", tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap_err();

        assert!(err.is(ErrorKind::Timeout));
        assert!(err.kind().is_retryable());
        assert_eq!(err.http_status(), 504);
        assert_eq!(err.correlation_id(), Some("req-5"));

        let timeouts = events.events_of(EventType::Timeout);
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].get("operation"), Some("fast"));
        assert_eq!(timeouts[0].get("timeout_ms"), Some("100"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_beats_timeout() {
        let ctx = CallContext::new();
        ctx.cancel();

        let err = manager()
            .run(&ctx, "fast", std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::Cancelled));
    }

    #[test]
    fn test_invalid_config() {
        let config = TimeoutConfig {
            default: Duration::from_secs(10),
            max: Duration::from_secs(1),
            per_operation: HashMap::new(),
        };
        assert!(TimeoutManager::new("svc", config).is_err());
    }
}
