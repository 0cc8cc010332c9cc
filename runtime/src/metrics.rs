//! Prometheus metrics for the resilience components.
//!
//! Every component reports through the `metrics` facade, which is a no-op
//! until a recorder is installed. Installing one is the embedding service's
//! choice; [`MetricsExporter`] does it with a Prometheus HTTP listener:
//!
//! ```rust,no_run
//! use resilience_runtime::metrics::MetricsExporter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new("0.0.0.0:9090".parse()?);
//! exporter.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```
//!
//! Components:
//! - Rate limiter decisions
//! - Circuit breaker state and transitions
//! - Retry attempts and exhaustion
//! - Bulkhead occupancy and rejections
//! - Timeouts and end-to-end operation latency

use crate::circuit_breaker::CircuitState;
use crate::histogram::DEFAULT_LATENCY_BUCKETS;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// A global recorder is already installed
    #[error("Metrics recorder already installed")]
    AlreadyInstalled,
    /// The HTTP listener needs a Tokio runtime
    #[error("Metrics exporter must be started inside a Tokio runtime")]
    NoRuntime,
}

/// Prometheus exporter.
///
/// Installs the global `metrics` recorder and serves it over HTTP for
/// scraping. Latency histograms use [`DEFAULT_LATENCY_BUCKETS`].
pub struct MetricsExporter {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
    listener: Option<JoinHandle<()>>,
}

impl MetricsExporter {
    /// Create an exporter that will listen on `addr` (e.g., `0.0.0.0:9090`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            handle: None,
            listener: None,
        }
    }

    /// Install the recorder, describe every metric and start the listener.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::NoRuntime`] outside a Tokio runtime,
    /// [`MetricsError::AlreadyInstalled`] if a recorder is already set
    /// (only one per process), or [`MetricsError::Build`] if the exporter
    /// cannot be configured.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| MetricsError::NoRuntime)?;

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &DEFAULT_LATENCY_BUCKETS,
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;
        register_metrics();

        let addr = self.addr;
        self.listener = Some(runtime.spawn(async move {
            if exporter.await.is_err() {
                tracing::error!(addr = %addr, "Metrics listener stopped");
            }
        }));
        self.handle = Some(handle);

        tracing::info!(
            addr = %self.addr,
            "Metrics exporter started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Listen address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the exporter hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

impl Drop for MetricsExporter {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// Describe every metric the resilience components emit.
///
/// Descriptions go to the currently installed recorder; call after
/// installing one. [`MetricsExporter::start`] does this itself.
pub fn register_metrics() {
    // Rate limiting
    describe_counter!(
        "resilience_rate_limit_decisions_total",
        "Rate limiter decisions by limiter and outcome (allowed/denied)"
    );

    // Circuit breaker
    describe_gauge!(
        "resilience_circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "resilience_circuit_breaker_transitions_total",
        "Circuit breaker state transitions by breaker, from and to state"
    );
    describe_counter!(
        "resilience_circuit_breaker_calls_total",
        "Outcomes reported to circuit breakers"
    );
    describe_counter!(
        "resilience_circuit_breaker_rejections_total",
        "Calls rejected by an open or saturated half-open circuit"
    );

    // Retry
    describe_counter!(
        "resilience_retry_attempts_total",
        "Retries scheduled after a failed attempt"
    );
    describe_counter!(
        "resilience_retry_exhausted_total",
        "Operations that failed after all attempts"
    );

    // Bulkhead
    describe_gauge!(
        "resilience_bulkhead_active",
        "Operations currently holding a bulkhead permit"
    );
    describe_counter!(
        "resilience_bulkhead_rejections_total",
        "Operations rejected by a bulkhead by reason (queue_full/queue_timeout)"
    );

    // Timeouts and latency
    describe_counter!(
        "resilience_timeouts_total",
        "Operations that exceeded their timeout"
    );
    describe_histogram!(
        "resilience_operation_duration_seconds",
        "End-to-end latency of operations run through a resilience pipeline"
    );
}

/// Rate limiter metrics recorder.
pub struct RateLimitMetrics;

impl RateLimitMetrics {
    /// Record one admission decision.
    pub fn record_decision(limiter: &str, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "denied" };
        counter!(
            "resilience_rate_limit_decisions_total",
            "limiter" => limiter.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Circuit breaker metrics recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record circuit breaker state.
    ///
    /// 0 = Closed, 1 = `HalfOpen`, 2 = Open
    pub fn record_state(breaker: &str, state: CircuitState) {
        gauge!("resilience_circuit_breaker_state", "breaker" => breaker.to_string())
            .set(state.gauge_value());
    }

    /// Record a state transition and the new state.
    pub fn record_transition(breaker: &str, from: CircuitState, to: CircuitState) {
        counter!(
            "resilience_circuit_breaker_transitions_total",
            "breaker" => breaker.to_string(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        Self::record_state(breaker, to);
    }

    /// Record a reported call outcome.
    pub fn record_outcome(breaker: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        counter!(
            "resilience_circuit_breaker_calls_total",
            "breaker" => breaker.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Record a rejected call (circuit open).
    pub fn record_rejection(breaker: &str) {
        counter!("resilience_circuit_breaker_rejections_total", "breaker" => breaker.to_string())
            .increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry being scheduled.
    pub fn record_attempt(service: &str) {
        counter!("resilience_retry_attempts_total", "service" => service.to_string()).increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted(service: &str) {
        counter!("resilience_retry_exhausted_total", "service" => service.to_string())
            .increment(1);
    }
}

/// Bulkhead metrics recorder.
pub struct BulkheadMetrics;

impl BulkheadMetrics {
    /// Record the number of permits in use.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_active(partition: &str, active: usize) {
        gauge!("resilience_bulkhead_active", "partition" => partition.to_string())
            .set(active as f64);
    }

    /// Record a rejection; `reason` is `queue_full` or `queue_timeout`.
    pub fn record_rejection(partition: &str, reason: &'static str) {
        counter!(
            "resilience_bulkhead_rejections_total",
            "partition" => partition.to_string(),
            "reason" => reason
        )
        .increment(1);
    }
}

/// Timeout metrics recorder.
pub struct TimeoutMetrics;

impl TimeoutMetrics {
    /// Record an operation exceeding its timeout.
    pub fn record_timeout(operation: &str) {
        counter!("resilience_timeouts_total", "operation" => operation.to_string()).increment(1);
    }
}

/// End-to-end operation metrics recorder.
pub struct OperationMetrics;

impl OperationMetrics {
    /// Record the latency of one pipeline call.
    pub fn record_duration(policy: &str, elapsed: Duration, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        histogram!(
            "resilience_operation_duration_seconds",
            "policy" => policy.to_string(),
            "outcome" => outcome
        )
        .record(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exporter_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let exporter = MetricsExporter::new(addr);
        assert!(exporter.handle().is_none());
        assert!(exporter.render().is_none());
        assert_eq!(exporter.addr(), addr);
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let mut exporter = MetricsExporter::new("127.0.0.1:0".parse().unwrap());
        assert!(matches!(exporter.start(), Err(MetricsError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_start_serves_listener_once_per_process() {
        let mut exporter = MetricsExporter::new("127.0.0.1:0".parse().unwrap());
        exporter.start().unwrap();
        assert!(exporter.render().is_some());

        let mut second = MetricsExporter::new("127.0.0.1:0".parse().unwrap());
        assert!(matches!(second.start(), Err(MetricsError::AlreadyInstalled)));
    }

    #[test]
    fn test_recorders_without_installed_recorder() {
        // The facade drops everything when no recorder is installed
        register_metrics();
        RateLimitMetrics::record_decision("api", true);
        RateLimitMetrics::record_decision("api", false);
        CircuitBreakerMetrics::record_transition("db", CircuitState::Closed, CircuitState::Open);
        CircuitBreakerMetrics::record_outcome("db", false);
        CircuitBreakerMetrics::record_rejection("db");
        RetryMetrics::record_attempt("db");
        RetryMetrics::record_exhausted("db");
        BulkheadMetrics::record_active("db", 3);
        BulkheadMetrics::record_rejection("db", "queue_full");
        TimeoutMetrics::record_timeout("db.query");
        OperationMetrics::record_duration("db", Duration::from_millis(12), true);
    }

    #[test]
    fn test_recorded_values_render() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            register_metrics();
            RateLimitMetrics::record_decision("api", false);
            CircuitBreakerMetrics::record_transition("db", CircuitState::Closed, CircuitState::Open);
            RetryMetrics::record_attempt("db");
        });

        let rendered = handle.render();
        assert!(rendered.contains("resilience_rate_limit_decisions_total"));
        assert!(rendered.contains("outcome=\"denied\""));
        assert!(rendered.contains("resilience_circuit_breaker_state{breaker=\"db\"} 2"));
        assert!(rendered.contains("resilience_circuit_breaker_transitions_total"));
        assert!(rendered.contains("resilience_retry_attempts_total"));
    }
}
