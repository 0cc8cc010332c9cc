//! Domain events and the sinks that consume them.
//!
//! Components never talk to a global logger or registry. They are handed an
//! [`EventSink`] (audit/event collaborator) and a [`MetricsSink`] (latency
//! observations) at construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Type of resilience event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A failed attempt is about to be retried
    RetryAttempt,
    /// A rate limiter denied a request
    RateLimitHit,
    /// A circuit breaker changed state
    CircuitStateChange,
    /// A bulkhead rejected a request
    BulkheadRejection,
    /// An operation timed out
    Timeout,
}

impl EventType {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RetryAttempt => "retry_attempt",
            Self::RateLimitHit => "rate_limit_hit",
            Self::CircuitStateChange => "circuit_state_change",
            Self::BulkheadRejection => "bulkhead_rejection",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resilience event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResilienceEvent {
    /// What happened
    pub event_type: EventType,
    /// Service or component name
    pub service_name: String,
    /// Correlation id of the call, if known
    pub correlation_id: Option<String>,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Event-specific details
    pub metadata: BTreeMap<String, String>,
}

impl ResilienceEvent {
    /// Create an event timestamped `timestamp`.
    pub fn new(
        event_type: EventType,
        service_name: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            service_name: service_name.into(),
            correlation_id: None,
            timestamp,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a correlation id if one is present.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<&str>) -> Self {
        self.correlation_id = correlation_id.map(ToString::to_string);
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// Metadata value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Consumer of resilience events.
///
/// Called synchronously on the caller's task; implementations must not block.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: ResilienceEvent);
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: ResilienceEvent) {}
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: ResilienceEvent) {
        (**self).emit(event);
    }
}

/// Consumer of per-operation latency observations.
pub trait MetricsSink: Send + Sync {
    /// Record how long the named operation took.
    fn observe_latency(&self, name: &str, elapsed: Duration);
}

/// Sink that drops every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn observe_latency(&self, _name: &str, _elapsed: Duration) {}
}

impl<S: MetricsSink + ?Sized> MetricsSink for Arc<S> {
    fn observe_latency(&self, name: &str, elapsed: Duration) {
        (**self).observe_latency(name, elapsed);
    }
}
