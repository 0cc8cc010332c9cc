//! Resilience error taxonomy and transport mapping.
//!
//! Every failure produced by the resilience primitives is a [`ResilienceError`]
//! tagged with an [`ErrorKind`]. Callers branch on the kind, never on message
//! text. At the RPC/HTTP boundary the kind maps onto a [`TransportClass`]
//! (gRPC status) and an HTTP status code:
//!
//! ```text
//! Kind                         Class               gRPC   HTTP
//! ---------------------------  ------------------  -----  ----
//! CircuitOpen                  Unavailable           14    503
//! BulkheadFull                 ResourceExhausted      8    503
//! RateLimitExceeded            ResourceExhausted      8    429
//! Timeout                      DeadlineExceeded       4    504
//! RetryExhausted               Aborted               10    502
//! InvalidPolicy, Validation    InvalidArgument        3    400
//! ServiceUnavailable           Unavailable           14    503
//! Cancelled                    Cancelled              1    499
//! (anything else)              Internal              13    500
//! ```
//!
//! # Example
//!
//! ```
//! use resilience_core::error::{ErrorKind, ResilienceError, TransportClass};
//! use std::time::Duration;
//!
//! let err = ResilienceError::rate_limit_exceeded("payments", Duration::from_secs(2));
//! assert!(err.is(ErrorKind::RateLimitExceeded));
//! assert_eq!(err.transport_class(), TransportClass::ResourceExhausted);
//! assert_eq!(err.http_status(), 429);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Boxed error used as the cause of a [`ResilienceError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Kind of resilience failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Circuit breaker rejected the call.
    CircuitOpen,
    /// Rate limiter rejected the call.
    RateLimitExceeded,
    /// Operation did not complete in time.
    Timeout,
    /// Bulkhead partition has no capacity left.
    BulkheadFull,
    /// All retry attempts failed.
    RetryExhausted,
    /// Policy configuration is invalid.
    InvalidPolicy,
    /// Downstream service is unavailable.
    ServiceUnavailable,
    /// Input validation failed.
    Validation,
    /// Caller cancelled the operation.
    Cancelled,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::CircuitOpen,
        Self::RateLimitExceeded,
        Self::Timeout,
        Self::BulkheadFull,
        Self::RetryExhausted,
        Self::InvalidPolicy,
        Self::ServiceUnavailable,
        Self::Validation,
        Self::Cancelled,
    ];

    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Timeout => "TIMEOUT",
            Self::BulkheadFull => "BULKHEAD_FULL",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::InvalidPolicy => "INVALID_POLICY",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Validation => "VALIDATION_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Transport class this kind maps onto.
    #[must_use]
    pub const fn transport_class(self) -> TransportClass {
        match self {
            Self::CircuitOpen | Self::ServiceUnavailable => TransportClass::Unavailable,
            Self::RateLimitExceeded | Self::BulkheadFull => TransportClass::ResourceExhausted,
            Self::Timeout => TransportClass::DeadlineExceeded,
            Self::RetryExhausted => TransportClass::Aborted,
            Self::InvalidPolicy | Self::Validation => TransportClass::InvalidArgument,
            Self::Cancelled => TransportClass::Cancelled,
        }
    }

    /// HTTP status code for this kind.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::CircuitOpen | Self::BulkheadFull | Self::ServiceUnavailable => 503,
            Self::RateLimitExceeded => 429,
            Self::Timeout => 504,
            Self::RetryExhausted => 502,
            Self::InvalidPolicy | Self::Validation => 400,
            Self::Cancelled => 499,
        }
    }

    /// Numeric gRPC status code for this kind.
    #[must_use]
    pub const fn grpc_code(self) -> i32 {
        self.transport_class().grpc_code()
    }

    /// Whether a caller may reasonably retry after this failure.
    ///
    /// Admission rejections carry a `retry_after` hint instead and are not
    /// retried in-process.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::ServiceUnavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Transport-level status class (gRPC status codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportClass {
    /// Caller cancelled.
    Cancelled,
    /// Bad arguments or configuration.
    InvalidArgument,
    /// Deadline passed before completion.
    DeadlineExceeded,
    /// Quota or capacity exhausted.
    ResourceExhausted,
    /// Operation aborted after giving up.
    Aborted,
    /// Unclassified failure.
    Internal,
    /// Dependency unavailable.
    Unavailable,
}

impl TransportClass {
    /// Numeric gRPC status code.
    #[must_use]
    pub const fn grpc_code(self) -> i32 {
        match self {
            Self::Cancelled => 1,
            Self::InvalidArgument => 3,
            Self::DeadlineExceeded => 4,
            Self::ResourceExhausted => 8,
            Self::Aborted => 10,
            Self::Internal => 13,
            Self::Unavailable => 14,
        }
    }

    /// Class for a numeric gRPC status code. Unknown codes are `Internal`.
    #[must_use]
    pub const fn from_grpc_code(code: i32) -> Self {
        match code {
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            8 => Self::ResourceExhausted,
            10 => Self::Aborted,
            14 => Self::Unavailable,
            _ => Self::Internal,
        }
    }

    /// Kinds that map onto this class.
    #[must_use]
    pub fn kinds(self) -> Vec<ErrorKind> {
        ErrorKind::ALL
            .into_iter()
            .filter(|kind| kind.transport_class() == self)
            .collect()
    }
}

/// Typed failure signal produced by the resilience primitives.
///
/// Equality compares kinds only.
#[derive(Debug, Error)]
#[error("[{kind}] {service_name}: {message}")]
pub struct ResilienceError {
    kind: ErrorKind,
    service_name: String,
    message: String,
    correlation_id: Option<String>,
    retry_after: Option<Duration>,
    attempts: Option<u32>,
    metadata: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
    #[source]
    cause: Option<BoxError>,
}

impl ResilienceError {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind, service_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            service_name: service_name.into(),
            message: message.into(),
            correlation_id: None,
            retry_after: None,
            attempts: None,
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
            cause: None,
        }
    }

    /// Circuit breaker is open; retry after the remaining cooldown.
    pub fn circuit_open(service_name: impl Into<String>, retry_after: Duration) -> Self {
        Self::new(ErrorKind::CircuitOpen, service_name, "circuit breaker is open")
            .with_retry_after(retry_after)
    }

    /// Rate limit exceeded; retry after the given delay.
    pub fn rate_limit_exceeded(service_name: impl Into<String>, retry_after: Duration) -> Self {
        Self::new(ErrorKind::RateLimitExceeded, service_name, "rate limit exceeded")
            .with_retry_after(retry_after)
    }

    /// Operation exceeded its timeout.
    pub fn timeout(service_name: impl Into<String>, timeout: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            service_name,
            format!("operation timed out after {}ms", timeout.as_millis()),
        )
        .with_metadata("timeout_ms", timeout.as_millis().to_string())
    }

    /// Bulkhead partition is full.
    pub fn bulkhead_full(
        service_name: impl Into<String>,
        partition: &str,
        max_concurrent: usize,
        max_queue: usize,
    ) -> Self {
        Self::new(
            ErrorKind::BulkheadFull,
            service_name,
            format!("bulkhead partition '{partition}' is full"),
        )
        .with_metadata("partition", partition)
        .with_metadata("max_concurrent", max_concurrent.to_string())
        .with_metadata("max_queue", max_queue.to_string())
    }

    /// All attempts failed; `cause` is the last underlying failure.
    pub fn retry_exhausted(service_name: impl Into<String>, attempts: u32, cause: BoxError) -> Self {
        let mut err = Self::new(
            ErrorKind::RetryExhausted,
            service_name,
            format!("retry exhausted after {attempts} attempts"),
        )
        .with_metadata("attempts", attempts.to_string());
        err.attempts = Some(attempts);
        err.with_cause(cause)
    }

    /// Policy field failed validation.
    pub fn invalid_policy(field: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(ErrorKind::InvalidPolicy, "policy", format!("{field}: {reason}"))
            .with_metadata("field", field)
    }

    /// Downstream service is unavailable.
    pub fn service_unavailable(service_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, service_name, message)
    }

    /// Input field failed validation.
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(ErrorKind::Validation, "validation", format!("{field}: {reason}"))
            .with_metadata("field", field)
    }

    /// Caller cancelled the operation.
    pub fn cancelled(service_name: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, service_name, "operation cancelled")
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach a correlation id if one is present.
    #[must_use]
    pub fn with_correlation_id_opt(mut self, correlation_id: Option<&str>) -> Self {
        if let Some(id) = correlation_id {
            self.correlation_id = Some(id.to_string());
        }
        self
    }

    /// Attach a retry-after hint.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self.metadata
            .insert("retry_after_ms".to_string(), retry_after.as_millis().to_string());
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether this error is of the given kind.
    #[must_use]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Service that produced the error.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Correlation id, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Retry-after hint for admission rejections.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Attempts made, for `RetryExhausted`.
    #[must_use]
    pub const fn attempts(&self) -> Option<u32> {
        self.attempts
    }

    /// Kind-specific metadata.
    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// When the error was created.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Underlying cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Take ownership of the underlying cause.
    #[must_use]
    pub fn into_cause(self) -> Option<BoxError> {
        self.cause
    }

    /// Transport class for this error.
    #[must_use]
    pub const fn transport_class(&self) -> TransportClass {
        self.kind.transport_class()
    }

    /// HTTP status code for this error.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    /// Numeric gRPC status code for this error.
    #[must_use]
    pub const fn grpc_code(&self) -> i32 {
        self.kind.grpc_code()
    }

    /// Boundary view of this error.
    #[must_use]
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.kind.code(),
            message: self.message.clone(),
            service_name: self.service_name.clone(),
            correlation_id: self.correlation_id.clone(),
            retry_after_ms: self
                .retry_after
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            http_status: self.http_status(),
            grpc_code: self.grpc_code(),
        }
    }
}

impl PartialEq for ResilienceError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl PartialEq<ErrorKind> for ResilienceError {
    fn eq(&self, other: &ErrorKind) -> bool {
        self.kind == *other
    }
}

/// Serializable error body for transport boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    /// Stable kind code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Service that produced the error.
    pub service_name: String,
    /// Correlation id, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Retry-after hint in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// HTTP status code.
    pub http_status: u16,
    /// Numeric gRPC status code.
    pub grpc_code: i32,
}

/// Find the first [`ResilienceError`] in an error chain and return its kind.
#[must_use]
pub fn kind_of(err: &(dyn std::error::Error + 'static)) -> Option<ErrorKind> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(resilience) = e.downcast_ref::<ResilienceError>() {
            return Some(resilience.kind());
        }
        current = e.source();
    }
    None
}

/// Transport class for an arbitrary error chain; `Internal` when unrecognized.
#[must_use]
pub fn transport_class_of(err: &(dyn std::error::Error + 'static)) -> TransportClass {
    kind_of(err).map_or(TransportClass::Internal, ErrorKind::transport_class)
}

/// HTTP status for an arbitrary error chain; 500 when unrecognized.
#[must_use]
pub fn http_status_of(err: &(dyn std::error::Error + 'static)) -> u16 {
    kind_of(err).map_or(500, ErrorKind::http_status)
}
