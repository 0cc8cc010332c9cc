//! Typed policy configuration.
//!
//! Configuration is handed to the resilience primitives as plain structs by the
//! embedding service. Every section has production defaults and a `validate()`
//! that fails with [`ErrorKind::InvalidPolicy`](crate::error::ErrorKind) instead
//! of clamping bad values.
//!
//! Durations serialize as integer milliseconds:
//!
//! ```toml
//! name = "payments"
//!
//! [retry]
//! max_attempts = 4
//! base_delay_ms = 50
//! max_delay_ms = 2000
//! multiplier = 2.0
//! jitter_percent = 0.2
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! success_threshold = 2
//! timeout_ms = 30000
//! probe_count = 1
//! ```

use crate::error::ResilienceError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Serde helpers for `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a duration as milliseconds.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize a duration from milliseconds.
    ///
    /// # Errors
    ///
    /// Fails when the value is not an unsigned integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serde helpers for a map of named durations in milliseconds.
mod duration_ms_map {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &HashMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value
            .iter()
            .map(|(k, v)| (k.clone(), u64::try_from(v.as_millis()).unwrap_or(u64::MAX)))
            .collect::<HashMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<String, Duration>, D::Error> {
        let raw = HashMap::<String, u64>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, Duration::from_millis(v)))
            .collect())
    }
}

/// Retry/backoff configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first (>= 1)
    pub max_attempts: u32,
    /// Delay before the first retry (> 0)
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    /// Cap on any single delay (>= `base_delay`)
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Geometric growth factor (> 1)
    pub multiplier: f64,
    /// Symmetric jitter as a fraction of the delay, in `[0, 1]`
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_percent: 0.1,
        }
    }
}

impl RetryConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` naming the first offending field.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_attempts < 1 {
            return Err(ResilienceError::invalid_policy("max_attempts", "must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(ResilienceError::invalid_policy("base_delay", "must be positive"));
        }
        if self.max_delay < self.base_delay {
            return Err(ResilienceError::invalid_policy(
                "max_delay",
                "must be greater than or equal to base_delay",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return Err(ResilienceError::invalid_policy("multiplier", "must be greater than 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter_percent) {
            return Err(ResilienceError::invalid_policy(
                "jitter_percent",
                "must be between 0 and 1",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Maximum concurrent probes while half-open
    pub probe_count: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            probe_count: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config builder.
    #[must_use]
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            config: Self::default(),
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` naming the first offending field.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold < 1 {
            return Err(ResilienceError::invalid_policy(
                "failure_threshold",
                "must be at least 1",
            ));
        }
        if self.success_threshold < 1 {
            return Err(ResilienceError::invalid_policy(
                "success_threshold",
                "must be at least 1",
            ));
        }
        if self.timeout.is_zero() {
            return Err(ResilienceError::invalid_policy("timeout", "must be positive"));
        }
        if self.probe_count < 1 {
            return Err(ResilienceError::invalid_policy("probe_count", "must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Set consecutive failures before opening.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set consecutive half-open successes before closing.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Set how long to stay open before probing.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set maximum concurrent half-open probes.
    #[must_use]
    pub const fn probe_count(mut self, probes: u32) -> Self {
        self.config.probe_count = probes;
        self
    }

    /// Build and validate the config.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if any field is out of range.
    pub fn build(self) -> Result<CircuitBreakerConfig, ResilienceError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Continuous refill, burst up to capacity
    #[default]
    TokenBucket,
    /// Moving window over a timestamp log
    SlidingWindow,
    /// Discrete non-overlapping windows
    FixedWindow,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Which algorithm to run
    pub algorithm: RateLimitAlgorithm,
    /// Requests per window
    pub limit: u32,
    /// Window length
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,
    /// Token bucket capacity; `0` means use `limit`
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            limit: 100,
            window: Duration::from_secs(1),
            burst_size: 10,
        }
    }
}

impl RateLimitConfig {
    /// Token bucket capacity.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        if self.burst_size > 0 { self.burst_size } else { self.limit }
    }

    /// Token bucket refill rate in tokens per second.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.limit) / self.window.as_secs_f64()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if the limit or window is zero.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.limit < 1 {
            return Err(ResilienceError::invalid_policy("limit", "must be at least 1"));
        }
        if self.window.is_zero() {
            return Err(ResilienceError::invalid_policy("window", "must be positive"));
        }
        Ok(())
    }
}

/// Bulkhead configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Permits available concurrently
    pub max_concurrent: usize,
    /// Callers allowed to wait for a permit
    pub max_queue: usize,
    /// How long a queued caller waits
    #[serde(rename = "queue_timeout_ms", with = "duration_ms")]
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue: 100,
            queue_timeout: Duration::from_secs(5),
        }
    }
}

impl BulkheadConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if `max_concurrent` is zero.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_concurrent < 1 {
            return Err(ResilienceError::invalid_policy("max_concurrent", "must be at least 1"));
        }
        Ok(())
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Timeout for operations without an override
    #[serde(rename = "default_ms", with = "duration_ms")]
    pub default: Duration,
    /// Upper bound applied to every timeout
    #[serde(rename = "max_ms", with = "duration_ms")]
    pub max: Duration,
    /// Per-operation overrides
    #[serde(rename = "per_operation_ms", with = "duration_ms_map")]
    pub per_operation: HashMap<String, Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(30),
            max: Duration::from_secs(60),
            per_operation: HashMap::new(),
        }
    }
}

impl TimeoutConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` for zero timeouts or a default above `max`.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.default.is_zero() {
            return Err(ResilienceError::invalid_policy("default", "must be positive"));
        }
        if self.max < self.default {
            return Err(ResilienceError::invalid_policy(
                "max",
                "must be greater than or equal to default",
            ));
        }
        if let Some((name, _)) = self.per_operation.iter().find(|(_, d)| d.is_zero()) {
            return Err(ResilienceError::invalid_policy(
                "per_operation",
                format!("timeout for '{name}' must be positive"),
            ));
        }
        Ok(())
    }
}

/// Named aggregate of the resilience sections applied to one call path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResiliencePolicy {
    /// Policy name, used as the service name in errors and metrics
    pub name: String,
    /// Retry section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Circuit breaker section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Rate limit section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    /// Bulkhead section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadConfig>,
    /// Timeout section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,
}

impl ResiliencePolicy {
    /// Create an empty policy with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse a policy from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if the text does not parse or fails validation.
    pub fn from_toml_str(text: &str) -> Result<Self, ResilienceError> {
        let policy: Self = toml::from_str(text).map_err(|e| {
            ResilienceError::invalid_policy("policy", "could not parse TOML").with_cause(e)
        })?;
        policy.validate()?;
        Ok(policy)
    }

    /// Validate every configured section.
    ///
    /// # Errors
    ///
    /// Returns the first `InvalidPolicy` found.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.name.trim().is_empty() {
            return Err(ResilienceError::invalid_policy("name", "must not be empty"));
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(cb) = &self.circuit_breaker {
            cb.validate()?;
        }
        if let Some(rl) = &self.rate_limit {
            rl.validate()?;
        }
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.validate()?;
        }
        if let Some(timeout) = &self.timeout {
            timeout.validate()?;
        }
        Ok(())
    }
}
