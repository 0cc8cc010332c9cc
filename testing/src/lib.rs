//! # Resilience Testing
//!
//! Testing utilities for the resilience execution core.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - Recording sinks that capture events and latency observations
//! - Scripted operations that fail a chosen number of times
//! - proptest strategies for policy configs and traffic patterns
//!
//! ## Example
//!
//! ```
//! use resilience_testing::{test_clock, ManualClock};
//! use resilience_core::environment::Clock;
//! use std::time::Duration;
//!
//! let clock = ManualClock::new(test_clock().now());
//! let start = clock.now();
//! clock.advance(Duration::from_secs(30));
//! assert_eq!((clock.now() - start).num_seconds(), 30);
//! ```

use chrono::{DateTime, Utc};
use resilience_core::environment::Clock;

/// Mock implementations of environment and sink traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::TimeDelta;
    use parking_lot::Mutex;
    use resilience_core::event::{EventSink, EventType, MetricsSink, ResilienceEvent};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time.
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }

    /// Clock that only moves when told to.
    ///
    /// Share it behind an `Arc` between the component under test and the test
    /// body, then call [`advance`](Self::advance) to simulate elapsed time.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move time forward.
        pub fn advance(&self, by: Duration) {
            let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
            let mut time = self.time.lock();
            *time = time.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }

        /// Jump to `time` (may move backwards).
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock() = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock()
        }
    }

    /// Event sink that keeps every event for later assertions.
    #[derive(Debug, Default)]
    pub struct RecordingEventSink {
        events: Mutex<Vec<ResilienceEvent>>,
    }

    impl RecordingEventSink {
        /// Create an empty sink.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// All events in emission order.
        #[must_use]
        pub fn events(&self) -> Vec<ResilienceEvent> {
            self.events.lock().clone()
        }

        /// Events of one type in emission order.
        #[must_use]
        pub fn events_of(&self, event_type: EventType) -> Vec<ResilienceEvent> {
            self.events
                .lock()
                .iter()
                .filter(|event| event.event_type == event_type)
                .cloned()
                .collect()
        }

        /// Number of events of one type.
        #[must_use]
        pub fn count_of(&self, event_type: EventType) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|event| event.event_type == event_type)
                .count()
        }

        /// Forget everything recorded so far.
        pub fn clear(&self) {
            self.events.lock().clear();
        }
    }

    impl EventSink for RecordingEventSink {
        fn emit(&self, event: ResilienceEvent) {
            self.events.lock().push(event);
        }
    }

    /// Metrics sink that keeps every latency observation.
    #[derive(Debug, Default)]
    pub struct RecordingMetricsSink {
        observations: Mutex<Vec<(String, Duration)>>,
    }

    impl RecordingMetricsSink {
        /// Create an empty sink.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// All `(name, elapsed)` observations in order.
        #[must_use]
        pub fn observations(&self) -> Vec<(String, Duration)> {
            self.observations.lock().clone()
        }

        /// Observations recorded under `name`.
        #[must_use]
        pub fn count_for(&self, name: &str) -> usize {
            self.observations
                .lock()
                .iter()
                .filter(|(n, _)| n == name)
                .count()
        }
    }

    impl MetricsSink for RecordingMetricsSink {
        fn observe_latency(&self, name: &str, elapsed: Duration) {
            self.observations.lock().push((name.to_string(), elapsed));
        }
    }
}

/// Scripted operations for exercising retry and breaker paths.
pub mod helpers {
    use std::future::{ready, Ready};
    use std::sync::atomic::{AtomicU32, Ordering};
    use thiserror::Error;

    /// Failure produced by [`ScriptedOperation`].
    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    #[error("scripted failure on call {call}")]
    pub struct ScriptedFailure {
        /// 1-based call number that failed
        pub call: u32,
    }

    /// Operation that fails its first `failures` calls, then succeeds.
    ///
    /// On success it returns the 1-based call number.
    #[derive(Debug)]
    pub struct ScriptedOperation {
        failures: u32,
        calls: AtomicU32,
    }

    impl ScriptedOperation {
        /// Fail the first `failures` calls.
        #[must_use]
        pub const fn failing(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }

        /// Never succeed.
        #[must_use]
        pub const fn always_failing() -> Self {
            Self::failing(u32::MAX)
        }

        /// Always succeed.
        #[must_use]
        pub const fn succeeding() -> Self {
            Self::failing(0)
        }

        /// Invoke the operation.
        ///
        /// # Errors
        ///
        /// Returns [`ScriptedFailure`] while the scripted failures last.
        pub fn call(&self) -> Ready<Result<u32, ScriptedFailure>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                ready(Err(ScriptedFailure { call }))
            } else {
                ready(Ok(call))
            }
        }

        /// Number of times the operation was invoked.
        #[must_use]
        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    /// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// proptest strategies for resilience configs and traffic.
pub mod properties {
    use proptest::prelude::*;
    use resilience_core::config::{CircuitBreakerConfig, RetryConfig};
    use std::time::Duration;

    /// Valid retry configs with delays small enough for fast tests.
    pub fn retry_config() -> impl Strategy<Value = RetryConfig> {
        (1u32..=6, 1u64..=50, 1u64..=20, 1.1f64..4.0, 0.0f64..=1.0).prop_map(
            |(max_attempts, base_ms, cap_factor, multiplier, jitter_percent)| RetryConfig {
                max_attempts,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(base_ms * cap_factor),
                multiplier,
                jitter_percent,
            },
        )
    }

    /// Valid circuit breaker configs.
    pub fn circuit_breaker_config() -> impl Strategy<Value = CircuitBreakerConfig> {
        (1u32..=10, 1u32..=5, 1u64..=120, 1u32..=3).prop_map(
            |(failure_threshold, success_threshold, timeout_secs, probe_count)| {
                CircuitBreakerConfig {
                    failure_threshold,
                    success_threshold,
                    timeout: Duration::from_secs(timeout_secs),
                    probe_count,
                }
            },
        )
    }

    /// Gaps between consecutive requests, from back-to-back to a few seconds.
    pub fn traffic_gaps(max_len: usize) -> impl Strategy<Value = Vec<Duration>> {
        prop::collection::vec(
            prop_oneof![
                3 => Just(Duration::ZERO),
                5 => (1u64..=500).prop_map(Duration::from_millis),
                1 => (1u64..=5).prop_map(Duration::from_secs),
            ],
            1..max_len,
        )
    }
}

pub use helpers::{init_tracing, ScriptedFailure, ScriptedOperation};
pub use mocks::{test_clock, FixedClock, ManualClock, RecordingEventSink, RecordingMetricsSink};
