//! # Resilience Core
//!
//! Types and traits shared by the resilience primitives.
//!
//! This crate defines:
//! - [`error`]: the failure taxonomy and its HTTP/gRPC mapping
//! - [`config`]: typed, validated policy configuration
//! - [`rate_limit`]: admission decisions and rate limit headers
//! - [`event`]: domain events plus the event and metrics sink traits
//! - [`environment`]: the injectable [`Clock`](environment::Clock)
//!
//! The executing primitives live in `resilience-runtime`.

pub mod config;
pub mod error;
pub mod event;
pub mod rate_limit;

pub use error::{BoxError, ErrorKind, ResilienceError, TransportClass};

/// Injectable environment dependencies.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time for deterministic tests
    ///
    /// # Examples
    ///
    /// ```
    /// use resilience_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
        fn now(&self) -> DateTime<Utc> {
            (**self).now()
        }
    }

    /// Non-negative elapsed time between two instants; zero if `later` is earlier.
    #[must_use]
    pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> std::time::Duration {
        (later - earlier).to_std().unwrap_or_default()
    }
}
