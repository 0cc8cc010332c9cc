//! # Resilience Runtime
//!
//! Call-wrapping primitives that protect inter-service calls from overload
//! and cascading failure.
//!
//! ## Core Components
//!
//! - **Rate limiters**: token bucket, sliding window and fixed window admission
//! - **Circuit breaker**: three-state failure accrual with half-open probing
//! - **Retry executor**: exponential backoff with jitter, cancellable waits
//! - **Bulkhead**: bounded concurrency with a bounded wait queue
//! - **Timeout manager**: per-operation deadlines
//! - **Pipeline**: all of the above composed from one policy
//! - **Histogram**: fixed-bucket latency histograms with percentile estimates
//!
//! Admission checks and state changes run synchronously on the caller's task.
//! The retry backoff, bulkhead queueing and timeouts are the only suspension
//! points, and each of them races the call's cancellation token. Nothing here
//! spawns background work.
//!
//! ## Example
//!
//! ```
//! use resilience_core::config::CircuitBreakerConfig;
//! use resilience_runtime::{CallContext, CircuitBreaker, RetryExecutor, RetryPolicy};
//!
//! # async fn example() -> Result<(), resilience_core::ResilienceError> {
//! let breaker = CircuitBreaker::new("ledger", CircuitBreakerConfig::default())?;
//! let executor = RetryExecutor::new("ledger", RetryPolicy::default());
//!
//! let balance = executor
//!     .execute_with_circuit_breaker(&CallContext::new(), &breaker, || async {
//!         Ok::<_, std::io::Error>(100)
//!     })
//!     .await?;
//! assert_eq!(balance, 100);
//! # Ok(())
//! # }
//! ```

/// Bulkhead pattern for concurrency isolation
pub mod bulkhead;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Cancellation and correlation carried through a call
pub mod context;

/// Event sink backed by `tracing`
pub mod events;

/// Latency histograms
pub mod histogram;

/// Prometheus metrics for observability
pub mod metrics;

/// Composed resilience pipeline
pub mod pipeline;

/// Rate limiting algorithms
pub mod rate_limiter;

/// Retry logic with exponential backoff
pub mod retry;

/// Per-operation timeouts
pub mod timeout;

pub use bulkhead::{Bulkhead, BulkheadRegistry, BulkheadStats};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use context::CallContext;
pub use events::TracingEventSink;
pub use histogram::{Histogram, LatencyHistograms};
pub use pipeline::ResiliencePipeline;
pub use rate_limiter::{build_rate_limiter, FixedWindow, RateLimiter, SlidingWindow, TokenBucket};
pub use retry::{RetryExecutor, RetryPolicy};
pub use timeout::TimeoutManager;
