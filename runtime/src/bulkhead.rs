//! Bulkhead pattern for resource isolation.
//!
//! Named after ship bulkheads that stop water flooding the entire ship, a
//! bulkhead caps how many operations may use one downstream partition at a
//! time, so a slow dependency cannot absorb every task in the process.
//!
//! A caller that finds every permit taken waits in a bounded queue:
//!
//! ```text
//! permit free      ──▶ run immediately
//! queue has room   ──▶ wait up to queue_timeout, then BulkheadFull
//! queue full       ──▶ BulkheadFull immediately
//! ```
//!
//! ## Usage
//!
//! ```
//! use resilience_core::config::BulkheadConfig;
//! use resilience_runtime::bulkhead::Bulkhead;
//! use resilience_runtime::context::CallContext;
//!
//! # async fn example() -> Result<(), resilience_core::ResilienceError> {
//! let bulkhead = Bulkhead::new("payments-db", BulkheadConfig::default())?;
//! let rows = bulkhead
//!     .execute(&CallContext::new(), async { 42 })
//!     .await?;
//! assert_eq!(rows, 42);
//! # Ok(())
//! # }
//! ```

use crate::context::CallContext;
use crate::metrics::BulkheadMetrics;
use parking_lot::RwLock;
use resilience_core::config::BulkheadConfig;
use resilience_core::environment::{Clock, SystemClock};
use resilience_core::event::{EventSink, EventType, NoopEventSink, ResilienceEvent};
use resilience_core::ResilienceError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Concurrency partition with a bounded wait queue.
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    semaphore: Semaphore,
    queued: AtomicUsize,
    rejected: AtomicU64,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("stats", &self.metrics())
            .finish_non_exhaustive()
    }
}

/// Permit held while an operation runs; released on drop.
#[derive(Debug)]
pub struct BulkheadPermit<'a> {
    bulkhead: &'a Bulkhead,
    _permit: SemaphorePermit<'a>,
}

impl Drop for BulkheadPermit<'_> {
    fn drop(&mut self) {
        // The semaphore permit is released after this body runs
        BulkheadMetrics::record_active(&self.bulkhead.name, self.bulkhead.active().saturating_sub(1));
    }
}

/// Point-in-time bulkhead counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadStats {
    /// Permits in use
    pub active: usize,
    /// Callers waiting for a permit
    pub queued: usize,
    /// Callers rejected since creation
    pub rejected: u64,
    /// Permits free
    pub available: usize,
}

/// Drops the queue reservation when the waiter leaves, however it leaves.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bulkhead {
    /// Create new bulkhead.
    ///
    /// # Arguments
    ///
    /// * `name` - Partition name for logging (e.g., "`llm_calls`", "`database_queries`")
    /// * `config` - Bulkhead configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if `max_concurrent` is zero or above the
    /// semaphore's permit limit.
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Result<Self, ResilienceError> {
        validate(&config)?;
        Ok(Self {
            name: name.into(),
            semaphore: Semaphore::new(config.max_concurrent),
            config,
            queued: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
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

    /// Emit bulkhead-rejection events to `events`.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Acquire a permit, queueing if necessary.
    ///
    /// # Errors
    ///
    /// Returns `BulkheadFull` if the queue is full or the wait exceeds
    /// `queue_timeout`, `Cancelled` if `ctx` is cancelled while waiting.
    pub async fn acquire(&self, ctx: &CallContext) -> Result<BulkheadPermit<'_>, ResilienceError> {
        if ctx.is_cancelled() {
            return Err(self.cancelled(ctx));
        }
        if let Ok(permit) = self.semaphore.try_acquire() {
            return Ok(self.admit(permit));
        }

        let reserved = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < self.config.max_queue).then_some(queued + 1)
            })
            .is_ok();
        if !reserved {
            return Err(self.reject(ctx, "queue_full"));
        }
        let _slot = QueueSlot(&self.queued);

        tracing::debug!(partition = %self.name, "Bulkhead full, queueing");
        let waited = tokio::select! {
            biased;
            () = ctx.cancelled() => return Err(self.cancelled(ctx)),
            waited = tokio::time::timeout(self.config.queue_timeout, self.semaphore.acquire()) => waited,
        };

        match waited {
            Ok(Ok(permit)) => Ok(self.admit(permit)),
            Ok(Err(_closed)) => Err(self.reject(ctx, "closed")),
            Err(_elapsed) => Err(self.reject(ctx, "queue_timeout")),
        }
    }

    /// Run `operation` under a permit.
    ///
    /// # Errors
    ///
    /// As [`acquire`](Self::acquire).
    pub async fn execute<F, T>(&self, ctx: &CallContext, operation: F) -> Result<T, ResilienceError>
    where
        F: Future<Output = T>,
    {
        let permit = self.acquire(ctx).await?;
        let result = operation.await;
        drop(permit);
        Ok(result)
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> BulkheadStats {
        BulkheadStats {
            active: self.active(),
            queued: self.queued.load(Ordering::Acquire),
            rejected: self.rejected.load(Ordering::Relaxed),
            available: self.semaphore.available_permits(),
        }
    }

    /// Get number of available permits
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get bulkhead name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    fn active(&self) -> usize {
        self.config
            .max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    fn admit<'a>(&'a self, permit: SemaphorePermit<'a>) -> BulkheadPermit<'a> {
        BulkheadMetrics::record_active(&self.name, self.active());
        tracing::trace!(partition = %self.name, "Acquired bulkhead permit");
        BulkheadPermit {
            bulkhead: self,
            _permit: permit,
        }
    }

    fn reject(&self, ctx: &CallContext, reason: &'static str) -> ResilienceError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        BulkheadMetrics::record_rejection(&self.name, reason);
        tracing::warn!(
            partition = %self.name,
            reason,
            max_concurrent = self.config.max_concurrent,
            max_queue = self.config.max_queue,
            "Bulkhead rejected request"
        );

        self.events.emit(
            ResilienceEvent::new(EventType::BulkheadRejection, &self.name, self.clock.now())
                .with_correlation_id(ctx.correlation_id())
                .with_metadata("reason", reason)
                .with_metadata("max_concurrent", self.config.max_concurrent)
                .with_metadata("max_queue", self.config.max_queue),
        );

        ResilienceError::bulkhead_full(
            &self.name,
            &self.name,
            self.config.max_concurrent,
            self.config.max_queue,
        )
        .with_metadata("reason", reason)
        .with_correlation_id_opt(ctx.correlation_id())
    }

    fn cancelled(&self, ctx: &CallContext) -> ResilienceError {
        ResilienceError::cancelled(&self.name).with_correlation_id_opt(ctx.correlation_id())
    }
}

fn validate(config: &BulkheadConfig) -> Result<(), ResilienceError> {
    config.validate()?;
    if config.max_concurrent > Semaphore::MAX_PERMITS {
        return Err(ResilienceError::invalid_policy(
            "max_concurrent",
            format!("must not exceed {}", Semaphore::MAX_PERMITS),
        ));
    }
    Ok(())
}

/// Bulkheads per partition, created on first use from one shared config.
///
/// # Example
///
/// ```
/// use resilience_core::config::BulkheadConfig;
/// use resilience_runtime::bulkhead::BulkheadRegistry;
///
/// let registry = BulkheadRegistry::new(BulkheadConfig::default()).unwrap();
/// let llm = registry.get_or_create("llm_api");
/// let db = registry.get_or_create("database");
/// assert_eq!(registry.len(), 2);
/// assert_eq!(llm.name(), "llm_api");
/// # drop(db);
/// ```
pub struct BulkheadRegistry {
    config: BulkheadConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    bulkheads: RwLock<HashMap<String, Arc<Bulkhead>>>,
}

impl BulkheadRegistry {
    /// Create an empty registry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if `config` is invalid.
    pub fn new(config: BulkheadConfig) -> Result<Self, ResilienceError> {
        validate(&config)?;
        Ok(Self {
            config,
            clock: Arc::new(SystemClock),
            events: Arc::new(NoopEventSink),
            bulkheads: RwLock::new(HashMap::new()),
        })
    }

    /// Clock handed to every bulkhead created after this call.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Event sink handed to every bulkhead created after this call.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The bulkhead for `partition`, created if absent.
    pub fn get_or_create(&self, partition: &str) -> Arc<Bulkhead> {
        if let Some(bulkhead) = self.bulkheads.read().get(partition) {
            return Arc::clone(bulkhead);
        }

        let mut bulkheads = self.bulkheads.write();
        Arc::clone(bulkheads.entry(partition.to_string()).or_insert_with(|| {
            Arc::new(Bulkhead {
                name: partition.to_string(),
                semaphore: Semaphore::new(self.config.max_concurrent),
                config: self.config.clone(),
                queued: AtomicUsize::new(0),
                rejected: AtomicU64::new(0),
                clock: Arc::clone(&self.clock),
                events: Arc::clone(&self.events),
            })
        }))
    }

    /// Get a bulkhead by name
    #[must_use]
    pub fn get(&self, partition: &str) -> Option<Arc<Bulkhead>> {
        self.bulkheads.read().get(partition).cloned()
    }

    /// Partition names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bulkheads.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get number of registered bulkheads
    #[must_use]
    pub fn len(&self) -> usize {
        self.bulkheads.read().len()
    }

    /// Check if registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bulkheads.read().is_empty()
    }
}
