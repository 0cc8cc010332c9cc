//! Fixed-bucket cumulative latency histograms.
//!
//! Each bucket counts every observation less than or equal to its upper bound,
//! so bucket counts are cumulative and the implicit `+Inf` bucket equals the
//! total count. Percentiles resolve to the upper bound of the first bucket
//! whose cumulative fraction reaches the requested percentile, which biases
//! estimates upward. That is the right direction for alert thresholds.
//!
//! ```text
//! bounds:   0.1   0.5   1.0   5.0   10.0   +Inf
//! counts:    10    20    30    40     50     60
//!                         ^ p50 = 1.0 (30/60 >= 0.50)
//! ```
//!
//! Updates use atomics only. Readers get an eventually consistent snapshot and
//! never block writers.

use parking_lot::RwLock;
use resilience_core::event::MetricsSink;
use resilience_core::ResilienceError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default latency bucket bounds in seconds (1ms to 10s).
pub const DEFAULT_LATENCY_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// One cumulative bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramBucket {
    /// Inclusive upper bound
    pub upper_bound: f64,
    /// Observations less than or equal to `upper_bound`
    pub count: u64,
}

/// Point-in-time view of a histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramData {
    /// Finite buckets in ascending order
    pub buckets: Vec<HistogramBucket>,
    /// Total observations (the `+Inf` bucket)
    pub count: u64,
    /// Sum of all observed values
    pub sum: f64,
}

/// Cumulative histogram over fixed bucket bounds.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    counts: Vec<AtomicU64>,
    count: AtomicU64,
    sum_bits: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given upper bounds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if `bounds` is empty, contains a non-finite
    /// value, or is not strictly ascending.
    pub fn new(bounds: &[f64]) -> Result<Self, ResilienceError> {
        if bounds.is_empty() {
            return Err(ResilienceError::invalid_policy("buckets", "must not be empty"));
        }
        if bounds.iter().any(|b| !b.is_finite()) {
            return Err(ResilienceError::invalid_policy("buckets", "bounds must be finite"));
        }
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ResilienceError::invalid_policy(
                "buckets",
                "bounds must be strictly ascending",
            ));
        }

        Ok(Self::with_bounds(bounds.to_vec()))
    }

    /// Histogram over [`DEFAULT_LATENCY_BUCKETS`].
    #[must_use]
    pub fn latency() -> Self {
        Self::with_bounds(DEFAULT_LATENCY_BUCKETS.to_vec())
    }

    fn with_bounds(bounds: Vec<f64>) -> Self {
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            count: AtomicU64::new(0),
            sum_bits: AtomicU64::new(0.0_f64.to_bits()),
        }
    }

    /// Record one value. NaN is ignored.
    pub fn observe(&self, value: f64) {
        if value.is_nan() {
            return;
        }

        let first = self.bounds.partition_point(|bound| *bound < value);
        for bucket in &self.counts[first..] {
            bucket.fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut current = self.sum_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self.sum_bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Record a duration in seconds.
    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    /// Conservative percentile estimate for `p` in `[0, 100]`.
    ///
    /// Returns `0.0` when empty and `f64::INFINITY` when the percentile lands
    /// in the `+Inf` bucket.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percentile(&self, p: f64) -> f64 {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }

        let target = p.clamp(0.0, 100.0) / 100.0 * total as f64;
        self.bounds
            .iter()
            .zip(&self.counts)
            .find(|(_, count)| count.load(Ordering::Relaxed) as f64 >= target)
            .map_or(f64::INFINITY, |(bound, _)| *bound)
    }

    /// Total observations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of observed values.
    #[must_use]
    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    /// Mean of observed values, `0.0` when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum() / n as f64,
        }
    }

    /// Bucket upper bounds.
    #[must_use]
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Snapshot of buckets, count and sum.
    #[must_use]
    pub fn data(&self) -> HistogramData {
        HistogramData {
            buckets: self
                .bounds
                .iter()
                .zip(&self.counts)
                .map(|(bound, count)| HistogramBucket {
                    upper_bound: *bound,
                    count: count.load(Ordering::Relaxed),
                })
                .collect(),
            count: self.count(),
            sum: self.sum(),
        }
    }
}

/// Named latency histograms, created on first observation.
///
/// Implements [`MetricsSink`], so it can be injected wherever a component
/// reports per-operation latency.
#[derive(Debug)]
pub struct LatencyHistograms {
    bounds: Vec<f64>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
}

impl Default for LatencyHistograms {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistograms {
    /// Registry using [`DEFAULT_LATENCY_BUCKETS`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            bounds: DEFAULT_LATENCY_BUCKETS.to_vec(),
            histograms: RwLock::new(HashMap::new()),
        }
    }

    /// Registry using custom bucket bounds (seconds).
    ///
    /// # Errors
    ///
    /// Returns `InvalidPolicy` if the bounds are rejected by [`Histogram::new`].
    pub fn with_buckets(bounds: &[f64]) -> Result<Self, ResilienceError> {
        Histogram::new(bounds)?;
        Ok(Self {
            bounds: bounds.to_vec(),
            histograms: RwLock::new(HashMap::new()),
        })
    }

    /// Record a latency for `name`.
    pub fn observe(&self, name: &str, elapsed: Duration) {
        self.histogram(name).observe_duration(elapsed);
    }

    /// Histogram for `name`, if anything was observed under it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Histogram>> {
        self.histograms.read().get(name).cloned()
    }

    /// `(p50, p95, p99)` for `name`; zeros when unknown.
    #[must_use]
    pub fn percentiles(&self, name: &str) -> (f64, f64, f64) {
        self.get(name).map_or((0.0, 0.0, 0.0), |h| {
            (h.percentile(50.0), h.percentile(95.0), h.percentile(99.0))
        })
    }

    /// Names with at least one observation, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.histograms.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn histogram(&self, name: &str) -> Arc<Histogram> {
        if let Some(existing) = self.histograms.read().get(name) {
            return Arc::clone(existing);
        }

        let mut histograms = self.histograms.write();
        Arc::clone(
            histograms
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Histogram::with_bounds(self.bounds.clone()))),
        )
    }
}

impl MetricsSink for LatencyHistograms {
    fn observe_latency(&self, name: &str, elapsed: Duration) {
        self.observe(name, elapsed);
    }
}
