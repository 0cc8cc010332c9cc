//! Admission path benchmarks
//!
//! Every protected call pays for a limiter decision, a breaker admission and
//! a histogram observation before any real work happens. These benchmarks
//! keep an eye on that fixed cost.
//!
//! Run with: `cargo bench`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resilience_core::config::{CircuitBreakerConfig, ResiliencePolicy};
use resilience_runtime::context::CallContext;
use resilience_runtime::histogram::{Histogram, LatencyHistograms};
use resilience_runtime::pipeline::ResiliencePipeline;
use resilience_runtime::rate_limiter::{FixedWindow, RateLimiter, SlidingWindow, TokenBucket};
use resilience_runtime::CircuitBreaker;
use std::time::Duration;

fn benchmark_rate_limiters(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    group.throughput(Throughput::Elements(1));

    let key = "tenant-1".to_string();

    let bucket = TokenBucket::<String>::new("bench", 1_000_000, 1_000_000.0).expect("valid bucket");
    group.bench_function("token_bucket_allow", |b| {
        b.iter(|| black_box(bucket.allow(black_box(&key))));
    });

    let sliding = SlidingWindow::<String>::new("bench", 100, Duration::from_secs(1))
        .expect("valid window");
    group.bench_function("sliding_window_allow", |b| {
        b.iter(|| black_box(sliding.allow(black_box(&key))));
    });

    let fixed =
        FixedWindow::<String>::new("bench", 1_000_000, Duration::from_secs(1)).expect("valid window");
    group.bench_function("fixed_window_allow", |b| {
        b.iter(|| black_box(fixed.allow(black_box(&key))));
    });

    group.finish();
}

fn benchmark_limiter_key_spread(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter_keys");

    for keys in [1usize, 100, 10_000] {
        let bucket =
            TokenBucket::<String>::new("bench", 1_000, 1_000_000.0).expect("valid bucket");
        let names: Vec<String> = (0..keys).map(|i| format!("tenant-{i}")).collect();

        group.throughput(Throughput::Elements(keys as u64));
        group.bench_with_input(BenchmarkId::from_parameter(keys), &names, |b, names| {
            b.iter(|| {
                for name in names {
                    black_box(bucket.allow(name));
                }
            });
        });
    }

    group.finish();
}

fn benchmark_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    group.throughput(Throughput::Elements(1));

    let breaker =
        CircuitBreaker::new("bench", CircuitBreakerConfig::default()).expect("valid breaker");
    group.bench_function("acquire_and_record_success", |b| {
        b.iter(|| {
            let _ = black_box(breaker.try_acquire());
            breaker.record_success();
        });
    });

    group.bench_function("state", |b| {
        b.iter(|| black_box(breaker.state()));
    });

    group.finish();
}

fn benchmark_histograms(c: &mut Criterion) {
    let mut group = c.benchmark_group("histogram");
    group.throughput(Throughput::Elements(1));

    let histogram = Histogram::latency();
    group.bench_function("observe", |b| {
        let mut value = 0.0_f64;
        b.iter(|| {
            value = (value + 0.0137) % 12.0;
            histogram.observe(black_box(value));
        });
    });

    group.bench_function("percentile_p99", |b| {
        b.iter(|| black_box(histogram.percentile(black_box(99.0))));
    });

    let registry = LatencyHistograms::new();
    group.bench_function("registry_observe", |b| {
        b.iter(|| registry.observe(black_box("ledger"), Duration::from_millis(3)));
    });

    group.finish();
}

fn benchmark_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");

    let mut policy = ResiliencePolicy::new("bench");
    policy.circuit_breaker = Some(CircuitBreakerConfig::default());
    let pipeline = ResiliencePipeline::builder(policy)
        .build()
        .expect("valid pipeline");
    let ctx = CallContext::new();

    group.bench_function("execute_ok", |b| {
        b.to_async(&runtime).iter(|| async {
            let value = pipeline
                .execute(&ctx, "tenant-1", "noop", || async {
                    Ok::<_, std::io::Error>(1)
                })
                .await
                .expect("call succeeds");
            black_box(value)
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_rate_limiters,
    benchmark_limiter_key_spread,
    benchmark_circuit_breaker,
    benchmark_histograms,
    benchmark_pipeline
);
criterion_main!(benches);
