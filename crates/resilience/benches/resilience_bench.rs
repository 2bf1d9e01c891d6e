//! Resilience policy benchmarks
//!
//! Covers the hot paths of each policy: breaker admission, short-circuiting
//! and state transitions, retry outcomes and backoff arithmetic, bulkhead
//! fast-path admission, and the composed pipeline.
//!
//! Run with: `cargo bench --bench resilience_bench -p marketplace-resilience`

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use marketplace_resilience::{
    BackoffStrategy, BulkheadOptions, BulkheadPolicy, CircuitBreaker, CircuitBreakerOptions,
    MockClock, PolicyRegistry, ResilienceConfig, ResilienceResult, RetryOptions, RetryPolicy,
};
use tokio::runtime::Builder as RuntimeBuilder;

fn build_runtime() -> tokio::runtime::Runtime {
    RuntimeBuilder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime should build for benchmarks")
}

// ============================================================================
// Circuit Breaker Benchmarks
// ============================================================================

fn bench_circuit_breaker_paths(c: &mut Criterion) {
    let runtime = build_runtime();
    let mut group = c.benchmark_group("circuit_breaker_paths");

    group.bench_function("closed_success", |b| {
        let breaker = CircuitBreaker::new("bench", CircuitBreakerOptions::default());
        b.to_async(&runtime).iter(|| async {
            let result = breaker.execute(|| async { Ok::<_, std::io::Error>(()) }).await;
            black_box(result).expect("closed breaker should admit the call");
        });
    });

    group.bench_function("open_short_circuit", |b| {
        let options = CircuitBreakerOptions::builder()
            .consecutive_failure_limit(1)
            .break_duration(Duration::from_secs(3600))
            .build()
            .expect("valid circuit breaker options for benchmarks");
        let breaker = CircuitBreaker::new("bench", options);
        breaker.force_open();

        b.to_async(&runtime).iter(|| async {
            let result = breaker.execute(|| async { Ok::<_, std::io::Error>(()) }).await;
            let _result = black_box(result);
        });
    });

    group.bench_function("open_half_open_recover", |b| {
        let options = CircuitBreakerOptions::builder()
            .consecutive_failure_limit(3)
            .break_duration(Duration::from_millis(10))
            .build()
            .expect("valid circuit breaker options for benchmarks");

        b.to_async(&runtime).iter(|| async {
            let clock = MockClock::new();
            let breaker =
                CircuitBreaker::with_clock("bench", options.clone(), Arc::new(clock.clone()));
            for _ in 0..3 {
                let _ = breaker
                    .execute(|| async { Err::<(), _>(std::io::Error::other("state transition")) })
                    .await;
            }
            clock.advance(Duration::from_millis(10));
            let _ = breaker.execute(|| async { Ok::<_, std::io::Error>(()) }).await;
            black_box(breaker.state());
        });
    });

    group.bench_function("statistics_snapshot", |b| {
        let breaker = CircuitBreaker::new("bench", CircuitBreakerOptions::default());
        b.iter(|| black_box(breaker.statistics()));
    });

    group.finish();
}

// ============================================================================
// Retry Benchmarks
// ============================================================================

fn bench_retry_outcomes(c: &mut Criterion) {
    let runtime = build_runtime();
    let mut group = c.benchmark_group("retry_outcomes");

    group.bench_function("first_attempt_success", |b| {
        let policy = RetryPolicy::new("bench", RetryOptions::default());
        b.to_async(&runtime).iter(|| async {
            let result = policy.execute(|| async { Ok::<_, std::io::Error>(7_u32) }).await;
            black_box(result).expect("retry should succeed on first attempt");
        });
    });

    group.bench_function("non_retryable_failure", |b| {
        let policy = RetryPolicy::new("bench", RetryOptions::default());
        b.to_async(&runtime).iter(|| async {
            let result: ResilienceResult<(), std::io::Error> = policy
                .execute(|| async {
                    Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad request"))
                })
                .await;
            let _result = black_box(result);
        });
    });

    group.finish();
}

fn bench_backoff_calculations(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_backoff");
    let base = Duration::from_millis(100);
    let max = Duration::from_secs(10);

    for strategy in [
        BackoffStrategy::Fixed,
        BackoffStrategy::Linear,
        BackoffStrategy::Exponential,
        BackoffStrategy::ExponentialWithJitter,
    ] {
        group.bench_with_input(
            BenchmarkId::new("delay", format!("{strategy:?}")),
            &strategy,
            |b, strategy| {
                b.iter(|| {
                    for attempt in 0..16 {
                        black_box(strategy.delay(black_box(attempt), base, max));
                    }
                });
            },
        );
    }

    group.finish();
}

// ============================================================================
// Bulkhead and Composition Benchmarks
// ============================================================================

fn bench_bulkhead_fast_path(c: &mut Criterion) {
    let runtime = build_runtime();
    let mut group = c.benchmark_group("bulkhead");

    group.bench_function("fast_path_admission", |b| {
        let bulkhead = runtime.block_on(async {
            BulkheadPolicy::new(
                "bench",
                BulkheadOptions::builder()
                    .max_parallelism(8)
                    .build()
                    .expect("valid bulkhead options for benchmarks"),
            )
        });
        b.to_async(&runtime).iter(|| async {
            let result = bulkhead.execute(|| async { Ok::<_, std::io::Error>(()) }).await;
            black_box(result).expect("idle bulkhead should admit the call");
        });
    });

    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let runtime = build_runtime();
    let mut group = c.benchmark_group("pipeline");

    let registry = PolicyRegistry::new(ResilienceConfig::default())
        .expect("default configuration should be valid");
    let pipeline = registry.pipeline("bench");

    group.bench_function("breaker_retry_success", |b| {
        b.to_async(&runtime).iter(|| async {
            let result = pipeline.execute(|| async { Ok::<_, std::io::Error>(()) }).await;
            black_box(result).expect("pipeline should succeed");
        });
    });

    group.bench_function("registry_lookup", |b| {
        b.iter(|| black_box(registry.circuit_breaker(black_box("bench"))));
    });

    group.finish();
}

criterion_group!(
    resilience,
    bench_circuit_breaker_paths,
    bench_retry_outcomes,
    bench_backoff_calculations,
    bench_bulkhead_fast_path,
    bench_pipeline
);
criterion_main!(resilience);
