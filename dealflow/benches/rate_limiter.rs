//! Sliding-window limiter overhead when the budget is not the bottleneck.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dealflow::{RateLimitConfig, RateLimiter, SlidingWindowRateLimiter};
use futures::future::join_all;

fn roomy_limiter() -> SlidingWindowRateLimiter {
    SlidingWindowRateLimiter::new(RateLimitConfig::new(usize::MAX / 2, Duration::from_secs(1)))
}

fn bench_acquire(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
    let limiter = roomy_limiter();

    c.bench_function("acquire_uncontended", |b| {
        b.to_async(&rt).iter(|| limiter.acquire());
    });
    c.bench_function("try_acquire", |b| {
        b.to_async(&rt).iter(|| limiter.try_acquire());
    });
}

fn bench_contended(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
    let mut group = c.benchmark_group("acquire_contended");

    for callers in [4usize, 16, 64] {
        group.throughput(Throughput::Elements(callers as u64));
        group.bench_with_input(BenchmarkId::new("callers", callers), &callers, |b, &callers| {
            let limiter = Arc::new(roomy_limiter());
            b.to_async(&rt).iter(|| {
                let limiter = Arc::clone(&limiter);
                async move {
                    join_all((0..callers).map(|_| {
                        let limiter = Arc::clone(&limiter);
                        tokio::spawn(async move { limiter.acquire().await })
                    }))
                    .await
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_acquire, bench_contended);
criterion_main!(benches);
