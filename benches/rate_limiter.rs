use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use admission_control_service::core::{MemoryCounterStore, RateLimiter, Role};
use admission_control_service::models::RateLimitConfig;

fn rate_limiter_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let limiter = RateLimiter::new(
        Arc::new(MemoryCounterStore::new()),
        RateLimitConfig::default(),
    );
    // Admin tier so the window never fills during the run.
    let policy = limiter.policy_for(Role::Admin, "/api/v1/echo");

    c.bench_function("rate_limiter_check", |b| {
        b.iter(|| rt.block_on(limiter.check_limit(black_box("bench-key"), &policy, 1.0)))
    });
}

criterion_group!(benches, rate_limiter_benchmark);
criterion_main!(benches);
