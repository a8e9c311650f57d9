use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hawser::deadline::{Clock, DeadlineRegistry};

fn manual_clock() -> (Arc<AtomicU64>, Clock) {
    let millis = Arc::new(AtomicU64::new(0));
    let base = Instant::now();
    let handle = Arc::clone(&millis);
    let clock: Clock = Arc::new(move || base + Duration::from_millis(handle.load(Ordering::Relaxed)));
    (millis, clock)
}

/// The per-connection fast path: register on accept, dispose on a handler
/// that finishes before its deadline.
fn register_dispose(c: &mut Criterion) {
    let registry = DeadlineRegistry::new(Duration::from_secs(45));
    c.bench_function("register_dispose", |b| {
        b.iter(|| {
            let registration = registry.register().unwrap();
            black_box(&registration);
            registration.dispose();
        });
    });
}

/// Sweeping a batch of expired registrations; cost should track the
/// number of expired nodes, nothing else.
fn sweep_expired_batch(c: &mut Criterion) {
    c.bench_function("sweep_expired_1024", |b| {
        b.iter_batched(
            || {
                let (millis, clock) = manual_clock();
                let registry = DeadlineRegistry::with_clock(Duration::from_millis(100), clock);
                let handles: Vec<_> = (0..1024)
                    .map(|_| registry.register().unwrap())
                    .collect();
                millis.store(1_000, Ordering::Relaxed);
                (registry, handles)
            },
            |(registry, handles)| {
                registry.sweep();
                black_box(handles)
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, register_dispose, sweep_expired_batch);
criterion_main!(benches);
