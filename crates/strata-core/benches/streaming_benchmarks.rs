//! Streaming Benchmarks
//!
//! Throughput of the priority worker pool and memory counters

use std::hint::black_box;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use strata_core::memory::MemoryStats;
use strata_core::streaming::{LoadPriority, StreamingBudget, StreamingManager};

fn bench_submit_and_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("streaming_submit_drain");

    for count in [10u32, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let manager = StreamingManager::new("bench", 4, StreamingBudget::default()).unwrap();
            let counter = Arc::new(AtomicU32::new(0));

            b.iter(|| {
                counter.store(0, Ordering::Relaxed);
                for i in 0..count {
                    let c = counter.clone();
                    manager.submit_work(
                        move || {
                            c.fetch_add(1, Ordering::Relaxed);
                        },
                        LoadPriority::new((i % 17) as f32, u64::from(i)),
                    );
                }
                manager.wait_idle();
                black_box(counter.load(Ordering::Relaxed))
            });
        });
    }

    group.finish();
}

fn bench_priority_ordering(c: &mut Criterion) {
    c.bench_function("streaming_paused_fill_1000", |b| {
        let manager = StreamingManager::new("bench", 1, StreamingBudget::default()).unwrap();

        b.iter(|| {
            manager.pause();
            for i in 0..1000u32 {
                manager.submit_work(|| {}, LoadPriority::new((1000 - i) as f32, 0));
            }
            manager.resume();
            manager.wait_idle();
        });
    });
}

fn bench_memory_stats(c: &mut Criterion) {
    c.bench_function("memory_stats_alloc_dealloc", |b| {
        let stats = MemoryStats::new();
        b.iter(|| {
            stats.record_alloc(black_box(4096));
            stats.record_dealloc(black_box(4096));
        });
    });
}

criterion_group!(
    benches,
    bench_submit_and_drain,
    bench_priority_ordering,
    bench_memory_stats
);
criterion_main!(benches);
