//! Benchmarks for the tick-loop hot paths
//!
//! Chunk batch selection dominates per-connection tick cost at large view
//! distances, and the deferred task queue sits on every tick boundary.
//!
//! Run with: cargo bench --bench tickcore

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use tickhost::net::chunk_stream::ChunkStreamController;
use tickhost::net::protocol::ChunkPos;
use tickhost::tick::task_queue::TaskQueue;
use tickhost::util::rolling::RollingAverage;

/// Controller with `count` pending chunks scattered around the origin and
/// one acknowledged batch so the quota is primed.
fn primed_controller(count: usize, rate: f32) -> ChunkStreamController {
    let mut rng = rand::thread_rng();
    let mut controller = ChunkStreamController::new();
    controller.set_center(ChunkPos { x: 0, z: 0 });
    while controller.pending_len() < count {
        controller.mark_pending(ChunkPos {
            x: rng.gen_range(-500..500),
            z: rng.gen_range(-500..500),
        });
    }
    // One send/ack cycle unlocks pipelining and sets the desired rate.
    let warmup = controller.try_send();
    assert!(!warmup.is_empty());
    controller.on_batch_acknowledged(rate).unwrap();
    controller
}

/// Benchmark nearest-first batch selection at various backlog sizes
fn bench_batch_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_selection");
    group.sample_size(50);

    for count in [1_000, 10_000, 50_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::new("nearest_first", count),
            &count,
            |b, &count| {
                b.iter_batched(
                    || primed_controller(count, 64.0),
                    |mut controller| black_box(controller.try_send()),
                    BatchSize::LargeInput,
                )
            },
        );
    }
    group.finish();
}

/// Benchmark submit-then-drain through the deferred task queue
fn bench_task_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_queue");
    group.sample_size(50);

    for count in [100, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::new("submit_drain", count),
            &count,
            |b, &count| {
                b.iter(|| {
                    let mut queue = TaskQueue::new();
                    let handle = queue.handle();
                    for _ in 0..count {
                        handle.submit(|| {}).unwrap();
                    }
                    black_box(queue.drain_all())
                })
            },
        );
    }
    group.finish();
}

/// Benchmark the rolling tick-time window on the per-tick insert path
fn bench_rolling_average(c: &mut Criterion) {
    c.bench_function("rolling_average_insert", |b| {
        let mut window = RollingAverage::new(1200);
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            window.insert((i % 100) as f64, 1.0);
            black_box(window.average())
        })
    });
}

criterion_group!(
    benches,
    bench_batch_selection,
    bench_task_queue,
    bench_rolling_average
);
criterion_main!(benches);
