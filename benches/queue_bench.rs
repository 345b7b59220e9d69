//! Benchmarks for the work dispatcher.
//!
//! Benchmarks cover:
//! - Queue operations (enqueue/dequeue, save/restore)
//! - End-to-end dispatch of a parallel suite
//! - Isolated fixtures nested under a serial root

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use prometheus_work_dispatch::config::DispatcherConfig;
use prometheus_work_dispatch::core::{
    ParallelDispatcher, ParallelScope, RunOutcome, WorkItem, WorkItemDispatcher, WorkItemQueue,
};

// ============================================================================
// Helper Functions
// ============================================================================

fn noop_leaf(i: usize) -> Arc<WorkItem> {
    WorkItem::leaf(format!("case-{i}"), |_ctx| Ok(())).build()
}

fn bench_config(workers: usize) -> DispatcherConfig {
    DispatcherConfig::new()
        .with_parallel_workers(workers)
        .with_thread_name_prefix("bench")
        .with_thread_stack_size(512 * 1024)
}

fn run_to_completion(dispatcher: &ParallelDispatcher, root: Arc<WorkItem>) {
    dispatcher.start(root).expect("run starts");
    let outcome = dispatcher
        .wait_for_completion(Duration::from_secs(60))
        .expect("run completes");
    assert_eq!(outcome, RunOutcome::Completed);
}

// ============================================================================
// Queue Benchmarks
// ============================================================================

fn bench_queue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_throughput");

    for size in [100usize, 1_000, 10_000] {
        let items: Vec<_> = (0..size).map(noop_leaf).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("enqueue_dequeue", size), &items, |b, items| {
            b.iter(|| {
                let queue = WorkItemQueue::new("bench");
                queue.start();
                for item in items {
                    queue.enqueue(Arc::clone(item)).expect("queue accepts items");
                }
                while let Some(item) = queue.dequeue() {
                    black_box(&item);
                    queue.release();
                    if queue.is_empty() {
                        break;
                    }
                }
            });
        });
    }

    group.finish();
}

fn bench_queue_save_restore(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_save_restore");
    let items: Vec<_> = (0..256).map(noop_leaf).collect();

    for depth in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("nested_levels", depth), &depth, |b, &depth| {
            b.iter(|| {
                let queue = WorkItemQueue::new("bench");
                for item in &items {
                    queue.enqueue(Arc::clone(item)).expect("queue accepts items");
                }
                for _ in 0..depth {
                    queue.save();
                }
                for _ in 0..depth {
                    queue.restore();
                }
                black_box(queue.len())
            });
        });
    }

    group.finish();
}

// ============================================================================
// End-to-End Benchmarks
// ============================================================================

fn bench_parallel_suite(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_suite");
    group.sample_size(20);

    for cases in [64usize, 512] {
        group.throughput(Throughput::Elements(cases as u64));
        group.bench_with_input(BenchmarkId::new("cases", cases), &cases, |b, &cases| {
            b.iter(|| {
                let dispatcher = ParallelDispatcher::new(bench_config(4)).expect("valid config");
                let suite = WorkItem::composite("suite")
                    .parallel_scope(ParallelScope::Children)
                    .children((0..cases).map(noop_leaf))
                    .build();
                run_to_completion(&dispatcher, suite);
            });
        });
    }

    group.finish();
}

fn bench_isolated_fixtures(c: &mut Criterion) {
    let mut group = c.benchmark_group("isolated_fixtures");
    group.sample_size(20);

    for fixtures in [4usize, 16] {
        group.bench_with_input(
            BenchmarkId::new("fixtures", fixtures),
            &fixtures,
            |b, &fixtures| {
                b.iter(|| {
                    let dispatcher =
                        ParallelDispatcher::new(bench_config(2)).expect("valid config");
                    let root = WorkItem::composite("root")
                        .children((0..fixtures).map(|f| {
                            WorkItem::composite(format!("fixture-{f}"))
                                .setup(|_ctx| Ok(()))
                                .teardown(|_ctx| Ok(()))
                                .children((0..8).map(noop_leaf))
                                .build()
                        }))
                        .build();
                    run_to_completion(&dispatcher, root);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_queue_throughput,
    bench_queue_save_restore,
    bench_parallel_suite,
    bench_isolated_fixtures
);
criterion_main!(benches);
