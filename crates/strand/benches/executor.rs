//! Throughput benchmarks for the task executor and the pool.
//!
//! Run with: cargo bench -p strand

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strand::{Executor, PoolExecution, TaskExecutor};

/// Push a batch under one locker, then drain it with a single update.
fn push_and_drain(c: &mut Criterion) {
    let executor = TaskExecutor::new();
    let counter = Arc::new(AtomicU64::new(0));

    c.bench_function("push_100_tasks_and_update", |b| {
        b.iter(|| {
            {
                let mut locker = executor.task_locker();
                for _ in 0..100 {
                    let counter = Arc::clone(&counter);
                    locker.push_task(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            }
            Executor::update(&executor);
            black_box(counter.load(Ordering::Relaxed));
        });
    });
}

/// Latency of one task pushed from the bench thread and executed by a pool
/// worker.
fn pool_round_trip(c: &mut Criterion) {
    let pool = PoolExecution::new();
    pool.launch_threads(2, Some("bench"));

    let executor = Arc::new(TaskExecutor::new());
    pool.add_executor(executor.clone());

    c.bench_function("pool_task_round_trip", |b| {
        b.iter(|| {
            let done = Arc::new(AtomicU64::new(0));
            let task_done = Arc::clone(&done);
            executor.push_task(move || {
                task_done.store(1, Ordering::Release);
            });
            while done.load(Ordering::Acquire) == 0 {
                std::thread::yield_now();
            }
        });
    });

    pool.stop_and_join_threads();
}

criterion_group!(benches, push_and_drain, pool_round_trip);
criterion_main!(benches);
