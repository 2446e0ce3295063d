use std::sync::Arc;

use ariesdb::collab::testing::ThreadParkContext;
use ariesdb::{LockManager, LockMode, ResourceName, TransactionContext};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_uncontended_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_manager_uncontended");
    for depth in [1usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let manager = LockManager::new();
            let ctx: Arc<dyn TransactionContext> = ThreadParkContext::new(1);
            let segments: Vec<String> = (0..depth).map(|i| format!("seg{i}")).collect();
            let resource = ResourceName::from_segments(segments);
            b.iter(|| {
                manager.acquire(ctx.clone(), &resource, LockMode::S).unwrap();
                manager.release(&ctx, &resource).unwrap();
                black_box(&manager);
            });
        });
    }
    group.finish();
}

fn bench_queue_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_manager_queue_drain");
    for waiters in [2usize, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(waiters), &waiters, |b, &waiters| {
            b.iter_batched(
                || {
                    let manager = Arc::new(LockManager::new());
                    let resource = ResourceName::root("table");
                    let holder: Arc<dyn TransactionContext> = ThreadParkContext::new(0);
                    manager.acquire(holder.clone(), &resource, LockMode::X).unwrap();
                    (manager, resource, holder)
                },
                |(manager, resource, holder)| {
                    let mut handles = Vec::new();
                    for txn in 1..=waiters as u64 {
                        let manager = manager.clone();
                        let resource = resource.clone();
                        handles.push(std::thread::spawn(move || {
                            let ctx: Arc<dyn TransactionContext> = ThreadParkContext::new(txn);
                            manager.acquire(ctx, &resource, LockMode::S).unwrap();
                        }));
                    }
                    std::thread::sleep(std::time::Duration::from_micros(50));
                    manager.release(&holder, &resource).unwrap();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_uncontended_acquire_release, bench_queue_drain);
criterion_main!(benches);
