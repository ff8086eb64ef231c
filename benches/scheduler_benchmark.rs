use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use kestrel_tick_timer::{RepeatPolicy, Scheduler};
use std::hint::black_box;

/// 基准测试：单个定时器添加
fn bench_add_single(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_add_single");

    for ticks in [10u64, 1_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(ticks), &ticks, |b, &ticks| {
            let mut scheduler: Scheduler = Scheduler::with_defaults();
            b.iter(|| {
                let id = scheduler
                    .add_ticks(black_box(ticks), RepeatPolicy::Once, |_ctx, _| {}, ())
                    .unwrap();
                // 删除后实体归还对象池，保持调度器规模稳定
                scheduler.remove(id).unwrap();
            });
        });
    }

    group.finish();
}

/// 基准测试：批量添加
fn bench_add_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_add_batch");

    for size in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                Scheduler::<()>::with_defaults,
                |mut scheduler| {
                    for i in 0..size {
                        scheduler
                            .add_ticks(1 + i as u64, RepeatPolicy::Once, |_ctx, _| {}, ())
                            .unwrap();
                    }
                    black_box(scheduler)
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// 基准测试：推进并执行到期定时器（含第 1 层展开）
fn bench_advance(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_advance");

    for size in [100usize, 1000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let mut scheduler: Scheduler = Scheduler::with_defaults();
                    for i in 0..size {
                        scheduler
                            .add_ticks(1 + (i % 512) as u64, RepeatPolicy::Once, |_ctx, _| {}, ())
                            .unwrap();
                    }
                    scheduler
                },
                |mut scheduler| black_box(scheduler.advance_ticks(512).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// 基准测试：大量删除（触发槽位压缩）
fn bench_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_remove");

    for size in [100usize, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let mut scheduler: Scheduler = Scheduler::with_defaults();
                    let ids: Vec<_> = (0..size)
                        .map(|_| {
                            scheduler
                                .add_ticks(5_000, RepeatPolicy::Once, |_ctx, _| {}, ())
                                .unwrap()
                        })
                        .collect();
                    (scheduler, ids)
                },
                |(mut scheduler, ids)| {
                    for id in ids {
                        scheduler.remove(id).unwrap();
                    }
                    black_box(scheduler)
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// 基准测试：周期定时器稳态执行
fn bench_periodic(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_periodic");

    group.bench_function("1000_timers_per_tick", |b| {
        let mut scheduler: Scheduler<u64> = Scheduler::with_defaults();
        for _ in 0..1000 {
            scheduler
                .add_ticks(1, RepeatPolicy::Infinite, |_ctx, hits| *hits += 1, 0)
                .unwrap();
        }
        b.iter(|| black_box(scheduler.advance_ticks(1).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_add_single,
    bench_add_batch,
    bench_advance,
    bench_remove,
    bench_periodic,
);

criterion_main!(benches);
