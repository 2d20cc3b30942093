use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use pacer::{Mailbox, ManualTimer, RateLimiter, RateLimiterConfig, RateLimiterSet, ThreadExecutor};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    timers: Arc<ManualTimer>,
    limiter: RateLimiter<u64>,
    worker: Mailbox<u64>,
}

// Limiters live until shut down, so every rig shuts its limiter down on drop
impl Drop for Rig {
    fn drop(&mut self) {
        self.limiter.shutdown();
    }
}

fn rig(per_tick: u32) -> Rig {
    let timers = Arc::new(ManualTimer::new());
    let executor = Arc::new(ThreadExecutor::<u64>::new());
    let owner = executor.register();
    let worker = executor.register();
    let config = RateLimiterConfig::new(Duration::from_millis(1), per_tick).with_name("bench");
    let limiter = RateLimiter::with_config(timers.clone(), executor, owner.id(), config).unwrap();
    Rig {
        timers,
        limiter,
        worker,
    }
}

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");

    for &batch in &[1u64, 100, 10_000] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter_batched(
                || rig(1),
                |rig| {
                    for n in 0..batch {
                        black_box(rig.limiter.enqueue(rig.worker.id(), n).unwrap());
                    }
                    rig
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.bench_function("lifo", |b| {
        let rig = rig(1);
        rig.limiter.set_lifo_mode(true).unwrap();
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            black_box(rig.limiter.enqueue(rig.worker.id(), n).unwrap());
        });
    });

    group.finish();
}

fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");

    for &per_tick in &[1u32, 16, 256] {
        group.throughput(Throughput::Elements(u64::from(per_tick)));
        group.bench_with_input(BenchmarkId::new("per_tick", per_tick), &per_tick, |b, &per_tick| {
            b.iter_batched(
                || {
                    let rig = rig(per_tick);
                    for n in 0..u64::from(per_tick) * 2 {
                        rig.limiter.enqueue(rig.worker.id(), n).unwrap();
                    }
                    rig
                },
                |rig| {
                    black_box(rig.timers.fire(rig.limiter.timer()));
                    black_box(rig.worker.drain().len());
                    rig
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_cancel(c: &mut Criterion) {
    let mut group = c.benchmark_group("cancel");

    group.bench_function("queued", |b| {
        b.iter_batched(
            || {
                let rig = rig(1);
                let tickets: Vec<_> = (0..1_000)
                    .map(|n| rig.limiter.enqueue(rig.worker.id(), n).unwrap())
                    .collect();
                (rig, tickets)
            },
            |(rig, tickets)| {
                for ticket in &tickets {
                    black_box(rig.limiter.cancel(ticket).ok());
                }
                rig
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("already_released", |b| {
        let rig = rig(1);
        let ticket = rig.limiter.enqueue(rig.worker.id(), 0).unwrap();
        rig.timers.fire(rig.limiter.timer());
        b.iter(|| black_box(rig.limiter.cancel(&ticket).is_err()));
    });

    group.finish();
}

fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter_set");
    let timers = Arc::new(ManualTimer::new());
    let executor = Arc::new(ThreadExecutor::<u64>::new());
    let owner = executor.register();
    let worker = executor.register();
    let template = RateLimiterConfig::new(Duration::from_millis(1), 4).with_name("peer");

    group.bench_function("get_existing", |b| {
        let set: RateLimiterSet<u32, u64> =
            RateLimiterSet::new(timers.clone(), executor.clone(), owner.id(), template.clone())
                .unwrap();
        set.get_or_create(7).unwrap();
        b.iter(|| black_box(set.get_or_create(black_box(7)).unwrap()));
        set.shutdown_all();
    });

    for &keys in &[10u32, 1_000] {
        group.throughput(Throughput::Elements(u64::from(keys)));
        group.bench_with_input(BenchmarkId::new("enqueue_keys", keys), &keys, |b, &keys| {
            let set: RateLimiterSet<u32, u64> = RateLimiterSet::new(
                timers.clone(),
                executor.clone(),
                owner.id(),
                template.clone(),
            )
            .unwrap();
            b.iter(|| {
                for key in 0..keys {
                    black_box(set.enqueue(key, worker.id(), u64::from(key)).unwrap());
                }
            });
            set.shutdown_all();
        });
    }

    group.finish();
}

fn bench_metrics(c: &mut Criterion) {
    let rig = rig(8);
    for n in 0..500 {
        rig.limiter.enqueue(rig.worker.id(), n).unwrap();
    }

    c.bench_function("metrics_snapshot", |b| {
        b.iter(|| black_box(rig.limiter.metrics().health_status()));
    });
}

criterion_group!(benches, bench_enqueue, bench_tick, bench_cancel, bench_set, bench_metrics);
criterion_main!(benches);
