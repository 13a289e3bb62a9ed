//! Throughput benchmarks for the scheduler's hot path: enqueue, dispatch,
//! and token-bucket acquisition under load.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fleet_scheduler::clock::SystemClock;
use fleet_scheduler::config::SchedulerConfig;
use fleet_scheduler::job::{AgentType, JobId, JobKind, Priority, SpawnJob};
use fleet_scheduler::runner::{Runner, RunnerOutcome};
use fleet_scheduler::scheduler::Scheduler;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

struct ImmediateRunner {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Runner for ImmediateRunner {
    async fn execute(&self, _job: &SpawnJob, _cancel: &CancellationToken) -> RunnerOutcome {
        self.calls.fetch_add(1, Ordering::Relaxed);
        RunnerOutcome::Ok
    }
}

fn job(id: u64) -> SpawnJob {
    SpawnJob::new(
        JobId::from_string(format!("bench-{id}")),
        JobKind::StartAgent,
        AgentType::new("cc"),
        "bench-session",
        Priority::Normal,
        serde_json::Value::Null,
        0,
    )
}

fn bench_enqueue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");
    for size in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let calls = Arc::new(AtomicU32::new(0));
                    let config = SchedulerConfig {
                        queue_capacity: size + 1,
                        ..Default::default()
                    };
                    Scheduler::new(
                        config,
                        Arc::new(SystemClock::new()),
                        Arc::new(ImmediateRunner { calls }),
                    )
                    .unwrap()
                },
                |scheduler| {
                    for i in 0..size {
                        black_box(scheduler.enqueue(job(i as u64)).unwrap());
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_dispatch_drain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch_drain");
    group.bench_function("drain_1000_jobs", |b| {
        b.to_async(&rt).iter(|| async {
            let calls = Arc::new(AtomicU32::new(0));
            let config = SchedulerConfig {
                workers: 8,
                queue_capacity: 2_000,
                global_rate: 1_000.0,
                global_capacity: 1_000.0,
                ..Default::default()
            };
            let scheduler = Scheduler::new(
                config,
                Arc::new(SystemClock::new()),
                Arc::new(ImmediateRunner { calls: calls.clone() }),
            )
            .unwrap();
            for i in 0..1_000 {
                scheduler.enqueue(job(i)).unwrap();
            }
            let handle = scheduler.start();
            while calls.load(Ordering::Relaxed) < 1_000 {
                tokio::task::yield_now().await;
            }
            handle.stop(std::time::Duration::from_secs(5)).await.unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_enqueue_throughput, bench_dispatch_drain);
criterion_main!(benches);
