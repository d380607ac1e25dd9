//! Benchmarks for update scheduler submit and tick

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use perf_substrate::scheduler::{SchedulerConfig, UpdateKind, UpdateScheduler, WorkItem};
use std::time::Duration;
use tokio::time::Instant;

const TARGETS: [&str; 8] = ["g0", "g1", "g2", "g3", "g4", "g5", "g6", "g7"];

fn bench_submit_coalescing(c: &mut Criterion) {
    let scheduler = UpdateScheduler::new(SchedulerConfig::default());
    let payload = Bytes::from_static(b"{\"value\":42}");

    c.bench_function("scheduler_submit_coalesce", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = i.wrapping_add(1);
            let item = WorkItem::new(UpdateKind::Chart, TARGETS[i % TARGETS.len()], payload.clone());
            black_box(scheduler.submit(item))
        })
    });
}

fn bench_submit_and_tick(c: &mut Criterion) {
    let config = SchedulerConfig {
        frame_cap: false,
        duplicate_suppression: false,
        ..SchedulerConfig::default()
    };
    let scheduler = UpdateScheduler::new(config);
    for target in TARGETS {
        scheduler.register_sink(UpdateKind::Status, target, |item| {
            black_box(item.payload.len());
        });
    }

    let mut group = c.benchmark_group("scheduler_tick");
    group.throughput(Throughput::Elements(TARGETS.len() as u64));
    group.bench_function("submit_8_tick", |b| {
        let t0 = Instant::now();
        let mut round = 0u64;
        b.iter(|| {
            round += 1;
            let at = t0 + Duration::from_millis(round * 200);
            for target in TARGETS {
                scheduler.submit(WorkItem::new(UpdateKind::Status, target, Bytes::from_static(b"ok")).at(at));
            }
            black_box(scheduler.tick_at(at + Duration::from_millis(100)))
        })
    });
    group.finish();
}

criterion_group!(benches, bench_submit_coalescing, bench_submit_and_tick);
criterion_main!(benches);
