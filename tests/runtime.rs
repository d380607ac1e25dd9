//! End-to-end wiring tests against a fake system probe

use bytes::Bytes;
use parking_lot::Mutex;
use perf_substrate::allocator::DEFAULT_ALIGN;
use perf_substrate::fault::FaultEvent;
use perf_substrate::metrics::FakeProbe;
use perf_substrate::scheduler::{UpdateKind, WorkItem};
use perf_substrate::{Config, Severity, Substrate};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const GIB: u64 = 1024 * 1024 * 1024;

fn substrate_with_probe() -> (Substrate, Arc<FakeProbe>) {
    let probe = Arc::new(FakeProbe::new());
    probe.set_cpu(10.0);
    probe.set_memory(4 * GIB, 16 * GIB);
    probe.set_process(GIB, 2.0, 4);
    (Substrate::new(Config::default(), probe.clone()), probe)
}

#[test]
fn test_memory_pressure_runs_allocator_cleanup() {
    let (s, probe) = substrate_with_probe();
    let allocator = s.allocator();

    let blocks: Vec<_> = (0..8)
        .filter_map(|_| allocator.allocate(4096, DEFAULT_ALIGN))
        .collect();
    assert_eq!(blocks.len(), 8);
    for ptr in blocks {
        assert!(allocator.deallocate(ptr));
    }
    assert!(allocator.stats().free_bytes > 0);

    // Below the threshold nothing is released
    s.metrics().sample_now();
    assert!(allocator.stats().free_bytes > 0);

    // 14 of 16 GiB resident is above the default 80 percent
    probe.set_process(14 * GIB, 2.0, 4);
    s.metrics().sample_now();

    let stats = allocator.stats();
    assert_eq!(stats.free_bytes, 0);
    assert_eq!(stats.current_allocations, 0);
}

#[test]
fn test_cpu_samples_slow_scheduler_tick() {
    let (s, probe) = substrate_with_probe();
    let base = s.scheduler().tick_interval();

    s.metrics().sample_now();
    s.scheduler().tune();
    assert_eq!(s.scheduler().tick_interval(), base);

    probe.set_cpu(97.0);
    s.metrics().sample_now();
    s.scheduler().tune();
    assert!(s.scheduler().tick_interval() > base);
    assert!(s.scheduler().tick_interval() <= Duration::from_millis(100));
}

#[test]
fn test_recovery_runs_cleanup_actions() {
    let (s, _probe) = substrate_with_probe();
    let events = s.faults().subscribe();

    if let Some(ptr) = s.allocator().allocate(1024, DEFAULT_ALIGN) {
        s.allocator().deallocate(ptr);
    }
    assert!(s.allocator().stats().free_bytes > 0);

    s.faults().report_critical("storage", "disk write failed");
    s.faults().process_queue();
    assert_eq!(s.faults().count(Severity::Critical), 1);

    let t0 = Instant::now();
    assert!(s.faults().trigger_recovery_at("manual", t0));
    assert!(!s.faults().trigger_recovery_at("again", t0));
    assert!(s.faults().is_recovery_in_progress());

    // Not due before the recovery delay
    assert_eq!(s.faults().poll_recovery_at(t0 + Duration::from_millis(10)), None);
    assert_eq!(s.faults().poll_recovery_at(t0 + Duration::from_secs(2)), Some(true));

    assert!(!s.faults().is_recovery_in_progress());
    assert_eq!(s.faults().total_count(), 0);
    assert_eq!(s.allocator().stats().free_bytes, 0);

    let names: Vec<_> = events
        .drain()
        .into_iter()
        .filter(|e| matches!(e, FaultEvent::RecoveryTriggered(_) | FaultEvent::RecoveryCompleted(_)))
        .collect();
    assert!(matches!(names.as_slice(), [FaultEvent::RecoveryTriggered(_), FaultEvent::RecoveryCompleted(true)]));
}

#[test]
fn test_failing_recovery_action_exhausts_attempts() {
    let (s, _probe) = substrate_with_probe();
    s.faults()
        .register_recovery_action("always_fails", || anyhow::bail!("backend unavailable"));

    let t0 = Instant::now();
    assert!(s.faults().trigger_recovery_at("manual", t0));
    let mut now = t0;
    let mut outcome = None;
    for _ in 0..10 {
        now += Duration::from_secs(10);
        outcome = s.faults().poll_recovery_at(now);
        if outcome.is_some() {
            break;
        }
    }
    assert_eq!(outcome, Some(false));
    assert!(!s.faults().is_recovery_in_progress());
}

#[test]
fn test_diagnostic_report_covers_every_service() {
    let (s, _probe) = substrate_with_probe();
    s.metrics().sample_now();
    let report = s.diagnostic_report();
    for section in [
        "=== Performance report",
        "Faults:",
        "Buffer pool:",
        "Block allocator:",
        "Metrics:",
        "Scheduler:",
    ] {
        assert!(report.contains(section), "missing {section} in\n{report}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_running_substrate_dispatches_updates() {
    let (s, _probe) = substrate_with_probe();
    s.start().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    s.scheduler()
        .register_sink(UpdateKind::Status, "header", move |item| {
            sink.lock().push(item.payload.clone())
        });
    s.scheduler()
        .submit(WorkItem::new(UpdateKind::Status, "header", "a"));
    s.scheduler()
        .submit(WorkItem::new(UpdateKind::Status, "header", "b"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(*seen.lock(), vec![Bytes::from_static(b"b")]);

    let buffer = s.buffers().acquire(1500, None).expect("initialized pool");
    assert!(buffer.capacity() >= 1500);
    assert!(s.buffers().release(buffer));

    s.shutdown();
    assert!(!s.is_running());
}
