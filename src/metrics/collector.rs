//! Periodic metrics collector
//!
//! Samples are read on a blocking worker and pushed into a bounded history
//! ring. Subscribers and callbacks are notified from the collector task
//! once the read returns, never from the blocking worker. Alerts are evaluated on their own cadence against the
//! newest sample.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

use super::alert::{AlertSpec, FiredAlert};
use super::probe::{DiskReading, MemoryReading, NetworkReading, ProbeSource, ProcessReading, SystemProbe};
use super::{MetricsEvent, MetricsSnapshot};
use crate::core::{EventBus, Subscription};
use crate::fault::FaultReporter;
use crate::infrastructure::{RingBuffer, TimerSet};
use crate::Result;

/// Shortest sampling interval accepted
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

const RECENT_ALERTS: usize = 100;

/// Callback receiving every sample
pub type MetricsCallback = Arc<dyn Fn(&MetricsSnapshot) + Send + Sync>;

/// Callback receiving fired alerts
pub type AlertCallback = Arc<dyn Fn(&AlertSpec, &MetricsSnapshot) + Send + Sync>;

/// Collector settings
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// When false, `start` does not spawn sampling
    pub enabled: bool,
    pub interval: Duration,
    pub history_size: usize,
    pub alert_interval: Duration,
    /// Process memory, as a percent of total memory, that triggers memory-pressure hooks
    pub memory_threshold_percent: f64,
    /// Install the built-in CPU and memory alerts
    pub default_alerts: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(1000),
            history_size: 3600,
            alert_interval: Duration::from_secs(5),
            memory_threshold_percent: 80.0,
            default_alerts: true,
        }
    }
}

/// Last successful reading per source
#[derive(Default)]
struct LastGood {
    cpu: f64,
    memory: MemoryReading,
    disk: DiskReading,
    network: NetworkReading,
    process: ProcessReading,
}

struct CollectorState {
    config: CollectorConfig,
    history: RingBuffer<Arc<MetricsSnapshot>>,
    custom: BTreeMap<String, f64>,
    alerts: Vec<AlertSpec>,
    last_fired: HashMap<String, Instant>,
    recent_alerts: RingBuffer<FiredAlert>,
    last_good: LastGood,
    failing: BTreeSet<ProbeSource>,
    last_pressure_hook: Option<Instant>,
}

/// Callback lists, cloned out before invocation
#[derive(Default)]
struct Callbacks {
    metrics: Vec<(String, MetricsCallback)>,
    alerts: Vec<(String, AlertCallback)>,
    memory_pressure: Vec<(String, MetricsCallback)>,
}

/// A recorded sample not yet published
struct Sampled {
    snapshot: Arc<MetricsSnapshot>,
    pressure: bool,
    newly_failing: Vec<(ProbeSource, String)>,
}

/// Samples system and process metrics on an interval
pub struct MetricsCollector {
    probe: Arc<dyn SystemProbe>,
    state: Mutex<CollectorState>,
    callbacks: RwLock<Callbacks>,
    interval_ms: AtomicU64,
    running: AtomicBool,
    paused: AtomicBool,
    events: EventBus<MetricsEvent>,
    reporter: RwLock<FaultReporter>,
    timers: Mutex<Option<TimerSet>>,
}

impl MetricsCollector {
    pub fn new(config: CollectorConfig, probe: Arc<dyn SystemProbe>) -> Self {
        let interval = config.interval.max(MIN_INTERVAL);
        let alerts = if config.default_alerts {
            AlertSpec::defaults()
        } else {
            Vec::new()
        };
        Self {
            probe,
            state: Mutex::new(CollectorState {
                history: RingBuffer::new(config.history_size),
                config,
                custom: BTreeMap::new(),
                alerts,
                last_fired: HashMap::new(),
                recent_alerts: RingBuffer::new(RECENT_ALERTS),
                last_good: LastGood::default(),
                failing: BTreeSet::new(),
                last_pressure_hook: None,
            }),
            callbacks: RwLock::new(Callbacks::default()),
            interval_ms: AtomicU64::new(interval.as_millis() as u64),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            events: EventBus::new(),
            reporter: RwLock::new(FaultReporter::detached("metrics")),
            timers: Mutex::new(None),
        }
    }

    pub fn set_fault_reporter(&self, reporter: FaultReporter) {
        *self.reporter.write() = reporter;
    }

    fn reporter(&self) -> FaultReporter {
        self.reporter.read().clone()
    }

    /// Start sampling and alert timers
    ///
    /// A disabled collector starts nothing and stays idle.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut timers = self.timers.lock();
        if timers.is_some() {
            return Ok(());
        }
        let (enabled, alert_interval) = {
            let state = self.state.lock();
            (state.config.enabled, state.config.alert_interval)
        };
        if !enabled {
            tracing::info!(target: "metrics", "Metrics collection disabled");
            return Ok(());
        }

        let mut set = TimerSet::new("metrics")?;
        let weak = Arc::downgrade(self);
        set.spawn(async move {
            loop {
                let period = match weak.upgrade() {
                    Some(collector) => collector.interval(),
                    None => break,
                };
                tokio::time::sleep(period).await;
                let Some(collector) = weak.upgrade() else { break };
                if collector.is_paused() {
                    continue;
                }
                // Probe reads block; callbacks run back on this task
                let worker = Arc::clone(&collector);
                match tokio::task::spawn_blocking(move || worker.collect()).await {
                    Ok(sampled) => collector.publish(sampled),
                    Err(e) => tracing::error!(target: "metrics", "Sampling task failed: {}", e),
                }
            }
        });
        set.every(alert_interval, self, |collector| {
            if !collector.is_paused() {
                collector.check_alerts();
            }
        });
        *timers = Some(set);
        self.running.store(true, Ordering::Release);
        tracing::info!(target: "metrics", "Metrics collection started ({:?} interval)", self.interval());
        Ok(())
    }

    /// Stop timers; idempotent
    pub fn stop(&self) {
        if let Some(timers) = self.timers.lock().take() {
            timers.stop();
            tracing::info!(target: "metrics", "Metrics collection stopped");
        }
        self.running.store(false, Ordering::Release);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    /// Change the sampling interval, clamped to [`MIN_INTERVAL`]
    pub fn set_interval(&self, ms: u64) -> Duration {
        let interval = Duration::from_millis(ms).max(MIN_INTERVAL);
        self.interval_ms
            .store(interval.as_millis() as u64, Ordering::Release);
        interval
    }

    /// Resize the history ring, dropping the oldest samples that no longer fit
    pub fn set_history(&self, size: usize) {
        let mut state = self.state.lock();
        state.config.history_size = size;
        state.history.set_capacity(size);
    }

    pub fn add_custom(&self, name: &str, value: f64) {
        self.state.lock().custom.insert(name.to_string(), value);
    }

    pub fn remove_custom(&self, name: &str) -> bool {
        self.state.lock().custom.remove(name).is_some()
    }

    /// Take a sample now and publish it
    ///
    /// Probe calls run without the state lock. A failing source reuses
    /// its last good reading and is reported once until it recovers.
    pub fn sample_now(&self) -> Arc<MetricsSnapshot> {
        let sampled = self.collect();
        let snapshot = Arc::clone(&sampled.snapshot);
        self.publish(sampled);
        snapshot
    }

    /// Read the probe and record the sample; no callbacks run here
    fn collect(&self) -> Sampled {
        let cpu = self.probe.cpu_usage();
        let memory = self.probe.memory();
        let disk = self.probe.disk();
        let network = self.probe.network();
        let process = self.probe.process();
        let now = Instant::now();

        let mut newly_failing = Vec::new();
        let (snapshot, pressure) = {
            let mut state = self.state.lock();
            let mut track = |source: ProbeSource, ok: bool, detail: Option<String>| {
                if ok {
                    if state.failing.remove(&source) {
                        tracing::info!(target: "metrics", "{} probe recovered", source);
                    }
                } else if state.failing.insert(source) {
                    newly_failing.push((source, detail.unwrap_or_default()));
                }
            };
            track(ProbeSource::Cpu, cpu.is_ok(), cpu.as_ref().err().map(|e| e.to_string()));
            track(ProbeSource::Memory, memory.is_ok(), memory.as_ref().err().map(|e| e.to_string()));
            track(ProbeSource::Disk, disk.is_ok(), disk.as_ref().err().map(|e| e.to_string()));
            track(ProbeSource::Network, network.is_ok(), network.as_ref().err().map(|e| e.to_string()));
            track(ProbeSource::Process, process.is_ok(), process.as_ref().err().map(|e| e.to_string()));

            let good = &mut state.last_good;
            if let Ok(v) = cpu {
                good.cpu = v;
            }
            if let Ok(v) = memory {
                good.memory = v;
            }
            if let Ok(v) = disk {
                good.disk = v;
            }
            // Network readings are deltas; a failed read counts as zero traffic
            if let Ok(v) = network {
                good.network = v;
            } else {
                good.network = NetworkReading::default();
            }
            if let Ok(v) = process {
                good.process = v;
            }

            let mut timestamp = OffsetDateTime::now_utc();
            if let Some(last) = state.history.last() {
                timestamp = timestamp.max(last.timestamp);
            }
            let good = &state.last_good;
            let snapshot = Arc::new(MetricsSnapshot {
                timestamp,
                cpu_usage: good.cpu,
                memory_used: good.memory.used.min(good.memory.total),
                memory_total: good.memory.total,
                disk_used: good.disk.used.min(good.disk.total),
                disk_total: good.disk.total,
                net_in: good.network.received,
                net_out: good.network.sent,
                process_memory: good.process.resident,
                process_cpu: good.process.cpu_percent,
                thread_count: good.process.threads,
                custom: state.custom.clone(),
            });
            state.history.push(Arc::clone(&snapshot));

            let over = snapshot.memory_total > 0
                && snapshot.process_memory_percent() > state.config.memory_threshold_percent;
            let due = state
                .last_pressure_hook
                .map(|at| now.saturating_duration_since(at) >= state.config.alert_interval)
                .unwrap_or(true);
            let pressure = over && due;
            if pressure {
                state.last_pressure_hook = Some(now);
            } else if !over {
                state.last_pressure_hook = None;
            }
            (snapshot, pressure)
        };

        Sampled {
            snapshot,
            pressure,
            newly_failing,
        }
    }

    /// Report probe failures, then notify subscribers, callbacks and hooks
    fn publish(&self, sampled: Sampled) {
        let Sampled {
            snapshot,
            pressure,
            newly_failing,
        } = sampled;
        for (source, detail) in newly_failing {
            tracing::warn!(target: "metrics", "{} probe failed, using last good value: {}", source, detail);
            self.reporter()
                .warning(&format!("{} probe failed: {}", source, detail), "sample");
        }

        self.events
            .emit(MetricsEvent::MetricsUpdated(Arc::clone(&snapshot)));
        let (callbacks, hooks) = {
            let cbs = self.callbacks.read();
            let hooks = if pressure {
                cbs.memory_pressure.clone()
            } else {
                Vec::new()
            };
            (cbs.metrics.clone(), hooks)
        };
        for (name, callback) in callbacks {
            self.invoke("metrics callback", &name, || callback(&snapshot));
        }
        if pressure {
            crate::log_metrics!(
                tracing::Level::WARN,
                "Process memory at {:.1}% of total, running memory-pressure hooks",
                snapshot.process_memory_percent()
            );
            for (name, hook) in hooks {
                self.invoke("memory-pressure hook", &name, || hook(&snapshot));
            }
        }
    }

    fn invoke(&self, kind: &str, name: &str, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            tracing::error!(target: "metrics", "{} {} panicked", kind, name);
            self.reporter()
                .error(&format!("{} {} panicked", kind, name), "callback");
        }
    }

    pub fn current(&self) -> Option<Arc<MetricsSnapshot>> {
        self.state.lock().history.last().cloned()
    }

    /// Last `n` samples, oldest first
    pub fn history(&self, n: usize) -> Vec<Arc<MetricsSnapshot>> {
        self.state.lock().history.tail(n).cloned().collect()
    }

    /// Samples with `start <= timestamp <= end`
    pub fn range(&self, start: OffsetDateTime, end: OffsetDateTime) -> Vec<Arc<MetricsSnapshot>> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Field-wise mean over a time range
    pub fn average(&self, start: OffsetDateTime, end: OffsetDateTime) -> Option<MetricsSnapshot> {
        aggregate(&self.range(start, end), Aggregate::Mean)
    }

    /// Field-wise maximum over a time range
    pub fn peak(&self, start: OffsetDateTime, end: OffsetDateTime) -> Option<MetricsSnapshot> {
        aggregate(&self.range(start, end), Aggregate::Max)
    }

    /// Field-wise minimum over a time range
    pub fn minimum(&self, start: OffsetDateTime, end: OffsetDateTime) -> Option<MetricsSnapshot> {
        aggregate(&self.range(start, end), Aggregate::Min)
    }

    /// Add an alert, replacing one with the same name
    pub fn add_alert(&self, spec: AlertSpec) {
        let mut state = self.state.lock();
        state.alerts.retain(|a| a.name != spec.name);
        state.last_fired.remove(&spec.name);
        state.alerts.push(spec);
    }

    pub fn remove_alert(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.alerts.len();
        state.alerts.retain(|a| a.name != name);
        state.last_fired.remove(name);
        state.alerts.len() != before
    }

    pub fn alerts(&self) -> Vec<AlertSpec> {
        self.state.lock().alerts.clone()
    }

    /// Evaluate alerts against the newest sample
    pub fn check_alerts(&self) -> usize {
        self.check_alerts_at(Instant::now())
    }

    pub fn check_alerts_at(&self, now: Instant) -> usize {
        let (snapshot, fired) = {
            let mut state = self.state.lock();
            let Some(snapshot) = state.history.last().cloned() else {
                return 0;
            };
            let mut fired = Vec::new();
            for alert in &state.alerts {
                if !alert.enabled {
                    continue;
                }
                let Some(value) = snapshot.value(&alert.metric_path) else {
                    continue;
                };
                if value < alert.threshold {
                    continue;
                }
                let debounce = Duration::from_secs(alert.duration_s);
                let quiet = state
                    .last_fired
                    .get(&alert.name)
                    .map(|at| now.saturating_duration_since(*at) >= debounce)
                    .unwrap_or(true);
                if quiet {
                    fired.push((alert.clone(), value));
                }
            }
            for (alert, value) in &fired {
                state.last_fired.insert(alert.name.clone(), now);
                state.recent_alerts.push(FiredAlert {
                    alert: alert.clone(),
                    value: *value,
                    timestamp: snapshot.timestamp,
                });
            }
            (snapshot, fired)
        };

        let callbacks = self.callbacks.read().alerts.clone();
        for (alert, value) in &fired {
            let message = format!(
                "alert '{}' triggered: {} = {:.2} (threshold {:.2})",
                alert.name, alert.metric_path, value, alert.threshold
            );
            tracing::warn!(target: "metrics", "{}", message);
            if let Some(severity) = alert.action.severity() {
                self.reporter().report(severity, &message, "check_alerts");
            }
            self.events.emit(MetricsEvent::AlertTriggered {
                alert: alert.clone(),
                snapshot: Arc::clone(&snapshot),
            });
            for (name, callback) in &callbacks {
                self.invoke("alert callback", name, || callback(alert, &snapshot));
            }
        }
        fired.len()
    }

    /// Last `n` fired alerts, oldest first
    pub fn recent_alerts(&self, n: usize) -> Vec<FiredAlert> {
        self.state.lock().recent_alerts.tail(n).cloned().collect()
    }

    /// Register a per-sample callback, replacing one with the same name
    pub fn register_callback<F>(&self, name: &str, f: F)
    where
        F: Fn(&MetricsSnapshot) + Send + Sync + 'static,
    {
        let mut cbs = self.callbacks.write();
        cbs.metrics.retain(|(n, _)| n.as_str() != name);
        cbs.metrics.push((name.to_string(), Arc::new(f)));
    }

    /// Remove a callback of any kind by name
    pub fn unregister_callback(&self, name: &str) -> bool {
        let mut cbs = self.callbacks.write();
        let before = cbs.metrics.len() + cbs.alerts.len() + cbs.memory_pressure.len();
        cbs.metrics.retain(|(n, _)| n.as_str() != name);
        cbs.alerts.retain(|(n, _)| n.as_str() != name);
        cbs.memory_pressure.retain(|(n, _)| n.as_str() != name);
        before != cbs.metrics.len() + cbs.alerts.len() + cbs.memory_pressure.len()
    }

    pub fn register_alert_callback<F>(&self, name: &str, f: F)
    where
        F: Fn(&AlertSpec, &MetricsSnapshot) + Send + Sync + 'static,
    {
        let mut cbs = self.callbacks.write();
        cbs.alerts.retain(|(n, _)| n.as_str() != name);
        cbs.alerts.push((name.to_string(), Arc::new(f)));
    }

    /// Hook run when process memory crosses the configured percentage
    ///
    /// Runs on the first sample over the threshold, then at most once per
    /// alert interval while memory stays high.
    pub fn on_memory_pressure<F>(&self, name: &str, f: F)
    where
        F: Fn(&MetricsSnapshot) + Send + Sync + 'static,
    {
        let mut cbs = self.callbacks.write();
        cbs.memory_pressure.retain(|(n, _)| n.as_str() != name);
        cbs.memory_pressure.push((name.to_string(), Arc::new(f)));
    }

    pub fn subscribe(&self) -> Subscription<MetricsEvent> {
        self.events.subscribe()
    }

    /// Human-readable diagnostic block
    pub fn report(&self) -> String {
        let state = self.state.lock();
        let mut out = String::from("Metrics:\n");
        out.push_str(&format!(
            "  running {} paused {} interval {:?} history {}/{}\n",
            self.is_running(),
            self.is_paused(),
            self.interval(),
            state.history.len(),
            state.history.capacity()
        ));
        if let Some(s) = state.history.last() {
            out.push_str(&format!(
                "  cpu {:.1}% memory {:.1}% disk {:.1}%\n",
                s.cpu_usage,
                s.memory_usage_percent(),
                s.disk_usage_percent()
            ));
            out.push_str(&format!(
                "  process {} bytes cpu {:.1}% threads {}\n",
                s.process_memory, s.process_cpu, s.thread_count
            ));
            for (name, value) in &s.custom {
                out.push_str(&format!("  {} = {:.2}\n", name, value));
            }
        }
        if !state.failing.is_empty() {
            let names: Vec<&str> = state.failing.iter().map(|s| s.name()).collect();
            out.push_str(&format!("  failing probes: {}\n", names.join(", ")));
        }
        out.push_str(&format!("  recent alerts ({}):\n", state.recent_alerts.len()));
        for fired in state.recent_alerts.tail(10) {
            out.push_str(&format!(
                "    {} {} = {:.2}\n",
                fired.alert.name, fired.alert.metric_path, fired.value
            ));
        }
        out
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        if let Some(timers) = self.timers.get_mut().take() {
            timers.stop();
        }
    }
}

#[derive(Clone, Copy)]
enum Aggregate {
    Mean,
    Max,
    Min,
}

fn aggregate(samples: &[Arc<MetricsSnapshot>], op: Aggregate) -> Option<MetricsSnapshot> {
    let last = samples.last()?;
    let n = samples.len() as f64;
    let fold = |f: &dyn Fn(&MetricsSnapshot) -> f64| -> f64 {
        let values = samples.iter().map(|s| f(s.as_ref()));
        match op {
            Aggregate::Mean => values.sum::<f64>() / n,
            Aggregate::Max => values.fold(f64::MIN, f64::max),
            Aggregate::Min => values.fold(f64::MAX, f64::min),
        }
    };

    let mut custom = BTreeMap::new();
    let names: BTreeSet<&String> = samples.iter().flat_map(|s| s.custom.keys()).collect();
    for name in names {
        let values: Vec<f64> = samples.iter().filter_map(|s| s.custom.get(name).copied()).collect();
        let v = match op {
            Aggregate::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Aggregate::Max => values.iter().copied().fold(f64::MIN, f64::max),
            Aggregate::Min => values.iter().copied().fold(f64::MAX, f64::min),
        };
        custom.insert(name.clone(), v);
    }

    Some(MetricsSnapshot {
        timestamp: last.timestamp,
        cpu_usage: fold(&|s| s.cpu_usage),
        memory_used: fold(&|s| s.memory_used as f64) as u64,
        memory_total: fold(&|s| s.memory_total as f64) as u64,
        disk_used: fold(&|s| s.disk_used as f64) as u64,
        disk_total: fold(&|s| s.disk_total as f64) as u64,
        net_in: fold(&|s| s.net_in as f64) as u64,
        net_out: fold(&|s| s.net_out as f64) as u64,
        process_memory: fold(&|s| s.process_memory as f64) as u64,
        process_cpu: fold(&|s| s.process_cpu),
        thread_count: fold(&|s| s.thread_count as f64) as u32,
        custom,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NamedEvent;
    use crate::fault::{ReportFault, Severity};
    use crate::metrics::FakeProbe;
    use crate::test_utils::RecordingReporter;
    use std::sync::atomic::AtomicUsize;

    fn quiet_config() -> CollectorConfig {
        CollectorConfig {
            default_alerts: false,
            ..CollectorConfig::default()
        }
    }

    fn collector(config: CollectorConfig) -> (Arc<MetricsCollector>, Arc<FakeProbe>) {
        let probe = Arc::new(FakeProbe::new());
        probe.set_memory(2_000, 8_000);
        probe.set_disk(10, 100);
        probe.set_process(1_000, 5.0, 4);
        let c = Arc::new(MetricsCollector::new(config, probe.clone()));
        (c, probe)
    }

    #[test]
    fn test_sample_uses_probe_and_custom() {
        let (c, probe) = collector(quiet_config());
        probe.set_cpu(37.5);
        c.add_custom("frames", 60.0);

        let s = c.sample_now();
        assert_eq!(s.cpu_usage, 37.5);
        assert_eq!(s.memory_usage_percent(), 25.0);
        assert_eq!(s.thread_count, 4);
        assert_eq!(s.custom.get("frames"), Some(&60.0));

        assert!(c.remove_custom("frames"));
        assert!(!c.remove_custom("frames"));
        assert!(c.sample_now().custom.is_empty());
        assert_eq!(c.history(10).len(), 2);
    }

    #[test]
    fn test_history_ring_bounded() {
        let (c, _probe) = collector(quiet_config());
        c.set_history(3);
        for _ in 0..5 {
            c.sample_now();
        }
        let h = c.history(10);
        assert_eq!(h.len(), 3);
        assert!(h.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(Arc::ptr_eq(&h[2], &c.current().unwrap()));
    }

    #[test]
    fn test_interval_clamped() {
        let (c, _probe) = collector(quiet_config());
        assert_eq!(c.set_interval(20), MIN_INTERVAL);
        assert_eq!(c.set_interval(250), Duration::from_millis(250));
        assert_eq!(c.interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_probe_failure_reuses_last_good_and_warns_once() {
        let (c, probe) = collector(quiet_config());
        let recorder = Arc::new(RecordingReporter::default());
        let sink: Arc<dyn ReportFault> = recorder.clone();
        c.set_fault_reporter(FaultReporter::new("metrics", &sink));

        probe.set_cpu(20.0);
        c.sample_now();
        probe.set_cpu(99.0);
        probe.set_failing(ProbeSource::Cpu, true);
        assert_eq!(c.sample_now().cpu_usage, 20.0);
        assert_eq!(c.sample_now().cpu_usage, 20.0);
        assert_eq!(recorder.count_at(Severity::Warning), 1);

        probe.set_failing(ProbeSource::Cpu, false);
        assert_eq!(c.sample_now().cpu_usage, 99.0);
        probe.set_failing(ProbeSource::Cpu, true);
        c.sample_now();
        assert_eq!(recorder.count_at(Severity::Warning), 2);
    }

    #[test]
    fn test_failed_network_read_counts_as_no_traffic() {
        let (c, probe) = collector(quiet_config());
        probe.set_network(500, 300);
        assert_eq!(c.sample_now().net_in, 500);
        probe.set_failing(ProbeSource::Network, true);
        let s = c.sample_now();
        assert_eq!((s.net_in, s.net_out), (0, 0));
    }

    #[test]
    fn test_memory_used_clamped_to_total() {
        let (c, probe) = collector(quiet_config());
        probe.set_memory(9_000, 8_000);
        let s = c.sample_now();
        assert!(s.memory_used <= s.memory_total);
    }

    #[test]
    fn test_callbacks_in_sample_order_and_isolated() {
        let (c, probe) = collector(quiet_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        c.register_callback("panicky", |_| panic!("boom"));
        c.register_callback("record", move |s| sink.lock().push(s.cpu_usage));

        for cpu in [1.0, 2.0, 3.0] {
            probe.set_cpu(cpu);
            c.sample_now();
        }
        assert_eq!(*seen.lock(), vec![1.0, 2.0, 3.0]);

        assert!(c.unregister_callback("record"));
        assert!(!c.unregister_callback("record"));
        c.sample_now();
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn test_alert_zero_duration_fires_first_sample() {
        let (c, probe) = collector(quiet_config());
        let events = c.subscribe();
        c.add_alert(AlertSpec::new("cpu", "cpu_usage", 50.0));
        probe.set_cpu(50.0);
        c.sample_now();

        let now = Instant::now();
        assert_eq!(c.check_alerts_at(now), 1);
        let names: Vec<_> = events.drain().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["metrics_updated", "alert_triggered"]);
        assert_eq!(c.recent_alerts(5).len(), 1);
    }

    #[test]
    fn test_alert_debounce() {
        let (c, probe) = collector(quiet_config());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        c.register_alert_callback("count", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        c.add_alert(AlertSpec::new("mem", "memory_usage", 20.0).duration(30));
        c.sample_now();

        let t0 = Instant::now();
        assert_eq!(c.check_alerts_at(t0), 1);
        assert_eq!(c.check_alerts_at(t0 + Duration::from_secs(10)), 0);
        assert_eq!(c.check_alerts_at(t0 + Duration::from_secs(30)), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        probe.set_memory(1_000, 8_000);
        c.sample_now();
        assert_eq!(c.check_alerts_at(t0 + Duration::from_secs(120)), 0);
    }

    #[test]
    fn test_alert_custom_metric_and_removal() {
        let (c, _probe) = collector(quiet_config());
        let recorder = Arc::new(RecordingReporter::default());
        let sink: Arc<dyn ReportFault> = recorder.clone();
        c.set_fault_reporter(FaultReporter::new("metrics", &sink));

        c.add_alert(
            AlertSpec::new("backlog", "queue_depth", 10.0)
                .action(crate::metrics::AlertAction::Critical),
        );
        c.add_custom("queue_depth", 12.0);
        c.sample_now();
        assert_eq!(c.check_alerts(), 1);
        assert_eq!(recorder.count_at(Severity::Critical), 1);

        assert!(c.remove_alert("backlog"));
        assert!(!c.remove_alert("backlog"));
        assert_eq!(c.check_alerts(), 0);
    }

    #[test]
    fn test_default_alerts_installed() {
        let (c, _probe) = collector(CollectorConfig::default());
        assert_eq!(c.alerts().len(), 2);
    }

    #[test]
    fn test_memory_pressure_hook() {
        let config = CollectorConfig {
            memory_threshold_percent: 50.0,
            ..quiet_config()
        };
        let (c, probe) = collector(config);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        c.on_memory_pressure("cleanup", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        c.sample_now();
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        probe.set_process(6_000, 5.0, 4);
        c.sample_now();
        c.sample_now();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        probe.set_process(1_000, 5.0, 4);
        c.sample_now();
        probe.set_process(6_000, 5.0, 4);
        c.sample_now();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_range_summaries() {
        let (c, probe) = collector(quiet_config());
        for cpu in [10.0, 20.0, 60.0] {
            probe.set_cpu(cpu);
            c.sample_now();
        }
        let h = c.history(3);
        let (start, end) = (h[0].timestamp, h[2].timestamp);
        assert_eq!(c.range(start, end).len(), 3);

        let avg = c.average(start, end).unwrap();
        assert!((avg.cpu_usage - 30.0).abs() < 1e-9);
        assert_eq!(c.peak(start, end).unwrap().cpu_usage, 60.0);
        assert_eq!(c.minimum(start, end).unwrap().cpu_usage, 10.0);

        let before = start - time::Duration::hours(1);
        assert!(c.average(before, before).is_none());
    }

    #[test]
    fn test_report_mentions_failing_probe() {
        let (c, probe) = collector(quiet_config());
        probe.set_failing(ProbeSource::Disk, true);
        c.sample_now();
        let report = c.report();
        assert!(report.contains("failing probes: disk"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_samples_periodically() {
        let config = CollectorConfig {
            interval: Duration::from_millis(100),
            ..quiet_config()
        };
        let (c, _probe) = collector(config);
        c.start().unwrap();
        c.start().unwrap();
        assert!(c.is_running());

        tokio::time::sleep(Duration::from_millis(350)).await;
        let taken = c.history(100).len();
        assert!(taken >= 2, "expected samples, got {}", taken);

        c.pause();
        assert!(c.is_paused());
        let paused_at = c.history(100).len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(c.history(100).len() <= paused_at + 1);
        c.resume();

        c.stop();
        c.stop();
        assert!(!c.is_running());
    }

    /// Records which threads perform reads
    struct ThreadTrackingReader {
        inner: FakeProbe,
        readers: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl SystemProbe for ThreadTrackingReader {
        fn cpu_usage(&self) -> Result<f64> {
            self.readers.lock().push(std::thread::current().id());
            self.inner.cpu_usage()
        }
        fn memory(&self) -> Result<MemoryReading> {
            self.inner.memory()
        }
        fn disk(&self) -> Result<DiskReading> {
            self.inner.disk()
        }
        fn network(&self) -> Result<NetworkReading> {
            self.inner.network()
        }
        fn process(&self) -> Result<ProcessReading> {
            self.inner.process()
        }
    }

    #[tokio::test]
    async fn test_callbacks_run_off_the_reading_thread() {
        let probe = Arc::new(ThreadTrackingReader {
            inner: FakeProbe::new(),
            readers: Mutex::new(Vec::new()),
        });
        let config = CollectorConfig {
            interval: Duration::from_millis(100),
            ..quiet_config()
        };
        let c = Arc::new(MetricsCollector::new(config, probe.clone()));
        let callers = Arc::new(Mutex::new(Vec::new()));
        let seen = callers.clone();
        c.register_callback("thread", move |_| seen.lock().push(std::thread::current().id()));

        c.start().unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        c.stop();

        let readers = probe.readers.lock().clone();
        let callers = callers.lock().clone();
        assert!(!readers.is_empty());
        assert!(!callers.is_empty());
        assert!(callers.iter().all(|id| !readers.contains(id)));
    }

    #[tokio::test]
    async fn test_disabled_collector_does_not_start() {
        let config = CollectorConfig {
            enabled: false,
            ..quiet_config()
        };
        let (c, _probe) = collector(config);
        c.start().unwrap();
        assert!(!c.is_running());
    }
}
