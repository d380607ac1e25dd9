//! Priority/coalescing update scheduler
//!
//! Submitters on any thread push work items into one queue guarded by a
//! mutex. The tick selects a batch under the lock, then dispatches to
//! sinks after releasing it, so a sink may submit again without
//! deadlocking. Within one `(kind, target_id)` pair items dispatch in
//! submission order; across pairs priority dominates timestamp.

use bytes::Bytes;
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::cache::{CacheConfig, CacheStats, PayloadCache};
use super::item::{Strategy, UpdateKind, WorkItem};
use super::SchedulerEvent;
use crate::core::{EventBus, Subscription};
use crate::fault::FaultReporter;
use crate::infrastructure::{RollingWindow, TimerSet};
use crate::metrics::MetricsSnapshot;
use crate::{Result, SubstrateError};

const MAX_TICK_INTERVAL: Duration = Duration::from_millis(100);
const SLOWDOWN_FACTOR: f64 = 1.2;
const SPEEDUP_FACTOR: f64 = 0.9;
const TICK_BACKOFF: f64 = 1.5;
const SLOW_DISPATCH_MS: f64 = 20.0;
const FAST_DISPATCH_MS: f64 = 10.0;
const WARN_DISPATCH_MS: f64 = 50.0;
const WARN_QUEUE_FILL: f64 = 0.8;
const SPEEDUP_QUEUE_FILL: f64 = 0.3;
/// Queued items below this priority are shed under memory pressure
const SHED_PRIORITY: u8 = 30;
/// Hygiene drops items below this priority once they are stale
const STALE_PRIORITY: u8 = 50;
const STALE_AGE: Duration = Duration::from_secs(5);

/// Sink receiving dispatched items for one `(kind, target_id)`
pub type UpdateSink = Arc<dyn Fn(&WorkItem) + Send + Sync>;

type PairKey = (UpdateKind, String);

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Base tick period; adaptive tuning may stretch it up to 100 ms
    pub tick_interval: Duration,
    pub target_fps: u32,
    pub max_batch: usize,
    pub max_queue: usize,
    pub adaptive_tuning: bool,
    pub tuning_interval: Duration,
    pub hygiene_interval: Duration,
    /// CPU percent above which the tick slows down
    pub cpu_threshold: f64,
    /// Process resident bytes above which low-priority items are shed
    pub memory_threshold: u64,
    /// Dispatch-time samples kept for tuning
    pub adaptive_window: usize,
    /// Skip the next tick when a tick overruns the frame budget
    pub frame_cap: bool,
    pub coalescing: bool,
    pub duplicate_suppression: bool,
    pub cache: CacheConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(16),
            target_fps: 60,
            max_batch: 10,
            max_queue: 100,
            adaptive_tuning: true,
            tuning_interval: Duration::from_secs(2),
            hygiene_interval: Duration::from_secs(5),
            cpu_threshold: 80.0,
            memory_threshold: 1024 * 1024 * 1024,
            adaptive_window: 100,
            frame_cap: true,
            coalescing: true,
            duplicate_suppression: true,
            cache: CacheConfig::default(),
        }
    }
}

impl SchedulerConfig {
    fn frame_budget(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.target_fps.max(1)))
    }
}

/// Why a submission was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Disabled,
    QueueFull,
    ShutDown,
}

/// Result of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Merged into a queued item of the same pair
    Coalesced,
    /// Dispatched synchronously on the caller's thread
    Dispatched,
    Dropped(DropReason),
    /// Same payload as the last dispatch, inside the kind interval
    Suppressed,
}

impl SubmitOutcome {
    pub fn accepted(self) -> bool {
        matches!(
            self,
            SubmitOutcome::Queued | SubmitOutcome::Coalesced | SubmitOutcome::Dispatched
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct KindSettings {
    interval: Duration,
    strategy: Strategy,
    enabled: bool,
}

/// Dispatch timing for one kind
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KindStats {
    pub dispatched: u64,
    pub total_ms: f64,
    pub max_ms: f64,
}

impl KindStats {
    pub fn avg_ms(&self) -> f64 {
        if self.dispatched == 0 {
            0.0
        } else {
            self.total_ms / self.dispatched as f64
        }
    }
}

/// Point-in-time scheduler statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub coalesced: u64,
    pub dropped: u64,
    pub evicted: u64,
    pub suppressed: u64,
    pub immediate: u64,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub pending: usize,
    pub max_queue: usize,
    pub avg_dispatch_ms: f64,
    pub achieved_fps: f64,
    pub tick_interval_ms: f64,
    pub paused: bool,
    pub kinds: BTreeMap<UpdateKind, KindStats>,
}

#[derive(Default)]
struct SchedulerCounters {
    submitted: CachePadded<AtomicU64>,
    dispatched: CachePadded<AtomicU64>,
    coalesced: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    evicted: CachePadded<AtomicU64>,
    suppressed: CachePadded<AtomicU64>,
    immediate: CachePadded<AtomicU64>,
    ticks: CachePadded<AtomicU64>,
    skipped_ticks: CachePadded<AtomicU64>,
}

impl SchedulerCounters {
    #[inline]
    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[inline]
    fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }
}

struct SchedulerState {
    config: SchedulerConfig,
    kinds: [KindSettings; 10],
    queue: Vec<WorkItem>,
    /// Last dispatched payload per pair, for duplicate suppression
    last_dispatched: HashMap<PairKey, (Bytes, Instant)>,
    paused: bool,
    shut_down: bool,
    tick_interval: Duration,
    skip_next_tick: bool,
    last_tick_wall: Duration,
    last_tick_at: Option<Instant>,
    tick_spacing_ms: RollingWindow,
    dispatch_ms: RollingWindow,
    kind_stats: [KindStats; 10],
    cpu: f64,
    process_memory: u64,
    next_seq: u64,
}

impl SchedulerState {
    fn settings(&self, kind: UpdateKind) -> &KindSettings {
        &self.kinds[kind.index()]
    }

    /// Strategy as seen by selection; Adaptive resolves per tick
    fn effective_strategy(&self, kind: UpdateKind) -> Strategy {
        match self.settings(kind).strategy {
            Strategy::Adaptive if self.last_tick_wall > self.config.frame_budget() / 2 => {
                Strategy::Deferred
            }
            Strategy::Adaptive => Strategy::Batched,
            other => other,
        }
    }

    fn queue_fill(&self) -> f64 {
        self.queue.len() as f64 / self.config.max_queue.max(1) as f64
    }

    /// Remove every queued item of `kind`/`target`, in submission order
    fn take_pair(&mut self, kind: UpdateKind, target: &str) -> Vec<WorkItem> {
        let mut taken = Vec::new();
        self.queue.retain(|q| {
            if q.kind == kind && q.target_id == target {
                taken.push(q.clone());
                false
            } else {
                true
            }
        });
        taken.sort_by_key(|q| q.seq);
        taken
    }

    /// Index of the oldest queued item with priority strictly below `priority`
    fn eviction_candidate(&self, priority: u8) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .filter(|(_, q)| q.priority < priority)
            .min_by_key(|(_, q)| (q.enqueued_at, q.seq))
            .map(|(i, _)| i)
    }

    /// Pick up to `max_batch` eligible items
    ///
    /// Non-deferred items go first; deferred ones fill what is left.
    /// An item is only taken once every earlier item of its pair is.
    fn select(&self, now: Instant) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.queue.len()).collect();
        order.sort_by(|&a, &b| {
            let (qa, qb) = (&self.queue[a], &self.queue[b]);
            qb.priority
                .cmp(&qa.priority)
                .then(qa.enqueued_at.cmp(&qb.enqueued_at))
                .then(qa.seq.cmp(&qb.seq))
        });

        let mut heads: HashMap<(UpdateKind, &str), VecDeque<u64>> = HashMap::new();
        let mut by_seq: Vec<&WorkItem> = self.queue.iter().collect();
        by_seq.sort_by_key(|q| q.seq);
        for q in by_seq {
            heads
                .entry((q.kind, q.target_id.as_str()))
                .or_default()
                .push_back(q.seq);
        }

        let max_batch = self.config.max_batch.max(1);
        let mut taken = vec![false; self.queue.len()];
        let mut selected = Vec::new();
        for deferred_phase in [false, true] {
            loop {
                let mut progressed = false;
                for &i in &order {
                    if selected.len() >= max_batch {
                        return selected;
                    }
                    if taken[i] {
                        continue;
                    }
                    let item = &self.queue[i];
                    let deferred = self.effective_strategy(item.kind) == Strategy::Deferred;
                    if deferred != deferred_phase {
                        continue;
                    }
                    if item.waited(now) < self.settings(item.kind).interval {
                        continue;
                    }
                    let Some(pair) = heads.get_mut(&(item.kind, item.target_id.as_str())) else {
                        continue;
                    };
                    if pair.front() != Some(&item.seq) {
                        continue;
                    }
                    pair.pop_front();
                    taken[i] = true;
                    selected.push(i);
                    progressed = true;
                }
                if !progressed {
                    break;
                }
            }
        }
        selected
    }
}

/// Throttling, coalescing update scheduler
pub struct UpdateScheduler {
    state: Mutex<SchedulerState>,
    sinks: RwLock<HashMap<PairKey, UpdateSink>>,
    counters: SchedulerCounters,
    cache: PayloadCache,
    events: EventBus<SchedulerEvent>,
    reporter: RwLock<FaultReporter>,
    timers: Mutex<Option<TimerSet>>,
}

impl UpdateScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let kinds = UpdateKind::ALL.map(|kind| KindSettings {
            interval: kind.default_interval(),
            strategy: kind.default_strategy(),
            enabled: true,
        });
        let cache = PayloadCache::new(config.cache.clone());
        Self {
            state: Mutex::new(SchedulerState {
                kinds,
                queue: Vec::with_capacity(config.max_queue),
                last_dispatched: HashMap::new(),
                paused: false,
                shut_down: false,
                tick_interval: config.tick_interval,
                skip_next_tick: false,
                last_tick_wall: Duration::ZERO,
                last_tick_at: None,
                tick_spacing_ms: RollingWindow::new(60),
                dispatch_ms: RollingWindow::new(config.adaptive_window),
                kind_stats: [KindStats::default(); 10],
                cpu: 0.0,
                process_memory: 0,
                next_seq: 0,
                config,
            }),
            sinks: RwLock::new(HashMap::new()),
            counters: SchedulerCounters::default(),
            cache,
            events: EventBus::new(),
            reporter: RwLock::new(FaultReporter::detached("scheduler")),
            timers: Mutex::new(None),
        }
    }

    pub fn set_fault_reporter(&self, reporter: FaultReporter) {
        *self.reporter.write() = reporter;
    }

    fn reporter(&self) -> FaultReporter {
        self.reporter.read().clone()
    }

    /// Start tick, tuning and hygiene timers
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut timers = self.timers.lock();
        if timers.is_some() {
            return Ok(());
        }
        let (adaptive, tuning_interval, hygiene_interval) = {
            let state = self.state.lock();
            if state.shut_down {
                return Err(SubstrateError::ShutDown("scheduler"));
            }
            (
                state.config.adaptive_tuning,
                state.config.tuning_interval,
                state.config.hygiene_interval,
            )
        };

        let mut set = TimerSet::new("scheduler")?;
        set.every_dynamic(self, |s| s.tick_interval(), |s| {
            s.tick();
        });
        if adaptive {
            set.every(tuning_interval, self, |s| s.tune());
        }
        set.every(hygiene_interval, self, |s| {
            s.hygiene();
        });
        *timers = Some(set);
        tracing::info!(target: "scheduler", "Update scheduler started ({:?} tick)", self.tick_interval());
        Ok(())
    }

    /// Stop timers and refuse new submissions; idempotent
    pub fn shutdown(&self) {
        if let Some(timers) = self.timers.lock().take() {
            timers.stop();
        }
        let discarded = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            let n = state.queue.len();
            state.queue.clear();
            n
        };
        self.cache.clear();
        tracing::info!(target: "scheduler", "Update scheduler shut down ({} pending items discarded)", discarded);
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Submit one work item
    ///
    /// The item's `enqueued_at` is the reference time for duplicate
    /// suppression and interval eligibility.
    pub fn submit(&self, mut item: WorkItem) -> SubmitOutcome {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let now = item.enqueued_at;

        let flushed = {
            let mut state = self.state.lock();
            if state.shut_down {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return SubmitOutcome::Dropped(DropReason::ShutDown);
            }
            let settings = *state.settings(item.kind);
            if !settings.enabled {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return SubmitOutcome::Dropped(DropReason::Disabled);
            }

            if state.config.duplicate_suppression {
                let key = (item.kind, item.target_id.clone());
                if let Some((payload, at)) = state.last_dispatched.get(&key) {
                    if *payload == item.payload
                        && now.saturating_duration_since(*at) < settings.interval
                    {
                        self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                        return SubmitOutcome::Suppressed;
                    }
                }
            }

            item.seq = state.next_seq;
            state.next_seq += 1;

            if item.immediate || settings.strategy == Strategy::Immediate {
                let mut batch = state.take_pair(item.kind, &item.target_id);
                batch.push(item);
                for dispatched in &batch {
                    state.last_dispatched.insert(
                        (dispatched.kind, dispatched.target_id.clone()),
                        (dispatched.payload.clone(), now),
                    );
                }
                batch
            } else {
                if state.config.coalescing && item.coalescing {
                    if let Some(existing) = state
                        .queue
                        .iter_mut()
                        .find(|q| q.coalescing && q.same_target(&item))
                    {
                        existing.payload = item.payload;
                        existing.enqueued_at = item.enqueued_at;
                        existing.priority = item.priority;
                        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                        return SubmitOutcome::Coalesced;
                    }
                }

                if state.queue.len() >= state.config.max_queue {
                    let candidate = state.eviction_candidate(item.priority);
                    match candidate {
                        Some(i) => {
                            let evicted = state.queue.remove(i);
                            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(
                                target: "scheduler",
                                "Evicted {}:{} (priority {}) for priority {}",
                                evicted.kind, evicted.target_id, evicted.priority, item.priority
                            );
                        }
                        None => {
                            let max_queue = state.config.max_queue;
                            drop(state);
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                            self.reporter().warning(
                                &format!(
                                    "queue full ({}), dropped {}:{} priority {}",
                                    max_queue, item.kind, item.target_id, item.priority
                                ),
                                "submit",
                            );
                            return SubmitOutcome::Dropped(DropReason::QueueFull);
                        }
                    }
                }

                state.queue.push(item);
                return SubmitOutcome::Queued;
            }
        };

        self.counters.immediate.fetch_add(1, Ordering::Relaxed);
        self.dispatch(&flushed);
        SubmitOutcome::Dispatched
    }

    /// Submit with the immediate flag forced on
    pub fn submit_immediate(&self, item: WorkItem) -> SubmitOutcome {
        self.submit(item.immediate(true))
    }

    pub fn submit_batch(&self, items: impl IntoIterator<Item = WorkItem>) -> Vec<SubmitOutcome> {
        items.into_iter().map(|item| self.submit(item)).collect()
    }

    /// Run one scheduling tick now
    pub fn tick(&self) -> usize {
        self.tick_at(Instant::now())
    }

    /// Select and dispatch one batch as of `now`; returns items dispatched
    pub fn tick_at(&self, now: Instant) -> usize {
        let (batch, frame_cap, budget) = {
            let mut state = self.state.lock();
            if state.paused || state.shut_down {
                return 0;
            }
            if state.skip_next_tick {
                state.skip_next_tick = false;
                self.counters.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
            self.counters.ticks.fetch_add(1, Ordering::Relaxed);
            if let Some(prev) = state.last_tick_at {
                let spacing = now.saturating_duration_since(prev).as_secs_f64() * 1000.0;
                state.tick_spacing_ms.push(spacing);
            }
            state.last_tick_at = Some(now);
            if state.queue.is_empty() {
                state.last_tick_wall = Duration::ZERO;
                return 0;
            }

            let selected = state.select(now);
            if selected.is_empty() {
                state.last_tick_wall = Duration::ZERO;
                return 0;
            }
            let mut picked = vec![false; state.queue.len()];
            for &i in &selected {
                picked[i] = true;
            }
            let mut batch: Vec<WorkItem> = selected.iter().map(|&i| state.queue[i].clone()).collect();
            let mut idx = 0;
            state.queue.retain(|_| {
                let keep = !picked[idx];
                idx += 1;
                keep
            });

            if state.config.coalescing {
                let merged = coalesce_batch(&mut batch);
                SchedulerCounters::add(&self.counters.coalesced, merged as u64);
            }
            for item in &batch {
                state
                    .last_dispatched
                    .insert((item.kind, item.target_id.clone()), (item.payload.clone(), now));
            }
            (batch, state.config.frame_cap, state.config.frame_budget())
        };

        let started = std::time::Instant::now();
        self.dispatch(&batch);
        let wall = started.elapsed();

        if batch.len() > 1 {
            self.events
                .emit(SchedulerEvent::BatchUpdateRequired(batch.clone()));
        }

        let mut state = self.state.lock();
        state.last_tick_wall = wall;
        if frame_cap && wall > budget {
            state.skip_next_tick = true;
            crate::log_scheduler!(tracing::Level::DEBUG, "Tick took {:?} (budget {:?}), skipping next", wall, budget);
        }
        batch.len()
    }

    /// Deliver items to their sinks in order, timing each
    fn dispatch(&self, items: &[WorkItem]) {
        if items.is_empty() {
            return;
        }
        let mut timings = Vec::with_capacity(items.len());
        for item in items {
            let sink = self
                .sinks
                .read()
                .get(&(item.kind, item.target_id.clone()))
                .cloned();
            let started = std::time::Instant::now();
            match sink {
                Some(sink) => {
                    if catch_unwind(AssertUnwindSafe(|| sink(item))).is_err() {
                        tracing::error!(target: "scheduler", "Sink {}:{} panicked", item.kind, item.target_id);
                        self.reporter().error(
                            &format!("sink {}:{} panicked", item.kind, item.target_id),
                            "dispatch",
                        );
                    }
                }
                None => self
                    .events
                    .emit(SchedulerEvent::UpdateRequired(item.clone())),
            }
            timings.push((item.kind, started.elapsed().as_secs_f64() * 1000.0));
        }
        SchedulerCounters::add(&self.counters.dispatched, items.len() as u64);

        let mut state = self.state.lock();
        for (kind, ms) in timings {
            state.dispatch_ms.push(ms);
            let stats = &mut state.kind_stats[kind.index()];
            stats.dispatched += 1;
            stats.total_ms += ms;
            stats.max_ms = stats.max_ms.max(ms);
        }
    }

    /// Feed the latest metrics sample into tuning
    pub fn observe_metrics(&self, snapshot: &MetricsSnapshot) {
        let mut state = self.state.lock();
        state.cpu = snapshot.cpu_usage;
        state.process_memory = snapshot.process_memory;
    }

    pub fn tune(&self) {
        self.tune_at(Instant::now());
    }

    /// One adaptive tuning cycle
    ///
    /// Slow dispatch or high CPU stretches every kind interval; fast
    /// dispatch with a mostly empty queue tightens them. High CPU also
    /// stretches the tick, which relaxes back to its base once CPU drops.
    pub fn tune_at(&self, _now: Instant) {
        let mut warnings = Vec::new();
        let shed = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            let avg = state.dispatch_ms.average();
            let have_samples = !state.dispatch_ms.is_empty();
            let fill = state.queue_fill();
            let cpu_high = state.cpu > state.config.cpu_threshold;

            if avg > SLOW_DISPATCH_MS || cpu_high {
                for kind in UpdateKind::ALL {
                    let (_, hi) = kind.interval_bounds();
                    let current = state.kinds[kind.index()].interval;
                    if current < hi {
                        state.kinds[kind.index()].interval = current.mul_f64(SLOWDOWN_FACTOR).min(hi);
                    }
                }
                tracing::debug!(target: "scheduler", "Intervals stretched (avg {:.2} ms, cpu {:.1}%)", avg, state.cpu);
            } else if have_samples && avg < FAST_DISPATCH_MS && fill < SPEEDUP_QUEUE_FILL {
                for kind in UpdateKind::ALL {
                    let (lo, _) = kind.interval_bounds();
                    let current = state.kinds[kind.index()].interval;
                    if current > lo {
                        state.kinds[kind.index()].interval = current.mul_f64(SPEEDUP_FACTOR).max(lo);
                    }
                }
            }

            let base = state.config.tick_interval;
            if cpu_high {
                state.tick_interval = state
                    .tick_interval
                    .mul_f64(TICK_BACKOFF)
                    .min(MAX_TICK_INTERVAL.max(base));
            } else if state.tick_interval > base {
                state.tick_interval = state.tick_interval.div_f64(TICK_BACKOFF).max(base);
            }

            let mut shed = 0;
            if state.process_memory > state.config.memory_threshold {
                let before = state.queue.len();
                state.queue.retain(|q| q.priority >= SHED_PRIORITY);
                shed = before - state.queue.len();
            }

            let fill = state.queue_fill();
            if fill > WARN_QUEUE_FILL {
                warnings.push(format!("queue {:.0}% full", fill * 100.0));
            }
            if avg > WARN_DISPATCH_MS {
                warnings.push(format!("average dispatch time {:.1} ms", avg));
            }
            shed
        };

        if shed > 0 {
            SchedulerCounters::add(&self.counters.dropped, shed as u64);
            tracing::warn!(target: "scheduler", "Memory pressure: shed {} low-priority items", shed);
        }
        for warning in warnings {
            tracing::warn!(target: "scheduler", "Performance warning: {}", warning);
            self.events.emit(SchedulerEvent::PerformanceWarning(warning));
        }
    }

    pub fn hygiene(&self) -> usize {
        self.hygiene_at(Instant::now())
    }

    /// Drop stale low-priority items and duplicate coalescing items
    pub fn hygiene_at(&self, now: Instant) -> usize {
        let (stale, duplicates) = {
            let mut state = self.state.lock();
            let before = state.queue.len();
            state.queue.retain(|q| {
                !(q.priority < STALE_PRIORITY && now.saturating_duration_since(q.enqueued_at) > STALE_AGE)
            });
            let stale = before - state.queue.len();

            let mut newest: HashMap<(UpdateKind, String), (Instant, u64)> = HashMap::new();
            for q in state.queue.iter().filter(|q| q.coalescing) {
                let entry = newest
                    .entry((q.kind, q.target_id.clone()))
                    .or_insert((q.enqueued_at, q.seq));
                if (q.enqueued_at, q.seq) > *entry {
                    *entry = (q.enqueued_at, q.seq);
                }
            }
            let before = state.queue.len();
            state.queue.retain(|q| {
                !q.coalescing
                    || newest
                        .get(&(q.kind, q.target_id.clone()))
                        .map(|&(_, seq)| seq == q.seq)
                        .unwrap_or(true)
            });
            (stale, before - state.queue.len())
        };
        SchedulerCounters::add(&self.counters.dropped, stale as u64);
        SchedulerCounters::add(&self.counters.coalesced, duplicates as u64);
        if stale + duplicates > 0 {
            crate::log_scheduler!(tracing::Level::DEBUG, "Hygiene removed {} stale and {} duplicate items", stale, duplicates);
        }
        stale + duplicates
    }

    /// Set a kind's minimum interval; not clamped to tuning bounds
    pub fn set_interval(&self, kind: UpdateKind, ms: u64) {
        self.state.lock().kinds[kind.index()].interval = Duration::from_millis(ms);
    }

    /// Change a kind's strategy; `false` if refused
    ///
    /// Error always stays Immediate.
    pub fn set_strategy(&self, kind: UpdateKind, strategy: Strategy) -> bool {
        if kind == UpdateKind::Error && strategy != Strategy::Immediate {
            tracing::warn!(target: "scheduler", "Error updates are always immediate, ignoring {}", strategy);
            return false;
        }
        self.state.lock().kinds[kind.index()].strategy = strategy;
        self.events
            .emit(SchedulerEvent::StrategyChanged { kind, strategy });
        true
    }

    pub fn set_max_batch(&self, n: usize) {
        self.state.lock().config.max_batch = n.max(1);
    }

    /// Change queue capacity, shedding lowest-priority items that no longer fit
    pub fn set_max_queue(&self, n: usize) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let n = n.max(1);
            state.config.max_queue = n;
            let mut removed = 0;
            while state.queue.len() > n {
                let Some(i) = state
                    .queue
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, q)| (q.priority, q.enqueued_at, q.seq))
                    .map(|(i, _)| i)
                else {
                    break;
                };
                state.queue.remove(i);
                removed += 1;
            }
            removed
        };
        SchedulerCounters::add(&self.counters.dropped, removed as u64);
        removed
    }

    /// Enable or disable a kind; disabling drops its queued items
    pub fn enable_kind(&self, kind: UpdateKind, enabled: bool) {
        let removed = {
            let mut state = self.state.lock();
            state.kinds[kind.index()].enabled = enabled;
            if enabled {
                0
            } else {
                let before = state.queue.len();
                state.queue.retain(|q| q.kind != kind);
                before - state.queue.len()
            }
        };
        SchedulerCounters::add(&self.counters.dropped, removed as u64);
    }

    pub fn is_enabled(&self, kind: UpdateKind) -> bool {
        self.state.lock().settings(kind).enabled
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Drop every queued item
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.queue.len();
        state.queue.clear();
        n
    }

    /// Register the sink for a pair, replacing any previous one
    pub fn register_sink<F>(&self, kind: UpdateKind, target_id: &str, f: F)
    where
        F: Fn(&WorkItem) + Send + Sync + 'static,
    {
        self.sinks
            .write()
            .insert((kind, target_id.to_string()), Arc::new(f));
    }

    pub fn unregister_sink(&self, kind: UpdateKind, target_id: &str) -> bool {
        self.sinks
            .write()
            .remove(&(kind, target_id.to_string()))
            .is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn tick_interval(&self) -> Duration {
        self.state.lock().tick_interval
    }

    pub fn interval(&self, kind: UpdateKind) -> Duration {
        self.state.lock().settings(kind).interval
    }

    pub fn strategy(&self, kind: UpdateKind) -> Strategy {
        self.state.lock().settings(kind).strategy
    }

    pub fn cached_payload(&self, key: &str) -> Option<Bytes> {
        self.cache.get(key)
    }

    pub fn cache_payload(&self, key: &str, payload: Bytes) -> bool {
        self.cache.put(key, payload)
    }

    /// Cached payload for `key`, computing and caching it on a miss
    pub fn payload_or_compute<F>(&self, key: &str, compute: F) -> Bytes
    where
        F: FnOnce() -> Bytes,
    {
        self.cache.get_or_insert_with(key, compute)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn subscribe(&self) -> Subscription<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        let load = SchedulerCounters::get;
        let spacing = state.tick_spacing_ms.average();
        SchedulerStats {
            submitted: load(&self.counters.submitted),
            dispatched: load(&self.counters.dispatched),
            coalesced: load(&self.counters.coalesced),
            dropped: load(&self.counters.dropped),
            evicted: load(&self.counters.evicted),
            suppressed: load(&self.counters.suppressed),
            immediate: load(&self.counters.immediate),
            ticks: load(&self.counters.ticks),
            skipped_ticks: load(&self.counters.skipped_ticks),
            pending: state.queue.len(),
            max_queue: state.config.max_queue,
            avg_dispatch_ms: state.dispatch_ms.average(),
            achieved_fps: if spacing > 0.0 { 1000.0 / spacing } else { 0.0 },
            tick_interval_ms: state.tick_interval.as_secs_f64() * 1000.0,
            paused: state.paused,
            kinds: UpdateKind::ALL
                .iter()
                .map(|k| (*k, state.kind_stats[k.index()]))
                .collect(),
        }
    }

    /// Human-readable tuning hints from current statistics
    pub fn suggestions(&self) -> Vec<String> {
        let stats = self.stats();
        let (cpu, target_fps, adaptive, realtime, stats_strategy) = {
            let state = self.state.lock();
            (
                state.cpu,
                state.config.target_fps,
                state.config.adaptive_tuning,
                state.settings(UpdateKind::Realtime).strategy,
                state.settings(UpdateKind::Stats).strategy,
            )
        };

        let mut out = Vec::new();
        if stats.avg_dispatch_ms > 30.0 {
            out.push(format!(
                "Average update takes {:.1} ms; simplify sink work or raise intervals",
                stats.avg_dispatch_ms
            ));
        }
        if stats.pending as f64 > 0.7 * stats.max_queue as f64 {
            out.push(format!(
                "Queue holds {} of {} items; raise max_batch or lower submission rate",
                stats.pending, stats.max_queue
            ));
        }
        if stats.submitted > 0 && stats.dropped as f64 > 0.05 * stats.submitted as f64 {
            out.push(format!(
                "{} of {} submissions dropped; raise max_queue",
                stats.dropped, stats.submitted
            ));
        }
        if cpu > 70.0 {
            out.push(format!("CPU at {:.1}%; consider longer update intervals", cpu));
        }
        if stats.achieved_fps > 0.0 && stats.achieved_fps < 0.8 * f64::from(target_fps) {
            out.push(format!(
                "Achieved {:.1} fps against a {} fps target",
                stats.achieved_fps, target_fps
            ));
        }
        if !adaptive {
            out.push("Adaptive tuning is disabled".to_string());
        }
        if realtime != Strategy::Immediate {
            out.push(format!("Realtime updates use {} strategy; immediate is recommended", realtime));
        }
        if stats_strategy == Strategy::Immediate {
            out.push("Stats updates are immediate; batched is recommended".to_string());
        }
        if out.is_empty() {
            out.push("Update performance within targets".to_string());
        }
        out
    }

    /// Human-readable diagnostic block
    pub fn report(&self) -> String {
        let stats = self.stats();
        let state = self.state.lock();
        let mut out = String::from("Scheduler:\n");
        out.push_str(&format!(
            "  pending {}/{} tick {:.1} ms fps {:.1} paused {}\n",
            stats.pending, stats.max_queue, stats.tick_interval_ms, stats.achieved_fps, stats.paused
        ));
        out.push_str(&format!(
            "  submitted {} dispatched {} coalesced {} dropped {} evicted {} suppressed {} immediate {}\n",
            stats.submitted,
            stats.dispatched,
            stats.coalesced,
            stats.dropped,
            stats.evicted,
            stats.suppressed,
            stats.immediate
        ));
        out.push_str(&format!("  avg dispatch {:.3} ms\n", stats.avg_dispatch_ms));
        for kind in UpdateKind::ALL {
            let settings = state.settings(kind);
            let ks = &stats.kinds[&kind];
            out.push_str(&format!(
                "  {:<10} {:>5} ms {:<9} {} dispatched {} avg {:.3} ms\n",
                kind.name(),
                settings.interval.as_millis(),
                settings.strategy.to_string(),
                if settings.enabled { "on " } else { "off" },
                ks.dispatched,
                ks.avg_ms()
            ));
        }
        out
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let state = self.state.lock();
        let mut seen = std::collections::HashSet::new();
        for q in state.queue.iter().filter(|q| q.coalescing && state.config.coalescing) {
            assert!(
                seen.insert((q.kind, q.target_id.clone())),
                "two coalescing items for {}:{}",
                q.kind,
                q.target_id
            );
        }
        assert!(state.queue.len() <= state.config.max_queue);
    }
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        if let Some(timers) = self.timers.get_mut().take() {
            timers.stop();
        }
    }
}

/// Merge coalescing items of the same pair, keeping the latest payload
/// at the earliest position; returns the number merged away
fn coalesce_batch(batch: &mut Vec<WorkItem>) -> usize {
    let mut first: HashMap<(UpdateKind, String), usize> = HashMap::new();
    let mut keep = vec![true; batch.len()];
    for i in 0..batch.len() {
        if !batch[i].coalescing {
            continue;
        }
        let key = (batch[i].kind, batch[i].target_id.clone());
        match first.get(&key) {
            Some(&j) => {
                let later = batch[i].clone();
                batch[j].payload = later.payload;
                batch[j].enqueued_at = later.enqueued_at;
                keep[i] = false;
            }
            None => {
                first.insert(key, i);
            }
        }
    }
    let merged = keep.iter().filter(|k| !**k).count();
    let mut idx = 0;
    batch.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NamedEvent;
    use crate::fault::{ReportFault, Severity};
    use crate::test_utils::{snapshot, RecordingReporter, RecordingSink};
    use proptest::prelude::*;
    use super::Strategy;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn item(kind: UpdateKind, target: &str, payload: &'static [u8], at: Instant) -> WorkItem {
        WorkItem::new(kind, target, Bytes::from_static(payload)).at(at)
    }

    fn with_reporter(config: SchedulerConfig) -> (UpdateScheduler, Arc<RecordingReporter>, Arc<dyn ReportFault>) {
        let s = UpdateScheduler::new(config);
        let recorder = Arc::new(RecordingReporter::default());
        let sink: Arc<dyn ReportFault> = recorder.clone();
        s.set_fault_reporter(FaultReporter::new("scheduler", &sink));
        (s, recorder, sink)
    }

    #[test]
    fn test_coalesced_items_dispatch_once_with_latest_payload() {
        let s = UpdateScheduler::default();
        let sink = RecordingSink::default();
        sink.attach(&s, UpdateKind::Chart, "g1");

        let t0 = Instant::now();
        assert_eq!(s.submit(item(UpdateKind::Chart, "g1", b"A", t0)), SubmitOutcome::Queued);
        assert_eq!(
            s.submit(item(UpdateKind::Chart, "g1", b"B", t0 + ms(5))),
            SubmitOutcome::Coalesced
        );
        assert_eq!(s.pending_count(), 1);

        assert_eq!(s.tick_at(t0 + ms(199)), 0);
        assert_eq!(s.tick_at(t0 + ms(200)), 1);
        assert_eq!(sink.payloads(), vec![Bytes::from_static(b"B")]);
        assert_eq!(s.stats().coalesced, 1);
        s.check_invariants();
    }

    #[test]
    fn test_full_queue_evicts_oldest_lower_priority() {
        let config = SchedulerConfig {
            max_queue: 3,
            ..SchedulerConfig::default()
        };
        let (s, recorder, _sink) = with_reporter(config);
        let t0 = Instant::now();
        for (i, target) in ["a", "b", "c"].iter().enumerate() {
            let it = item(UpdateKind::Status, target, b"x", t0 + ms(i as u64)).priority(10);
            assert_eq!(s.submit(it), SubmitOutcome::Queued);
        }
        let high = item(UpdateKind::Status, "d", b"x", t0 + ms(3)).priority(50);
        assert_eq!(s.submit(high), SubmitOutcome::Queued);
        assert_eq!(s.pending_count(), 3);
        assert_eq!(s.stats().evicted, 1);
        {
            let state = s.state.lock();
            let targets: Vec<&str> = state.queue.iter().map(|q| q.target_id.as_str()).collect();
            assert!(!targets.contains(&"a"));
            assert!(targets.contains(&"d"));
        }

        let low = item(UpdateKind::Status, "e", b"x", t0 + ms(4)).priority(10);
        assert_eq!(s.submit(low), SubmitOutcome::Dropped(DropReason::QueueFull));
        assert_eq!(recorder.count_at(Severity::Warning), 1);

        // Ties are rejected
        let tie = item(UpdateKind::Status, "f", b"x", t0 + ms(5)).priority(10);
        assert_eq!(s.submit(tie), SubmitOutcome::Dropped(DropReason::QueueFull));
        s.check_invariants();
    }

    #[test]
    fn test_high_cpu_slows_tick_and_intervals() {
        let s = UpdateScheduler::default();
        let base_tick = s.tick_interval();
        let base: Vec<Duration> = UpdateKind::ALL.iter().map(|k| s.interval(*k)).collect();

        s.observe_metrics(&snapshot(90.0, 0));
        s.tune_at(Instant::now());

        assert!(s.tick_interval() >= base_tick.mul_f64(1.5));
        for (kind, before) in UpdateKind::ALL.iter().zip(base) {
            let (_, hi) = kind.interval_bounds();
            let now = s.interval(*kind);
            assert!(now >= before.mul_f64(1.2).min(hi), "{} {:?} -> {:?}", kind, before, now);
            assert!(now <= hi.max(before));
        }

        // Tick relaxes back to base once CPU drops
        s.observe_metrics(&snapshot(10.0, 0));
        for _ in 0..5 {
            s.tune_at(Instant::now());
        }
        assert_eq!(s.tick_interval(), base_tick);
    }

    #[test]
    fn test_tick_interval_capped() {
        let s = UpdateScheduler::default();
        s.observe_metrics(&snapshot(95.0, 0));
        for _ in 0..20 {
            s.tune_at(Instant::now());
        }
        assert_eq!(s.tick_interval(), MAX_TICK_INTERVAL);
        assert_eq!(s.interval(UpdateKind::Progress), ms(200));
        assert_eq!(s.interval(UpdateKind::Error), Duration::ZERO);
    }

    #[test]
    fn test_fast_dispatch_tightens_intervals_to_floor() {
        let s = UpdateScheduler::default();
        s.register_sink(UpdateKind::Stats, "s", |_| {});
        let t0 = Instant::now();
        s.submit(item(UpdateKind::Stats, "s", b"1", t0));
        assert_eq!(s.tick_at(t0 + ms(500)), 1);

        for _ in 0..40 {
            s.tune_at(t0);
        }
        assert_eq!(s.interval(UpdateKind::Stats), ms(50));
        assert_eq!(s.interval(UpdateKind::Realtime), ms(16));
        assert_eq!(s.interval(UpdateKind::Progress), ms(30));
    }

    #[test]
    fn test_immediate_flushes_queued_pair_first() {
        let s = UpdateScheduler::default();
        let sink = RecordingSink::default();
        sink.attach(&s, UpdateKind::Status, "bar");

        let t0 = Instant::now();
        s.submit(item(UpdateKind::Status, "bar", b"queued", t0));
        let outcome = s.submit_immediate(item(UpdateKind::Status, "bar", b"now", t0 + ms(1)));
        assert_eq!(outcome, SubmitOutcome::Dispatched);
        assert_eq!(
            sink.payloads(),
            vec![Bytes::from_static(b"queued"), Bytes::from_static(b"now")]
        );
        assert_eq!(s.pending_count(), 0);
        let stats = s.stats();
        assert_eq!((stats.immediate, stats.dispatched), (1, 2));
    }

    #[test]
    fn test_error_kind_always_immediate() {
        let s = UpdateScheduler::default();
        let events = s.subscribe();
        assert!(!s.set_strategy(UpdateKind::Error, Strategy::Batched));
        assert_eq!(s.strategy(UpdateKind::Error), Strategy::Immediate);

        let outcome = s.submit(WorkItem::new(UpdateKind::Error, "banner", "disk full"));
        assert_eq!(outcome, SubmitOutcome::Dispatched);
        let names: Vec<_> = events.drain().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["update_required"]);

        assert!(s.set_strategy(UpdateKind::Log, Strategy::Deferred));
        assert_eq!(events.try_recv().map(|e| e.name()), Some("strategy_changed"));
    }

    #[test]
    fn test_duplicate_payload_suppressed_within_interval() {
        let s = UpdateScheduler::default();
        s.register_sink(UpdateKind::Status, "s", |_| {});
        let t0 = Instant::now();
        s.submit(item(UpdateKind::Status, "s", b"same", t0));
        assert_eq!(s.tick_at(t0 + ms(100)), 1);

        assert_eq!(
            s.submit(item(UpdateKind::Status, "s", b"same", t0 + ms(150))),
            SubmitOutcome::Suppressed
        );
        assert_eq!(
            s.submit(item(UpdateKind::Status, "s", b"other", t0 + ms(150))),
            SubmitOutcome::Queued
        );
        s.clear();
        assert_eq!(
            s.submit(item(UpdateKind::Status, "s", b"same", t0 + ms(250))),
            SubmitOutcome::Queued
        );
        assert_eq!(s.stats().suppressed, 1);
    }

    #[test]
    fn test_disabled_kind_drops() {
        let s = UpdateScheduler::default();
        let t0 = Instant::now();
        s.submit(item(UpdateKind::Log, "console", b"a", t0));
        s.submit(item(UpdateKind::Status, "s", b"a", t0));
        s.enable_kind(UpdateKind::Log, false);
        assert!(!s.is_enabled(UpdateKind::Log));
        assert_eq!(s.pending_count(), 1);

        assert_eq!(
            s.submit(item(UpdateKind::Log, "console", b"b", t0)),
            SubmitOutcome::Dropped(DropReason::Disabled)
        );
        assert_eq!(s.stats().dropped, 2);

        s.enable_kind(UpdateKind::Log, true);
        assert_eq!(s.submit(item(UpdateKind::Log, "console", b"c", t0)), SubmitOutcome::Queued);
    }

    #[test]
    fn test_priority_across_pairs_fifo_within_pair() {
        let s = UpdateScheduler::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for target in ["a", "b"] {
            let order = order.clone();
            s.register_sink(UpdateKind::Log, target, move |it| {
                order.lock().push(it.payload.clone());
            });
        }

        let t0 = Instant::now();
        s.submit(item(UpdateKind::Log, "a", b"a1", t0).priority(10).coalescing(false));
        s.submit(item(UpdateKind::Log, "a", b"a2", t0).priority(90).coalescing(false));
        s.submit(item(UpdateKind::Log, "b", b"b1", t0).priority(50).coalescing(false));

        assert_eq!(s.tick_at(t0 + ms(100)), 3);
        let seen: Vec<Bytes> = order.lock().clone();
        assert_eq!(
            seen,
            vec![
                Bytes::from_static(b"b1"),
                Bytes::from_static(b"a1"),
                Bytes::from_static(b"a2")
            ]
        );
    }

    #[test]
    fn test_deferred_fills_leftover_capacity() {
        let s = UpdateScheduler::default();
        s.set_max_batch(2);
        let t0 = Instant::now();
        s.submit(item(UpdateKind::Table, "grid", b"t", t0).priority(90));
        s.submit(item(UpdateKind::Status, "s1", b"1", t0));
        s.submit(item(UpdateKind::Status, "s2", b"2", t0));

        let events = s.subscribe();
        assert_eq!(s.tick_at(t0 + ms(300)), 2);
        match events.try_recv() {
            Some(SchedulerEvent::UpdateRequired(first)) => assert_eq!(first.kind, UpdateKind::Status),
            other => panic!("unexpected {:?}", other.map(|e| e.name())),
        }
        assert_eq!(s.tick_at(t0 + ms(320)), 1);
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn test_batch_event_without_sinks() {
        let s = UpdateScheduler::default();
        let events = s.subscribe();
        let t0 = Instant::now();
        s.submit_batch(vec![
            item(UpdateKind::Status, "a", b"1", t0),
            item(UpdateKind::Status, "b", b"2", t0),
        ]);
        assert_eq!(s.tick_at(t0 + ms(100)), 2);
        let names: Vec<_> = events.drain().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["update_required", "update_required", "batch_update_required"]);
    }

    #[test]
    fn test_hygiene_removes_stale_low_priority() {
        let s = UpdateScheduler::default();
        s.pause();
        let t0 = Instant::now();
        s.submit(item(UpdateKind::Stats, "old", b"x", t0).priority(20));
        s.submit(item(UpdateKind::Stats, "keep", b"x", t0).priority(60));
        s.submit(item(UpdateKind::Stats, "fresh", b"x", t0 + ms(4_000)).priority(20));

        assert_eq!(s.hygiene_at(t0 + ms(5_500)), 1);
        assert_eq!(s.pending_count(), 2);
        assert_eq!(s.tick_at(t0 + ms(6_000)), 0);
        s.resume();
        assert_eq!(s.tick_at(t0 + ms(6_000)), 2);
    }

    #[test]
    fn test_frame_cap_skips_next_tick() {
        let config = SchedulerConfig {
            target_fps: 100,
            ..SchedulerConfig::default()
        };
        let s = UpdateScheduler::new(config);
        s.register_sink(UpdateKind::Status, "slow", |_| {
            std::thread::sleep(Duration::from_millis(15));
        });
        let t0 = Instant::now();
        s.submit(item(UpdateKind::Status, "slow", b"1", t0));
        assert_eq!(s.tick_at(t0 + ms(100)), 1);

        s.submit(item(UpdateKind::Status, "slow", b"2", t0));
        assert_eq!(s.tick_at(t0 + ms(120)), 0);
        assert_eq!(s.stats().skipped_ticks, 1);
        assert_eq!(s.tick_at(t0 + ms(140)), 1);
    }

    #[test]
    fn test_sink_panic_isolated() {
        let (s, recorder, _sink) = with_reporter(SchedulerConfig::default());
        s.register_sink(UpdateKind::Status, "bad", |_| panic!("render failed"));
        let good = RecordingSink::default();
        good.attach(&s, UpdateKind::Status, "good");

        let t0 = Instant::now();
        s.submit(item(UpdateKind::Status, "bad", b"1", t0).priority(90));
        s.submit(item(UpdateKind::Status, "good", b"2", t0));
        assert_eq!(s.tick_at(t0 + ms(100)), 2);
        assert_eq!(good.payloads().len(), 1);
        assert_eq!(recorder.count_at(Severity::Error), 1);
    }

    #[test]
    fn test_memory_pressure_sheds_low_priority() {
        let config = SchedulerConfig {
            memory_threshold: 1_000,
            ..SchedulerConfig::default()
        };
        let s = UpdateScheduler::new(config);
        let t0 = Instant::now();
        s.submit(item(UpdateKind::Status, "low", b"x", t0).priority(10));
        s.submit(item(UpdateKind::Status, "high", b"x", t0).priority(80));

        s.observe_metrics(&snapshot(5.0, 2_000));
        s.tune_at(t0);
        assert_eq!(s.pending_count(), 1);
        assert_eq!(s.stats().dropped, 1);
    }

    #[test]
    fn test_set_max_queue_trims_lowest_priority() {
        let s = UpdateScheduler::default();
        let t0 = Instant::now();
        for (target, priority) in [("a", 40), ("b", 10), ("c", 70)] {
            s.submit(item(UpdateKind::Status, target, b"x", t0).priority(priority));
        }
        assert_eq!(s.set_max_queue(2), 1);
        let state = s.state.lock();
        assert!(state.queue.iter().all(|q| q.target_id != "b"));
    }

    #[test]
    fn test_queue_fill_warning() {
        let config = SchedulerConfig {
            max_queue: 4,
            ..SchedulerConfig::default()
        };
        let s = UpdateScheduler::new(config);
        let events = s.subscribe();
        let t0 = Instant::now();
        for target in ["a", "b", "c", "d"] {
            s.submit(item(UpdateKind::Stats, target, b"x", t0));
        }
        s.tune_at(t0);
        let warnings: Vec<_> = events
            .drain()
            .into_iter()
            .filter(|e| e.name() == "performance_warning")
            .collect();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_payload_cache_accessors() {
        let s = UpdateScheduler::default();
        assert!(s.cached_payload("chart:g1").is_none());
        let v = s.payload_or_compute("chart:g1", || Bytes::from_static(b"svg"));
        assert_eq!(s.cached_payload("chart:g1"), Some(v));
        assert!(s.cache_payload("k", Bytes::from_static(b"v")));
        assert_eq!(s.cache_stats().entries, 2);
    }

    #[test]
    fn test_suggestions_and_report() {
        let s = UpdateScheduler::default();
        assert_eq!(s.suggestions(), vec!["Update performance within targets".to_string()]);

        s.set_strategy(UpdateKind::Stats, Strategy::Immediate);
        s.observe_metrics(&snapshot(75.0, 0));
        let hints = s.suggestions();
        assert!(hints.iter().any(|h| h.contains("CPU")));
        assert!(hints.iter().any(|h| h.starts_with("Stats updates")));

        let report = s.report();
        assert!(report.starts_with("Scheduler:"));
        assert!(report.contains("animation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_dispatch_and_shutdown() {
        let s = Arc::new(UpdateScheduler::default());
        let sink = RecordingSink::default();
        sink.attach(&s, UpdateKind::Status, "s");
        s.start().unwrap();
        s.start().unwrap();

        s.submit(WorkItem::new(UpdateKind::Status, "s", "hello"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.payloads(), vec![Bytes::from_static(b"hello")]);

        s.shutdown();
        s.shutdown();
        assert!(s.is_shut_down());
        assert_eq!(
            s.submit(WorkItem::new(UpdateKind::Status, "s", "late")),
            SubmitOutcome::Dropped(DropReason::ShutDown)
        );
        assert!(s.start().is_err());
    }

    #[test]
    fn test_concurrent_submitters() {
        let s = Arc::new(UpdateScheduler::default());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let s = s.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let target = format!("t{}-{}", t, i % 5);
                        s.submit(WorkItem::new(UpdateKind::Progress, target, format!("{}", i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.pending_count(), 20);
        assert_eq!(s.stats().submitted, 800);
        s.check_invariants();
    }

    proptest! {
        #[test]
        fn prop_one_coalescing_item_per_pair(ops in proptest::collection::vec((0usize..5, 0u8..4, 0u8..=100, any::<bool>(), 0u8..10), 1..120)) {
            let config = SchedulerConfig { max_queue: 16, ..SchedulerConfig::default() };
            let s = UpdateScheduler::new(config);
            let kinds = [UpdateKind::Status, UpdateKind::Chart, UpdateKind::Log, UpdateKind::Table, UpdateKind::Stats];
            let t0 = Instant::now();
            let mut clock = t0;

            for (kind, target, priority, coalescing, action) in ops {
                clock += ms(7);
                match action {
                    0 => { s.tick_at(clock); }
                    1 => { s.hygiene_at(clock); }
                    _ => {
                        let it = WorkItem::new(kinds[kind], format!("t{}", target), vec![priority])
                            .at(clock)
                            .priority(priority)
                            .coalescing(coalescing);
                        s.submit(it);
                    }
                }
                s.check_invariants();
            }
        }
    }
}
