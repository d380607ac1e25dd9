//! Byte-buffer pool
//!
//! One mutex guards the free lists and the in-use index; every public
//! operation holds it for a short lookup/insert plus counter update.
//! Region allocation and zeroing happen outside the lock.

use bytes::BytesMut;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio::time::Instant;

use super::{BufferId, BufferPoolEvent, BufferPoolStats, PoolConfig, PooledBuffer};
use crate::core::{EventBus, SizeClass, Subscription};
use crate::fault::FaultReporter;
use crate::infrastructure::TimerSet;
use crate::Result;

const HEALTHY_HIT_RATIO: f64 = 0.7;
const HEALTHY_IN_USE_FRACTION: f64 = 0.9;

#[derive(Debug)]
struct BufferRecord {
    id: BufferId,
    class: SizeClass,
    /// Present while parked on a free list
    data: Option<BytesMut>,
    capacity: usize,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    in_use: bool,
    owner: Option<ThreadId>,
}

impl BufferRecord {
    fn new(class: SizeClass, data: BytesMut, now: Instant) -> Self {
        Self {
            id: BufferId::next(),
            class,
            capacity: data.capacity(),
            data: Some(data),
            created_at: now,
            last_used: now,
            use_count: 0,
            in_use: false,
            owner: None,
        }
    }
}

struct PoolState {
    config: PoolConfig,
    free: [VecDeque<BufferRecord>; 4],
    in_use: HashMap<BufferId, BufferRecord>,
    held_bytes: usize,
    peak_bytes: usize,
    initialized: bool,
    shut_down: bool,
    last_health: bool,
}

/// Lock-free counters, updated under the pool lock
#[derive(Default)]
struct PoolCounters {
    acquired: CachePadded<AtomicU64>,
    released: CachePadded<AtomicU64>,
    hits: CachePadded<AtomicU64>,
    misses: CachePadded<AtomicU64>,
    destroyed: CachePadded<AtomicU64>,
    in_use: CachePadded<AtomicU64>,
    peak_in_use: CachePadded<AtomicU64>,
}

impl PoolCounters {
    fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Acquire);
        let total = hits + self.misses.load(Ordering::Acquire);
        if total == 0 {
            1.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Size-classed byte-buffer pool
pub struct BufferPool {
    state: Mutex<PoolState>,
    counters: PoolCounters,
    events: EventBus<BufferPoolEvent>,
    reporter: parking_lot::RwLock<FaultReporter>,
    timers: Mutex<Option<TimerSet>>,
}

impl BufferPool {
    /// Create an uninitialized pool; call [`initialize`](Self::initialize) before use
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                config: PoolConfig::default(),
                free: Default::default(),
                in_use: HashMap::new(),
                held_bytes: 0,
                peak_bytes: 0,
                initialized: false,
                shut_down: false,
                last_health: true,
            }),
            counters: PoolCounters::default(),
            events: EventBus::new(),
            reporter: parking_lot::RwLock::new(FaultReporter::detached("buffer_pool")),
            timers: Mutex::new(None),
        }
    }

    /// Create and initialize in one step
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        let pool = Self::new();
        pool.initialize(config)?;
        Ok(pool)
    }

    pub fn set_fault_reporter(&self, reporter: FaultReporter) {
        *self.reporter.write() = reporter;
    }

    fn reporter(&self) -> FaultReporter {
        self.reporter.read().clone()
    }

    /// Apply configuration and preallocate the initial buffers
    pub fn initialize(&self, config: PoolConfig) -> Result<()> {
        if config.max_pool_size < 4 {
            return Err(crate::SubstrateError::InvalidArgument(format!(
                "max_pool_size {} leaves no free-list capacity",
                config.max_pool_size
            )));
        }

        let classes: Vec<SizeClass> = config.classes.classes().collect();
        let per_class = config.initial_pool_size / classes.len().max(1);
        {
            let mut state = self.state.lock();
            if state.initialized {
                tracing::warn!(target: "buffer_pool", "Buffer pool already initialized");
                return Ok(());
            }
            state.config = config;
            state.initialized = true;
            state.shut_down = false;
        }

        for class in classes {
            self.preallocate(class, per_class);
        }

        tracing::info!(target: "buffer_pool", "Buffer pool initialized ({} buffers per class)", per_class);
        Ok(())
    }

    /// Start idle-cleanup and health timers
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut timers = self.timers.lock();
        if timers.is_some() {
            return Ok(());
        }
        let (cleanup_interval, stats_interval) = {
            let state = self.state.lock();
            if !state.initialized {
                return Err(crate::SubstrateError::NotInitialized("buffer pool"));
            }
            (state.config.cleanup_interval, state.config.stats_interval)
        };

        let mut set = TimerSet::new("buffer_pool")?;
        set.every(cleanup_interval, self, |pool| {
            if pool.auto_cleanup_enabled() {
                pool.cleanup_idle();
            }
            pool.check_memory_usage();
        });
        set.every(stats_interval, self, |pool| {
            pool.check_health();
            pool.events
                .emit(BufferPoolEvent::StatisticsUpdated(pool.stats()));
        });
        *timers = Some(set);
        Ok(())
    }

    /// Stop timers and drain free lists; idempotent
    ///
    /// Buffers still on loan stay indexed; releasing them afterwards
    /// destroys the region instead of pooling it.
    pub fn shutdown(&self) {
        if let Some(timers) = self.timers.lock().take() {
            timers.stop();
        }
        let drained = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.initialized = false;
            Self::drain_free_lists(&mut state, &self.counters)
        };
        tracing::info!(target: "buffer_pool", "Buffer pool shut down ({} free buffers released)", drained.len());
    }

    fn auto_cleanup_enabled(&self) -> bool {
        self.state.lock().config.enable_auto_cleanup
    }

    fn resolve_class(config: &PoolConfig, min_size: usize, hint: Option<SizeClass>) -> SizeClass {
        let natural = config.classes.classify(min_size);
        match hint {
            Some(hint) => match config.classes.capacity(hint) {
                Some(cap) if cap >= min_size => hint,
                _ => natural,
            },
            None => natural,
        }
    }

    /// Lend a buffer of at least `min_size` bytes
    ///
    /// `hint` selects a class explicitly; it is overridden when too small.
    /// Returns `None` for a zero size or an uninitialized pool.
    pub fn acquire(&self, min_size: usize, hint: Option<SizeClass>) -> Option<PooledBuffer> {
        if min_size == 0 {
            self.reporter()
                .warning("acquire called with zero size", "acquire");
            return None;
        }

        let now = Instant::now();
        let (class, region_size) = {
            let mut state = self.state.lock();
            if !state.initialized {
                drop(state);
                self.reporter()
                    .error("acquire on uninitialized buffer pool", "acquire");
                return None;
            }
            let class = Self::resolve_class(&state.config, min_size, hint);
            let reused = state.free[class.index()].pop_front();
            if let Some(record) = reused {
                return Some(self.lend(&mut state, record, min_size, now, true));
            }
            (class, state.config.classes.region_size(class, min_size))
        };

        // Miss: allocate outside the lock
        let data = BytesMut::with_capacity(region_size);
        let record = BufferRecord::new(class, data, now);

        let mut state = self.state.lock();
        if !state.initialized {
            drop(state);
            self.reporter()
                .error("buffer pool shut down during acquire", "acquire");
            return None;
        }
        state.held_bytes += record.capacity;
        state.peak_bytes = state.peak_bytes.max(state.held_bytes);
        Some(self.lend(&mut state, record, min_size, now, false))
    }

    fn lend(
        &self,
        state: &mut PoolState,
        mut record: BufferRecord,
        min_size: usize,
        now: Instant,
        hit: bool,
    ) -> PooledBuffer {
        let mut data = record.data.take().unwrap_or_default();
        if data.len() < min_size {
            data.resize(min_size, 0);
        }
        if data.capacity() != record.capacity {
            state.held_bytes = state.held_bytes.saturating_sub(record.capacity) + data.capacity();
            record.capacity = data.capacity();
            state.peak_bytes = state.peak_bytes.max(state.held_bytes);
        }

        record.in_use = true;
        record.last_used = now;
        record.use_count += 1;
        record.owner = Some(thread::current().id());

        let buffer = PooledBuffer::new(record.id, record.class, data);
        state.in_use.insert(record.id, record);

        if hit {
            self.counters.hits.fetch_add(1, Ordering::AcqRel);
        } else {
            self.counters.misses.fetch_add(1, Ordering::AcqRel);
        }
        self.counters.acquired.fetch_add(1, Ordering::AcqRel);
        let in_use = self.counters.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak_in_use.fetch_max(in_use, Ordering::AcqRel);

        buffer
    }

    /// Return a buffer to the pool
    ///
    /// Returns `false` (plus a Warning) if the buffer is not on loan,
    /// which makes a double release a no-op.
    pub fn release(&self, buffer: PooledBuffer) -> bool {
        let (id, class, mut data) = buffer.into_parts();

        // Security hygiene: zero before the region can be reused
        data.fill(0);
        data.clear();

        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(mut record) = state.in_use.remove(&id) else {
            drop(state);
            tracing::warn!(target: "buffer_pool", "Release of unknown buffer {}", id);
            self.reporter()
                .warning(&format!("release of unknown buffer {}", id), "release");
            return false;
        };

        if record.owner != Some(thread::current().id()) {
            tracing::trace!(target: "buffer_pool", "Buffer {} released from a different thread", id);
        }

        let capacity = data.capacity();
        state.held_bytes = state.held_bytes.saturating_sub(record.capacity) + capacity;
        state.peak_bytes = state.peak_bytes.max(state.held_bytes);
        record.capacity = capacity;
        record.in_use = false;
        record.owner = None;
        record.last_used = now;

        self.counters.released.fetch_add(1, Ordering::AcqRel);
        self.counters.in_use.fetch_sub(1, Ordering::AcqRel);

        let cap = state.config.free_list_cap();
        if !state.shut_down && state.free[class.index()].len() < cap {
            record.data = Some(data);
            state.free[class.index()].push_back(record);
        } else {
            state.held_bytes -= record.capacity.min(state.held_bytes);
            self.counters.destroyed.fetch_add(1, Ordering::AcqRel);
            drop(state);
            drop(data);
        }
        true
    }

    /// Create `count` buffers of `class` on its free list
    ///
    /// Stops at the free-list capacity. Returns the number created.
    pub fn preallocate(&self, class: SizeClass, count: usize) -> usize {
        let (region, room) = {
            let state = self.state.lock();
            if !state.initialized {
                return 0;
            }
            let Some(cap) = state.config.classes.capacity(class) else {
                return 0;
            };
            let room = state
                .config
                .free_list_cap()
                .saturating_sub(state.free[class.index()].len());
            (cap, room)
        };

        let wanted = count.min(room);
        if wanted < count {
            tracing::debug!(target: "buffer_pool", "Preallocation of {} {} buffers truncated to {}", count, class, wanted);
        }
        let now = Instant::now();
        let fresh: Vec<BufferRecord> = (0..wanted)
            .map(|_| BufferRecord::new(class, BytesMut::with_capacity(region), now))
            .collect();

        let mut state = self.state.lock();
        let cap = state.config.free_list_cap();
        let mut created = 0;
        for record in fresh {
            if state.free[class.index()].len() >= cap {
                break;
            }
            state.held_bytes += record.capacity;
            state.free[class.index()].push_back(record);
            created += 1;
        }
        state.peak_bytes = state.peak_bytes.max(state.held_bytes);
        created
    }

    /// Destroy free buffers idle longer than `max_idle_time`
    pub fn cleanup_idle(&self) -> usize {
        self.cleanup_idle_at(Instant::now())
    }

    pub fn cleanup_idle_at(&self, now: Instant) -> usize {
        let removed: Vec<BufferRecord> = {
            let mut state = self.state.lock();
            let max_idle = state.config.max_idle_time;
            let mut removed = Vec::new();
            for list in state.free.iter_mut() {
                let mut kept = VecDeque::with_capacity(list.len());
                for record in list.drain(..) {
                    if now.saturating_duration_since(record.last_used) > max_idle {
                        removed.push(record);
                    } else {
                        kept.push_back(record);
                    }
                }
                *list = kept;
            }
            let bytes: usize = removed.iter().map(|r| r.capacity).sum();
            state.held_bytes -= bytes.min(state.held_bytes);
            removed
        };
        self.counters
            .destroyed
            .fetch_add(removed.len() as u64, Ordering::AcqRel);
        if !removed.is_empty() {
            tracing::debug!(target: "buffer_pool", "Idle cleanup destroyed {} buffers", removed.len());
        }
        removed.len()
    }

    /// Destroy every free buffer; loaned buffers stay indexed
    pub fn force_cleanup(&self) -> usize {
        let drained = {
            let mut state = self.state.lock();
            Self::drain_free_lists(&mut state, &self.counters)
        };
        tracing::info!(target: "buffer_pool", "Forced cleanup destroyed {} buffers", drained.len());
        drained.len()
    }

    fn drain_free_lists(state: &mut PoolState, counters: &PoolCounters) -> Vec<BufferRecord> {
        let mut drained = Vec::new();
        for list in state.free.iter_mut() {
            drained.extend(list.drain(..));
        }
        let bytes: usize = drained.iter().map(|r| r.capacity).sum();
        state.held_bytes -= bytes.min(state.held_bytes);
        counters
            .destroyed
            .fetch_add(drained.len() as u64, Ordering::AcqRel);
        drained
    }

    /// Consistent counter snapshot
    pub fn stats(&self) -> BufferPoolStats {
        let state = self.state.lock();
        self.stats_locked(&state)
    }

    fn stats_locked(&self, state: &PoolState) -> BufferPoolStats {
        let mut free_depth = [0usize; 4];
        for (i, list) in state.free.iter().enumerate() {
            free_depth[i] = list.len();
        }
        let mut in_use_by_class = [0usize; 4];
        for record in state.in_use.values().filter(|r| r.in_use) {
            in_use_by_class[record.class.index()] += 1;
        }
        let max_use_count = state
            .free
            .iter()
            .flat_map(|l| l.iter())
            .chain(state.in_use.values())
            .map(|r| r.use_count)
            .max()
            .unwrap_or(0);
        BufferPoolStats {
            total_acquired: self.counters.acquired.load(Ordering::Acquire),
            total_released: self.counters.released.load(Ordering::Acquire),
            hits: self.counters.hits.load(Ordering::Acquire),
            misses: self.counters.misses.load(Ordering::Acquire),
            destroyed: self.counters.destroyed.load(Ordering::Acquire),
            current_in_use: self.counters.in_use.load(Ordering::Acquire),
            peak_in_use: self.counters.peak_in_use.load(Ordering::Acquire),
            held_bytes: state.held_bytes,
            peak_bytes: state.peak_bytes,
            hit_ratio: self.counters.hit_ratio(),
            free_depth,
            in_use_by_class,
            max_use_count,
            healthy: self.healthy_locked(state),
        }
    }

    pub fn available_count(&self, class: SizeClass) -> usize {
        self.state.lock().free[class.index()].len()
    }

    pub fn in_use_count(&self, class: SizeClass) -> usize {
        self.state
            .lock()
            .in_use
            .values()
            .filter(|r| r.class == class)
            .count()
    }

    /// Total bytes held across free lists and loans
    pub fn held_bytes(&self) -> usize {
        self.state.lock().held_bytes
    }

    /// Reset cumulative counters; peak restarts from the current loan count
    pub fn reset_statistics(&self) {
        let state = self.state.lock();
        for counter in [
            &self.counters.acquired,
            &self.counters.released,
            &self.counters.hits,
            &self.counters.misses,
            &self.counters.destroyed,
        ] {
            counter.store(0, Ordering::Release);
        }
        let in_use = self.counters.in_use.load(Ordering::Acquire);
        self.counters.peak_in_use.store(in_use, Ordering::Release);
        drop(state);
    }

    fn healthy_locked(&self, state: &PoolState) -> bool {
        let in_use = self.counters.in_use.load(Ordering::Acquire) as f64;
        state.held_bytes <= state.config.memory_threshold
            && self.counters.hit_ratio() >= HEALTHY_HIT_RATIO
            && in_use <= HEALTHY_IN_USE_FRACTION * state.config.max_pool_size as f64
    }

    pub fn is_healthy(&self) -> bool {
        let state = self.state.lock();
        self.healthy_locked(&state)
    }

    /// Re-evaluate health, emitting `pool_health_changed` on transitions
    pub fn check_health(&self) -> bool {
        let (healthy, changed) = {
            let mut state = self.state.lock();
            let healthy = self.healthy_locked(&state);
            let changed = healthy != state.last_health;
            state.last_health = healthy;
            (healthy, changed)
        };
        if changed {
            if healthy {
                tracing::info!(target: "buffer_pool", "Buffer pool healthy again");
            } else {
                tracing::warn!(target: "buffer_pool", "Buffer pool unhealthy");
            }
            self.events.emit(BufferPoolEvent::PoolHealthChanged(healthy));
        }
        healthy
    }

    /// Warn and run idle cleanup when held bytes exceed the threshold
    pub fn check_memory_usage(&self) -> bool {
        let (current, threshold) = {
            let state = self.state.lock();
            (state.held_bytes, state.config.memory_threshold)
        };
        if current <= threshold {
            return false;
        }
        tracing::warn!(target: "buffer_pool", "Buffer pool holds {} bytes (threshold {})", current, threshold);
        self.events
            .emit(BufferPoolEvent::MemoryUsageWarning { current, threshold });
        self.cleanup_idle();
        true
    }

    pub fn subscribe(&self) -> Subscription<BufferPoolEvent> {
        self.events.subscribe()
    }

    /// Human-readable diagnostic block
    pub fn report(&self) -> String {
        let stats = self.stats();
        let mut out = String::from("Buffer pool:\n");
        out.push_str(&format!(
            "  acquired {} released {} destroyed {}\n",
            stats.total_acquired, stats.total_released, stats.destroyed
        ));
        out.push_str(&format!(
            "  in use {} (peak {})\n",
            stats.current_in_use, stats.peak_in_use
        ));
        out.push_str(&format!(
            "  held bytes {} (peak {})\n",
            stats.held_bytes, stats.peak_bytes
        ));
        out.push_str(&format!(
            "  hit ratio {:.2} ({} hits, {} misses)\n",
            stats.hit_ratio, stats.hits, stats.misses
        ));
        for class in SizeClass::ALL {
            out.push_str(&format!(
                "  {:<6} free {} in use {}\n",
                class.name(),
                stats.free_depth[class.index()],
                stats.in_use_by_class[class.index()]
            ));
        }
        if let Some(age) = self.oldest_free_age() {
            out.push_str(&format!("  oldest free buffer {:.0?}\n", age));
        }
        out.push_str(&format!(
            "  max reuse {} healthy: {}\n",
            stats.max_use_count, stats.healthy
        ));
        out
    }

    /// Oldest record creation time, for idle diagnostics
    pub fn oldest_free_age(&self) -> Option<std::time::Duration> {
        let state = self.state.lock();
        let now = Instant::now();
        state
            .free
            .iter()
            .flat_map(|l| l.iter())
            .map(|r| now.saturating_duration_since(r.created_at))
            .max()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let state = self.state.lock();
        let mut seen = std::collections::HashSet::new();
        let mut bytes = 0usize;
        for (i, list) in state.free.iter().enumerate() {
            for record in list {
                assert_eq!(record.class.index(), i);
                assert!(!record.in_use);
                assert!(record.data.is_some());
                assert!(seen.insert(record.id), "buffer {} listed twice", record.id);
                bytes += record.capacity;
            }
        }
        for (id, record) in &state.in_use {
            assert_eq!(*id, record.id);
            assert!(record.in_use);
            assert!(record.data.is_none());
            assert!(seen.insert(*id), "buffer {} both free and in use", id);
            bytes += record.capacity;
        }
        assert_eq!(bytes, state.held_bytes);
        assert_eq!(
            state.in_use.len() as u64,
            self.counters.in_use.load(Ordering::Acquire)
        );
        assert!(
            self.counters.peak_in_use.load(Ordering::Acquire)
                >= self.counters.in_use.load(Ordering::Acquire)
        );
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Some(timers) = self.timers.get_mut().take() {
            timers.stop();
        }
    }
}
