//! Block allocator
//!
//! Blocks are indexed by address. A block is either on the free list of
//! its size class or in the in-use index, never both. Cumulative allocated
//! and freed byte tallies are kept so that
//! `allocated - freed == sum(in-use block sizes)` holds after every call.

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use std::any::TypeId;
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio::time::Instant;

use super::block::{Block, DEFAULT_ALIGN};
use super::object_pool::{ErasedPool, ObjectPool, ObjectPoolStats, Shared};
use super::{AllocatorConfig, AllocatorEvent, AllocatorStats};
use crate::core::{EventBus, SizeClass, Subscription};
use crate::fault::FaultReporter;
use crate::infrastructure::TimerSet;
use crate::Result;

const HEALTHY_HIT_RATIO: f64 = 0.7;

#[derive(Debug)]
struct BlockRecord {
    block: Block,
    /// Bytes asked for by the current holder
    requested: usize,
    class: SizeClass,
    created_at: Instant,
    last_used: Instant,
    ref_count: u32,
    owner: Option<ThreadId>,
}

struct AllocState {
    config: AllocatorConfig,
    free: [VecDeque<BlockRecord>; 4],
    in_use: HashMap<usize, BlockRecord>,
    free_bytes: usize,
    peak_bytes: u64,
    peak_allocations: u64,
    shut_down: bool,
    last_health: bool,
}

impl AllocState {
    fn fragmentation(&self, in_use_bytes: u64) -> f64 {
        let total = in_use_bytes as f64 + self.free_bytes as f64;
        if total == 0.0 {
            0.0
        } else {
            1.0 - in_use_bytes as f64 / total
        }
    }
}

#[derive(Default)]
struct AllocCounters {
    allocated: CachePadded<AtomicU64>,
    freed: CachePadded<AtomicU64>,
    allocations: CachePadded<AtomicU64>,
    deallocations: CachePadded<AtomicU64>,
    hits: CachePadded<AtomicU64>,
    misses: CachePadded<AtomicU64>,
}

impl AllocCounters {
    fn in_use_bytes(&self) -> u64 {
        self.allocated
            .load(Ordering::Acquire)
            .saturating_sub(self.freed.load(Ordering::Acquire))
    }

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

/// Size-classed raw block allocator with typed object pools
pub struct BlockAllocator {
    state: Mutex<AllocState>,
    counters: AllocCounters,
    pools: Mutex<HashMap<TypeId, Arc<dyn ErasedPool>>>,
    events: EventBus<AllocatorEvent>,
    reporter: RwLock<FaultReporter>,
    timers: Mutex<Option<TimerSet>>,
}

impl BlockAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            state: Mutex::new(AllocState {
                config,
                free: Default::default(),
                in_use: HashMap::new(),
                free_bytes: 0,
                peak_bytes: 0,
                peak_allocations: 0,
                shut_down: false,
                last_health: true,
            }),
            counters: AllocCounters::default(),
            pools: Mutex::new(HashMap::new()),
            events: EventBus::new(),
            reporter: RwLock::new(FaultReporter::detached("allocator")),
            timers: Mutex::new(None),
        }
    }

    pub fn set_fault_reporter(&self, reporter: FaultReporter) {
        *self.reporter.write() = reporter;
    }

    fn reporter(&self) -> FaultReporter {
        self.reporter.read().clone()
    }

    /// Start cleanup and health timers
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut timers = self.timers.lock();
        if timers.is_some() {
            return Ok(());
        }
        let (cleanup_interval, health_interval) = {
            let state = self.state.lock();
            if state.shut_down {
                return Err(crate::SubstrateError::ShutDown("block allocator"));
            }
            (state.config.cleanup_interval, state.config.health_interval)
        };

        let mut set = TimerSet::new("allocator")?;
        set.every(cleanup_interval, self, |alloc| {
            if alloc.state.lock().config.enable_auto_cleanup {
                alloc.perform_cleanup();
            }
            alloc.check_memory_usage();
        });
        set.every(health_interval, self, |alloc| {
            if alloc.state.lock().config.enable_fragmentation_detection {
                alloc.detect_fragmentation();
            }
            alloc.check_health();
            alloc
                .events
                .emit(AllocatorEvent::StatisticsUpdated(alloc.stats()));
        });
        *timers = Some(set);
        Ok(())
    }

    /// Stop timers, release free blocks and typed pools; idempotent
    ///
    /// Blocks still held stay indexed and are freed to the system when
    /// deallocated.
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
            Self::drain_free_lists(&mut state)
        };
        self.pools.lock().clear();
        tracing::info!(target: "allocator", "Block allocator shut down ({} free blocks released)", drained.len());
    }

    /// Allocate `size` zeroed bytes aligned to `align`
    ///
    /// `align` must be a power of two. Returns `None` (plus a fault) for a
    /// zero size, an invalid alignment, allocation failure, or after
    /// shutdown.
    pub fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 || !align.is_power_of_two() {
            self.reporter().warning(
                &format!("invalid allocation request: size {} align {}", size, align),
                "allocate",
            );
            return None;
        }

        let now = Instant::now();
        let (class, region) = {
            let mut state = self.state.lock();
            if state.shut_down {
                drop(state);
                self.reporter()
                    .error("allocate after shutdown", "allocate");
                return None;
            }
            let class = state.config.classes.classify(size);
            let list = &mut state.free[class.index()];
            if let Some(pos) = list.iter().position(|r| r.block.fits(size, align)) {
                if let Some(record) = list.remove(pos) {
                    state.free_bytes -= record.block.size().min(state.free_bytes);
                    return Some(self.install(&mut state, record, size, now, true));
                }
            }
            (class, state.config.classes.region_size(class, size))
        };

        // Miss: system allocation outside the lock
        let Some(block) = Block::allocate_zeroed(region, align.max(DEFAULT_ALIGN)) else {
            tracing::error!(target: "allocator", "System allocation of {} bytes failed", region);
            self.reporter().error(
                &format!("system allocation of {} bytes failed", region),
                "allocate",
            );
            return None;
        };
        let record = BlockRecord {
            block,
            requested: size,
            class,
            created_at: now,
            last_used: now,
            ref_count: 0,
            owner: None,
        };

        let mut state = self.state.lock();
        if state.shut_down {
            drop(state);
            self.reporter()
                .error("allocator shut down during allocate", "allocate");
            return None;
        }
        Some(self.install(&mut state, record, size, now, false))
    }

    fn install(
        &self,
        state: &mut AllocState,
        mut record: BlockRecord,
        size: usize,
        now: Instant,
        hit: bool,
    ) -> NonNull<u8> {
        record.requested = size;
        record.last_used = now;
        record.ref_count = 1;
        record.owner = state
            .config
            .enable_tracking
            .then(|| thread::current().id());

        let ptr = record.block.ptr();
        let bytes = record.block.size() as u64;
        state.in_use.insert(record.block.addr(), record);

        if hit {
            self.counters.hits.fetch_add(1, Ordering::AcqRel);
        } else {
            self.counters.misses.fetch_add(1, Ordering::AcqRel);
        }
        self.counters.allocations.fetch_add(1, Ordering::AcqRel);
        self.counters.allocated.fetch_add(bytes, Ordering::AcqRel);

        state.peak_bytes = state.peak_bytes.max(self.counters.in_use_bytes());
        state.peak_allocations = state.peak_allocations.max(state.in_use.len() as u64);
        ptr
    }

    /// Add a holder to a live block; each holder must deallocate once
    pub fn retain(&self, ptr: NonNull<u8>) -> bool {
        let mut state = self.state.lock();
        match state.in_use.get_mut(&(ptr.as_ptr() as usize)) {
            Some(record) => {
                record.ref_count += 1;
                true
            }
            None => false,
        }
    }

    /// Return a block
    ///
    /// The last holder's call zeroes the block and parks it on its class
    /// free list, or frees it when the list is full. Unknown pointers are
    /// reported and ignored.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let now = Instant::now();

        let mut record = {
            let mut state = self.state.lock();
            let Some(record) = state.in_use.get_mut(&addr) else {
                drop(state);
                tracing::warn!(target: "allocator", "Deallocation of unknown block {:#x}", addr);
                self.reporter()
                    .warning(&format!("deallocation of unknown block {:#x}", addr), "deallocate");
                return false;
            };
            if record.ref_count > 1 {
                record.ref_count -= 1;
                return true;
            }
            let Some(record) = state.in_use.remove(&addr) else {
                return false;
            };
            self.counters.deallocations.fetch_add(1, Ordering::AcqRel);
            self.counters
                .freed
                .fetch_add(record.block.size() as u64, Ordering::AcqRel);
            record
        };

        record.block.zero();
        record.ref_count = 0;
        record.owner = None;
        record.last_used = now;

        let mut state = self.state.lock();
        let cap = state.config.free_list_cap();
        if !state.shut_down && state.free[record.class.index()].len() < cap {
            state.free_bytes += record.block.size();
            state.free[record.class.index()].push_back(record);
        } else {
            drop(state);
            drop(record);
        }
        true
    }

    /// Resize a block
    ///
    /// `None` allocates; a zero size deallocates and returns `None`; a
    /// size that still fits returns the same pointer. Otherwise the
    /// contents move to a new block and the old one is deallocated.
    pub fn reallocate(&self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size, DEFAULT_ALIGN);
        };
        if new_size == 0 {
            self.deallocate(ptr);
            return None;
        }

        let old_addr = ptr.as_ptr() as usize;
        let align = {
            let mut state = self.state.lock();
            let Some(record) = state.in_use.get_mut(&old_addr) else {
                drop(state);
                self.reporter()
                    .warning(&format!("reallocation of unknown block {:#x}", old_addr), "reallocate");
                return None;
            };
            if new_size <= record.block.size() {
                record.requested = new_size;
                record.last_used = Instant::now();
                return Some(ptr);
            }
            record.block.align()
        };

        let new_ptr = self.allocate(new_size, align)?;
        {
            let mut state = self.state.lock();
            let new_addr = new_ptr.as_ptr() as usize;
            if let Some(mut dst) = state.in_use.remove(&new_addr) {
                if let Some(src) = state.in_use.get(&old_addr) {
                    let len = src.block.size().min(new_size);
                    // SAFETY: both regions are owned by the index and the
                    // caller still holds the old pointer exclusively.
                    unsafe { dst.block.copy_from(&src.block, len) };
                }
                state.in_use.insert(new_addr, dst);
            }
        }
        self.deallocate(ptr);
        Some(new_ptr)
    }

    /// Current fragmentation ratio; emits a warning above the threshold
    pub fn detect_fragmentation(&self) -> f64 {
        let (ratio, threshold) = {
            let state = self.state.lock();
            (
                state.fragmentation(self.counters.in_use_bytes()),
                state.config.fragmentation_threshold,
            )
        };
        if ratio > threshold {
            tracing::warn!(target: "allocator", "Fragmentation {:.2} above threshold {:.2}", ratio, threshold);
            self.reporter().warning(
                &format!("fragmentation {:.2} above threshold {:.2}", ratio, threshold),
                "detect_fragmentation",
            );
            self.events.emit(AllocatorEvent::FragmentationWarning(ratio));
        }
        ratio
    }

    /// Release every free block to the system
    pub fn compact(&self) -> usize {
        let drained = {
            let mut state = self.state.lock();
            Self::drain_free_lists(&mut state)
        };
        tracing::info!(target: "allocator", "Compaction released {} blocks", drained.len());
        drained.len()
    }

    fn drain_free_lists(state: &mut AllocState) -> Vec<BlockRecord> {
        let mut drained = Vec::new();
        for list in state.free.iter_mut() {
            drained.extend(list.drain(..));
        }
        state.free_bytes = 0;
        drained
    }

    /// Free idle blocks, trim typed pools, compact when fragmented
    pub fn perform_cleanup(&self) -> usize {
        self.perform_cleanup_at(Instant::now())
    }

    pub fn perform_cleanup_at(&self, now: Instant) -> usize {
        let (removed, fragmented) = {
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
            let bytes: usize = removed.iter().map(|r| r.block.size()).sum();
            state.free_bytes -= bytes.min(state.free_bytes);
            let fragmented = state.config.enable_fragmentation_detection
                && state.fragmentation(self.counters.in_use_bytes())
                    > state.config.fragmentation_threshold;
            (removed, fragmented)
        };

        let trimmed: usize = self
            .pools
            .lock()
            .values()
            .map(|pool| pool.trim_to_initial())
            .sum();

        let mut released = removed.len();
        drop(removed);
        if fragmented {
            released += self.compact();
        }
        if released + trimmed > 0 {
            crate::log_memory!(tracing::Level::DEBUG, "Cleanup released {} blocks and {} pooled objects", released, trimmed);
        }
        released
    }

    /// Typed pool for `T`, created on first use
    ///
    /// `None` when object pools are disabled or after shutdown.
    pub fn object_pool<T>(&self) -> Option<Arc<ObjectPool<T>>>
    where
        T: Default + Send + Sync + 'static,
    {
        let (initial, max) = {
            let state = self.state.lock();
            if state.shut_down || !state.config.enable_object_pools {
                return None;
            }
            (state.config.pool_initial_size, state.config.pool_max_size)
        };

        let erased = {
            let mut pools = self.pools.lock();
            pools
                .entry(TypeId::of::<T>())
                .or_insert_with(|| {
                    tracing::debug!(target: "allocator", "Created object pool for {}", std::any::type_name::<T>());
                    let pool: Arc<dyn ErasedPool> =
                        Arc::new(ObjectPool::<T>::new(initial, max, T::default));
                    pool
                })
                .clone()
        };
        erased.as_any_arc().downcast::<ObjectPool<T>>().ok()
    }

    /// Wrap `value` in a pooled shared handle
    ///
    /// Falls back to a plain allocation when no pool slot is available.
    pub fn create_shared<T>(&self, value: T) -> Shared<T>
    where
        T: Default + Send + Sync + 'static,
    {
        if let Some(pool) = self.object_pool::<T>() {
            if let Some(mut slot) = pool.acquire() {
                *slot = value;
                return Shared::pooled(slot, pool);
            }
            tracing::debug!(target: "allocator", "Object pool for {} exhausted", std::any::type_name::<T>());
        }
        Shared::unpooled(value)
    }

    /// Consistent counter snapshot
    pub fn stats(&self) -> AllocatorStats {
        let typed_pools: Vec<ObjectPoolStats> =
            self.pools.lock().values().map(|pool| pool.stats()).collect();
        let state = self.state.lock();
        let in_use_bytes = self.counters.in_use_bytes();
        let mut free_depth = [0usize; 4];
        for (i, list) in state.free.iter().enumerate() {
            free_depth[i] = list.len();
        }
        AllocatorStats {
            cumulative_allocated: self.counters.allocated.load(Ordering::Acquire),
            cumulative_freed: self.counters.freed.load(Ordering::Acquire),
            in_use_bytes,
            peak_bytes: state.peak_bytes,
            current_allocations: state.in_use.len() as u64,
            peak_allocations: state.peak_allocations,
            total_allocations: self.counters.allocations.load(Ordering::Acquire),
            total_deallocations: self.counters.deallocations.load(Ordering::Acquire),
            hits: self.counters.hits.load(Ordering::Acquire),
            misses: self.counters.misses.load(Ordering::Acquire),
            hit_ratio: self.counters.hit_ratio(),
            free_bytes: state.free_bytes as u64,
            fragmentation: state.fragmentation(in_use_bytes),
            free_depth,
            typed_pools,
            healthy: self.healthy_locked(&state),
        }
    }

    fn healthy_locked(&self, state: &AllocState) -> bool {
        let in_use = self.counters.in_use_bytes();
        in_use <= state.config.memory_threshold as u64
            && state.fragmentation(in_use) <= state.config.fragmentation_threshold
            && self.counters.hit_ratio() >= HEALTHY_HIT_RATIO
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
                tracing::info!(target: "allocator", "Block allocator healthy again");
            } else {
                tracing::warn!(target: "allocator", "Block allocator unhealthy");
            }
            self.events.emit(AllocatorEvent::PoolHealthChanged(healthy));
        }
        healthy
    }

    /// Warn and clean up when in-use bytes exceed the threshold
    pub fn check_memory_usage(&self) -> bool {
        let current = self.counters.in_use_bytes() as usize;
        let threshold = self.state.lock().config.memory_threshold;
        if current <= threshold {
            return false;
        }
        tracing::warn!(target: "allocator", "Allocator holds {} bytes in use (threshold {})", current, threshold);
        self.reporter().warning(
            &format!("in-use bytes {} above threshold {}", current, threshold),
            "check_memory_usage",
        );
        self.events
            .emit(AllocatorEvent::MemoryUsageWarning { current, threshold });
        self.perform_cleanup();
        true
    }

    pub fn subscribe(&self) -> Subscription<AllocatorEvent> {
        self.events.subscribe()
    }

    /// Human-readable diagnostic block
    pub fn memory_report(&self) -> String {
        let stats = self.stats();
        let mut out = String::from("Block allocator:\n");
        out.push_str(&format!(
            "  allocated {} freed {} in use {} bytes (peak {})\n",
            stats.cumulative_allocated, stats.cumulative_freed, stats.in_use_bytes, stats.peak_bytes
        ));
        out.push_str(&format!(
            "  live blocks {} (peak {}), {} allocations, {} deallocations\n",
            stats.current_allocations,
            stats.peak_allocations,
            stats.total_allocations,
            stats.total_deallocations
        ));
        out.push_str(&format!(
            "  hit ratio {:.2} ({} hits, {} misses)\n",
            stats.hit_ratio, stats.hits, stats.misses
        ));
        out.push_str(&format!(
            "  free bytes {} fragmentation {:.2}\n",
            stats.free_bytes, stats.fragmentation
        ));
        for class in SizeClass::ALL {
            out.push_str(&format!(
                "  {:<6} free {}\n",
                class.name(),
                stats.free_depth[class.index()]
            ));
        }
        for pool in &stats.typed_pools {
            out.push_str(&format!(
                "  pool {} size {}/{} free {}\n",
                pool.type_name, pool.current_size, pool.max_size, pool.available
            ));
        }

        let state = self.state.lock();
        if state.config.enable_tracking {
            let now = Instant::now();
            let mut live: Vec<&BlockRecord> = state.in_use.values().collect();
            live.sort_by(|a, b| b.block.size().cmp(&a.block.size()));
            for record in live.iter().take(5) {
                out.push_str(&format!(
                    "  live {:#x} {} bytes ({} requested) age {:.0?} owner {:?}\n",
                    record.block.addr(),
                    record.block.size(),
                    record.requested,
                    now.saturating_duration_since(record.created_at),
                    record.owner
                ));
            }
        }
        out.push_str(&format!("  healthy: {}\n", stats.healthy));
        out
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let state = self.state.lock();
        let mut free_bytes = 0usize;
        for (i, list) in state.free.iter().enumerate() {
            for record in list {
                assert_eq!(record.class.index(), i);
                assert_eq!(record.ref_count, 0);
                assert!(!state.in_use.contains_key(&record.block.addr()));
                free_bytes += record.block.size();
            }
        }
        assert_eq!(free_bytes, state.free_bytes);
        let in_use_sum: u64 = state.in_use.values().map(|r| r.block.size() as u64).sum();
        assert_eq!(
            self.counters.allocated.load(Ordering::Acquire)
                - self.counters.freed.load(Ordering::Acquire),
            in_use_sum
        );
        assert!(state.peak_bytes >= in_use_sum);
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        if let Some(timers) = self.timers.get_mut().take() {
            timers.stop();
        }
    }
}
