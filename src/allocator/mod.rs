//! Size-classed raw memory blocks and typed object pools
//!
//! [`BlockAllocator`] hands out aligned, zeroed regions keyed by address
//! and recycles them through per-class free lists. Typed pools
//! ([`ObjectPool`]) recycle boxed instances of one type; [`Shared`] is the
//! reference-counted handle that returns its slot when the last clone drops.

mod block;
pub mod block_allocator;
pub mod object_pool;

pub use block::DEFAULT_ALIGN;
pub use block_allocator::BlockAllocator;
pub use object_pool::{ObjectPool, ObjectPoolStats, Shared};

use serde::Serialize;
use std::time::Duration;

use crate::core::{NamedEvent, SizeClassTable};

/// Block allocator settings
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub enable_object_pools: bool,
    /// Record owning thread per block and list live blocks in reports
    pub enable_tracking: bool,
    pub enable_auto_cleanup: bool,
    pub enable_fragmentation_detection: bool,
    pub cleanup_interval: Duration,
    pub health_interval: Duration,
    pub max_idle_time: Duration,
    /// In-use bytes above which the allocator is unhealthy
    pub memory_threshold: usize,
    pub fragmentation_threshold: f64,
    /// Typed pool sizing
    pub pool_initial_size: usize,
    /// Typed pool ceiling; block free lists hold a quarter of this per class
    pub pool_max_size: usize,
    pub classes: SizeClassTable,
}

impl AllocatorConfig {
    #[inline]
    pub fn free_list_cap(&self) -> usize {
        self.pool_max_size / 4
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            enable_object_pools: true,
            enable_tracking: true,
            enable_auto_cleanup: true,
            enable_fragmentation_detection: true,
            cleanup_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(5),
            max_idle_time: Duration::from_secs(300),
            memory_threshold: 500 * 1024 * 1024,
            fragmentation_threshold: 0.3,
            pool_initial_size: 20,
            pool_max_size: 200,
            classes: SizeClassTable::default(),
        }
    }
}

/// Consistent snapshot of allocator counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct AllocatorStats {
    pub cumulative_allocated: u64,
    pub cumulative_freed: u64,
    /// `cumulative_allocated - cumulative_freed`
    pub in_use_bytes: u64,
    pub peak_bytes: u64,
    pub current_allocations: u64,
    pub peak_allocations: u64,
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    /// Bytes parked on free lists
    pub free_bytes: u64,
    pub fragmentation: f64,
    pub free_depth: [usize; 4],
    pub typed_pools: Vec<ObjectPoolStats>,
    pub healthy: bool,
}

/// Events emitted by the block allocator
#[derive(Debug, Clone)]
pub enum AllocatorEvent {
    MemoryUsageWarning { current: usize, threshold: usize },
    FragmentationWarning(f64),
    PoolHealthChanged(bool),
    StatisticsUpdated(AllocatorStats),
}

impl NamedEvent for AllocatorEvent {
    fn name(&self) -> &'static str {
        match self {
            AllocatorEvent::MemoryUsageWarning { .. } => "memory_usage_warning",
            AllocatorEvent::FragmentationWarning(_) => "fragmentation_warning",
            AllocatorEvent::PoolHealthChanged(_) => "pool_health_changed",
            AllocatorEvent::StatisticsUpdated(_) => "statistics_updated",
        }
    }
}
