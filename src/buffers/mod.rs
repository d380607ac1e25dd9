//! Size-classed recycling of opaque byte buffers
//!
//! The messaging layer acquires a [`PooledBuffer`] sized for a frame,
//! fills it, and releases it when the frame is gone. Released regions
//! are zeroed and parked on the free list of their size class.

pub mod pool;

pub use pool::BufferPool;

use bytes::BytesMut;
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::core::{NamedEvent, SizeClass, SizeClassTable};

/// Pool-wide identity of a byte region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferId(u64);

impl BufferId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        BufferId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// A byte region on loan from a [`BufferPool`]
///
/// Dropping a buffer without releasing it leaks its pool slot until
/// shutdown; it is not returned automatically.
#[derive(Debug)]
pub struct PooledBuffer {
    id: BufferId,
    class: SizeClass,
    data: BytesMut,
}

impl PooledBuffer {
    pub(crate) fn new(id: BufferId, class: SizeClass, data: BytesMut) -> Self {
        Self { id, class, data }
    }

    pub(crate) fn into_parts(self) -> (BufferId, SizeClass, BytesMut) {
        (self.id, self.class, self.data)
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn class(&self) -> SizeClass {
        self.class
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Underlying region, for appending or freezing a copy
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

/// A clone copies the bytes but keeps the pool identity; only one of the
/// two may be released, the other release is rejected as a duplicate.
impl Clone for PooledBuffer {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            class: self.class,
            data: self.data.clone(),
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Byte-buffer pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound for concurrent buffers; each free list holds at most a quarter
    pub max_pool_size: usize,
    /// Buffers created at initialize, split evenly over configured classes
    pub initial_pool_size: usize,
    pub max_idle_time: Duration,
    pub cleanup_interval: Duration,
    pub stats_interval: Duration,
    pub enable_auto_cleanup: bool,
    /// Total held bytes above which the pool is unhealthy
    pub memory_threshold: usize,
    pub classes: SizeClassTable,
}

impl PoolConfig {
    /// Free-list capacity per class
    #[inline]
    pub fn free_list_cap(&self) -> usize {
        self.max_pool_size / 4
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 1000,
            initial_pool_size: 50,
            max_idle_time: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            stats_interval: Duration::from_secs(5),
            enable_auto_cleanup: true,
            memory_threshold: 100 * 1024 * 1024,
            classes: SizeClassTable::default(),
        }
    }
}

/// Consistent snapshot of pool counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferPoolStats {
    pub total_acquired: u64,
    pub total_released: u64,
    pub hits: u64,
    pub misses: u64,
    pub destroyed: u64,
    pub current_in_use: u64,
    pub peak_in_use: u64,
    pub held_bytes: usize,
    pub peak_bytes: usize,
    pub hit_ratio: f64,
    /// Free-list depth per class, indexed by `SizeClass::index`
    pub free_depth: [usize; 4],
    pub in_use_by_class: [usize; 4],
    /// Highest loan count of any live record
    pub max_use_count: u64,
    pub healthy: bool,
}

/// Events emitted by the byte-buffer pool
#[derive(Debug, Clone)]
pub enum BufferPoolEvent {
    MemoryUsageWarning { current: usize, threshold: usize },
    PoolHealthChanged(bool),
    StatisticsUpdated(BufferPoolStats),
}

impl NamedEvent for BufferPoolEvent {
    fn name(&self) -> &'static str {
        match self {
            BufferPoolEvent::MemoryUsageWarning { .. } => "memory_usage_warning",
            BufferPoolEvent::PoolHealthChanged(_) => "pool_health_changed",
            BufferPoolEvent::StatisticsUpdated(_) => "statistics_updated",
        }
    }
}
