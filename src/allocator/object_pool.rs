//! Typed object pools
//!
//! Homogeneous slot pools built on crossbeam-queue for lock-free
//! acquire/release. A released instance is reset in place, which runs
//! the destructor of its old contents while the `Box` storage is kept.

use crossbeam_queue::ArrayQueue;
use std::any::Any;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Pool of reusable boxed instances
///
/// # Type Parameters
/// - `T`: The pooled type. Must be Send for thread safety.
///
/// # Example
/// ```
/// use perf_substrate::allocator::ObjectPool;
///
/// let pool: ObjectPool<Vec<u8>> = ObjectPool::new(4, 16, Vec::new);
///
/// let mut buf = pool.acquire().unwrap();
/// buf.extend_from_slice(b"frame");
///
/// // Contents are dropped, the slot is kept
/// pool.release(buf);
/// assert!(pool.acquire().unwrap().is_empty());
/// ```
pub struct ObjectPool<T: Send> {
    slots: ArrayQueue<Box<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    /// Slots alive, free plus lent
    current_size: AtomicUsize,
    initial_size: usize,
    max_size: usize,
    acquired: AtomicU64,
    released: AtomicU64,
    created: AtomicU64,
}

impl<T: Send> ObjectPool<T> {
    /// Create a pool with `initial_size` pre-built slots, growing to `max_size`
    pub fn new<F>(initial_size: usize, max_size: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let max_size = max_size.max(1);
        let initial_size = initial_size.min(max_size);
        let slots = ArrayQueue::new(max_size);

        // Pre-populate the pool
        let mut built = 0;
        for _ in 0..initial_size {
            if slots.push(Box::new(factory())).is_err() {
                break; // Queue is full
            }
            built += 1;
        }

        Self {
            slots,
            factory: Box::new(factory),
            current_size: AtomicUsize::new(built),
            initial_size,
            max_size,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            created: AtomicU64::new(built as u64),
        }
    }

    /// Take a slot, constructing one if the pool may still grow
    ///
    /// Returns `None` once `max_size` slots are alive and none is free.
    pub fn acquire(&self) -> Option<Box<T>> {
        if let Some(slot) = self.slots.pop() {
            self.acquired.fetch_add(1, Ordering::Relaxed);
            return Some(slot);
        }

        let reserved = self
            .current_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_size).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            return None;
        }

        self.created.fetch_add(1, Ordering::Relaxed);
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Some(Box::new((self.factory)()))
    }

    /// Return a slot
    ///
    /// The instance is reset in place. The slot stays pooled while at most
    /// half the maximum is free, otherwise it is destroyed. A box this pool
    /// never lent out is dropped without touching the size accounting.
    pub fn release(&self, mut slot: Box<T>) {
        self.released.fetch_add(1, Ordering::Relaxed);
        *slot = (self.factory)();

        let free = self.slots.len();
        if free < (self.max_size / 2).max(1) && free < self.current_size() {
            match self.slots.push(slot) {
                Ok(()) => return,
                Err(slot) => drop(slot),
            }
        } else {
            drop(slot);
        }
        self.retire_slot();
    }

    /// Destroy free slots beyond `keep`
    pub fn trim(&self, keep: usize) -> usize {
        let mut dropped = 0;
        while self.slots.len() > keep {
            match self.slots.pop() {
                Some(slot) => {
                    drop(slot);
                    self.retire_slot();
                    dropped += 1;
                }
                None => break,
            }
        }
        dropped
    }

    /// Count one slot as destroyed
    ///
    /// Only while some slot is lent out, so `available <= current_size`.
    fn retire_slot(&self) {
        let _ = self
            .current_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > self.slots.len()).then(|| n - 1)
            });
    }

    /// Free slots ready for reuse
    #[inline]
    pub fn available(&self) -> usize {
        self.slots.len()
    }

    /// Slots alive (free plus lent)
    #[inline]
    pub fn current_size(&self) -> usize {
        self.current_size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn initial_size(&self) -> usize {
        self.initial_size
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> ObjectPoolStats {
        ObjectPoolStats {
            type_name: std::any::type_name::<T>(),
            available: self.available(),
            current_size: self.current_size(),
            max_size: self.max_size,
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
        }
    }
}

impl<T: Send> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("type", &std::any::type_name::<T>())
            .field("available", &self.available())
            .field("current_size", &self.current_size())
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// Counter snapshot for one typed pool
#[derive(Debug, Clone, serde::Serialize)]
pub struct ObjectPoolStats {
    pub type_name: &'static str,
    pub available: usize,
    pub current_size: usize,
    pub max_size: usize,
    pub acquired: u64,
    pub released: u64,
    pub created: u64,
}

/// Type-erased view used by the pool registry
pub(crate) trait ErasedPool: Any + Send + Sync {
    fn stats(&self) -> ObjectPoolStats;
    fn trim_to_initial(&self) -> usize;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Send + 'static> ErasedPool for ObjectPool<T> {
    fn stats(&self) -> ObjectPoolStats {
        ObjectPool::stats(self)
    }

    fn trim_to_initial(&self) -> usize {
        self.trim(self.initial_size)
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Reference-counted handle to a pooled instance
///
/// When the last clone drops, the instance goes back to its pool. Values
/// built while pooling is unavailable are plain heap allocations.
pub struct Shared<T: Send + Sync + 'static> {
    inner: Arc<SharedSlot<T>>,
}

struct SharedSlot<T: Send + Sync + 'static> {
    value: ManuallyDrop<Box<T>>,
    pool: Option<Arc<ObjectPool<T>>>,
}

impl<T: Send + Sync + 'static> Shared<T> {
    pub(crate) fn pooled(value: Box<T>, pool: Arc<ObjectPool<T>>) -> Self {
        Self {
            inner: Arc::new(SharedSlot {
                value: ManuallyDrop::new(value),
                pool: Some(pool),
            }),
        }
    }

    pub(crate) fn unpooled(value: T) -> Self {
        Self {
            inner: Arc::new(SharedSlot {
                value: ManuallyDrop::new(Box::new(value)),
                pool: None,
            }),
        }
    }

    /// True if the value returns to a pool on drop
    pub fn is_pooled(&self) -> bool {
        self.inner.pool.is_some()
    }

    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.inner)
    }

    /// Mutable access while this is the only handle
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        Arc::get_mut(&mut this.inner).map(|slot| &mut **slot.value)
    }
}

impl<T: Send + Sync + 'static> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Deref for Shared<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T: Send + Sync + fmt::Debug + 'static> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shared").field(&**self).finish()
    }
}

impl<T: Send + Sync + 'static> Drop for SharedSlot<T> {
    fn drop(&mut self) {
        // SAFETY: `value` is taken exactly once, here, and never used after.
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        match self.pool.take() {
            Some(pool) => pool.release(value),
            None => drop(value),
        }
    }
}
