//! Bounded rings for history and rolling statistics
//!
//! `RingBuffer` keeps the most recent N entries in chronological order
//! (fault history, metrics history, recent alerts). `RollingWindow` keeps
//! a maintained sum so the average is O(1) (dispatch durations).

use std::collections::VecDeque;

/// Chronological ring with a runtime capacity
///
/// Pushing into a full ring evicts and returns the oldest entry.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buffer: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create ring holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Append, returning the evicted oldest entry if the ring was full
    #[inline]
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.buffer.len() == self.capacity {
            self.buffer.pop_front()
        } else {
            None
        };
        self.buffer.push_back(value);
        evicted
    }

    /// Oldest to newest
    #[inline]
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.buffer.iter()
    }

    #[inline]
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.buffer.iter_mut()
    }

    /// Most recent entry
    #[inline]
    pub fn last(&self) -> Option<&T> {
        self.buffer.back()
    }

    /// Last `n` entries, oldest first
    pub fn tail(&self, n: usize) -> impl Iterator<Item = &T> {
        let skip = self.buffer.len().saturating_sub(n);
        self.buffer.iter().skip(skip)
    }

    /// Stored count
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change capacity, dropping the oldest entries that no longer fit
    pub fn set_capacity(&mut self, capacity: usize) -> usize {
        self.capacity = capacity.max(1);
        let mut dropped = 0;
        while self.buffer.len() > self.capacity {
            self.buffer.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Remove entries not matching `keep`
    pub fn retain<F: FnMut(&T) -> bool>(&mut self, keep: F) {
        self.buffer.retain(keep);
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Fixed-size window of samples with a maintained sum
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    /// Add value maintaining rolling sum
    #[inline]
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    /// Rolling average, 0 when empty
    #[inline]
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            (self.sum / self.samples.len() as f64).max(0.0)
        }
    }

    /// Largest sample in the window (O(N), N is small)
    pub fn max(&self) -> f64 {
        self.samples.iter().copied().fold(0.0, f64::max)
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }
}
