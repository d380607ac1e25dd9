//! Bounded payload cache with TTL
//!
//! Stores expensive-to-compute payloads by key. Eviction order is
//! tracked with a monotonically increasing stamp: refreshed on every hit
//! for LRU, set once on insert for FIFO.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Fifo,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_bytes: usize,
    pub ttl: Duration,
    pub policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 100 * 1024 * 1024,
            ttl: Duration::from_secs(300),
            policy: EvictionPolicy::Lru,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Entry {
    value: Bytes,
    inserted_at: Instant,
    stamp: u64,
}

struct CacheInner {
    config: CacheConfig,
    entries: HashMap<String, Entry>,
    /// stamp -> key, oldest first
    order: BTreeMap<u64, String>,
    next_stamp: u64,
    bytes: usize,
    stats: CacheStats,
}

impl CacheInner {
    fn stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    fn remove_entry(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.stamp);
        self.bytes -= entry.value.len();
        Some(entry)
    }

    fn evict_until_fits(&mut self, incoming: usize) {
        while self.bytes + incoming > self.config.max_bytes {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.bytes -= entry.value.len();
                self.stats.evictions += 1;
            }
        }
    }
}

/// Thread-safe payload cache
pub struct PayloadCache {
    inner: Mutex<CacheInner>,
}

impl PayloadCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                config,
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_stamp: 0,
                bytes: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        let ttl = inner.config.ttl;
        let expired = match inner.entries.get(key) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(entry) => now.saturating_duration_since(entry.inserted_at) > ttl,
        };
        if expired {
            inner.remove_entry(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }

        inner.stats.hits += 1;
        if inner.config.policy == EvictionPolicy::Lru {
            let stamp = inner.stamp();
            if let Some(entry) = inner.entries.get_mut(key) {
                let old = std::mem::replace(&mut entry.stamp, stamp);
                let value = entry.value.clone();
                inner.order.remove(&old);
                inner.order.insert(stamp, key.to_string());
                return Some(value);
            }
        }
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// Insert or replace; `false` if the value alone exceeds the byte budget
    pub fn put(&self, key: &str, value: Bytes) -> bool {
        self.put_at(key, value, Instant::now())
    }

    pub fn put_at(&self, key: &str, value: Bytes, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if value.len() > inner.config.max_bytes {
            return false;
        }
        inner.remove_entry(key);
        inner.evict_until_fits(value.len());

        let stamp = inner.stamp();
        inner.bytes += value.len();
        inner.order.insert(stamp, key.to_string());
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                inserted_at: now,
                stamp,
            },
        );
        true
    }

    /// Cached value, or compute and cache it
    pub fn get_or_insert_with<F>(&self, key: &str, compute: F) -> Bytes
    where
        F: FnOnce() -> Bytes,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = compute();
        self.put(key, value.clone());
        value
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove_entry(key).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        inner.bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            ..inner.stats.clone()
        }
    }
}

impl Default for PayloadCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
