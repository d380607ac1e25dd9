//! Work items, kinds and dispatch strategies

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Category of a visual update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Status,
    Progress,
    Chart,
    Table,
    Stats,
    Realtime,
    Error,
    Log,
    Animation,
    Layout,
}

impl UpdateKind {
    pub const ALL: [UpdateKind; 10] = [
        UpdateKind::Status,
        UpdateKind::Progress,
        UpdateKind::Chart,
        UpdateKind::Table,
        UpdateKind::Stats,
        UpdateKind::Realtime,
        UpdateKind::Error,
        UpdateKind::Log,
        UpdateKind::Animation,
        UpdateKind::Layout,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            UpdateKind::Status => "status",
            UpdateKind::Progress => "progress",
            UpdateKind::Chart => "chart",
            UpdateKind::Table => "table",
            UpdateKind::Stats => "stats",
            UpdateKind::Realtime => "realtime",
            UpdateKind::Error => "error",
            UpdateKind::Log => "log",
            UpdateKind::Animation => "animation",
            UpdateKind::Layout => "layout",
        }
    }

    /// Minimum spacing between enqueue and dispatch
    pub const fn default_interval(self) -> Duration {
        let ms = match self {
            UpdateKind::Status => 100,
            UpdateKind::Progress => 50,
            UpdateKind::Chart => 200,
            UpdateKind::Table => 300,
            UpdateKind::Stats => 500,
            UpdateKind::Realtime => 16,
            UpdateKind::Error => 0,
            UpdateKind::Log => 100,
            UpdateKind::Animation => 16,
            UpdateKind::Layout => 50,
        };
        Duration::from_millis(ms)
    }

    pub const fn default_strategy(self) -> Strategy {
        match self {
            UpdateKind::Error | UpdateKind::Realtime | UpdateKind::Animation => Strategy::Immediate,
            UpdateKind::Status | UpdateKind::Progress | UpdateKind::Stats | UpdateKind::Log => {
                Strategy::Batched
            }
            UpdateKind::Chart => Strategy::Adaptive,
            UpdateKind::Table | UpdateKind::Layout => Strategy::Deferred,
        }
    }

    /// (floor, ceiling) for adaptive interval tuning
    pub const fn interval_bounds(self) -> (Duration, Duration) {
        let (lo, hi) = match self {
            UpdateKind::Error => (0, 50),
            UpdateKind::Realtime | UpdateKind::Animation => (16, 100),
            UpdateKind::Progress => (30, 200),
            _ => (50, 1000),
        };
        (Duration::from_millis(lo), Duration::from_millis(hi))
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How queued items of a kind are picked during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Dispatched synchronously on submit
    Immediate,
    /// Selected once the kind interval has elapsed
    Batched,
    /// Only fills batch capacity left by other items
    Deferred,
    /// Batched while ticks are fast, Deferred otherwise
    Adaptive,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Immediate => "immediate",
            Strategy::Batched => "batched",
            Strategy::Deferred => "deferred",
            Strategy::Adaptive => "adaptive",
        };
        f.write_str(name)
    }
}

/// Default priority for new items
pub const DEFAULT_PRIORITY: u8 = 50;

/// A pending update for one sink
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub kind: UpdateKind,
    /// Distinguishes sinks of the same kind
    pub target_id: String,
    pub payload: Bytes,
    /// Latest enqueue time; refreshed when a newer item coalesces into this one
    pub enqueued_at: Instant,
    /// 0..=100, higher dispatches first
    pub priority: u8,
    pub immediate: bool,
    pub coalescing: bool,
    /// First enqueue time, used for interval eligibility
    pub(crate) first_enqueued_at: Instant,
    pub(crate) seq: u64,
}

impl WorkItem {
    pub fn new(kind: UpdateKind, target_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        let now = Instant::now();
        Self {
            kind,
            target_id: target_id.into(),
            payload: payload.into(),
            enqueued_at: now,
            priority: DEFAULT_PRIORITY,
            immediate: false,
            coalescing: true,
            first_enqueued_at: now,
            seq: 0,
        }
    }

    /// Set priority, clamped to 100
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(100);
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn coalescing(mut self, coalescing: bool) -> Self {
        self.coalescing = coalescing;
        self
    }

    /// Override the enqueue timestamp
    pub fn at(mut self, ts: Instant) -> Self {
        self.enqueued_at = ts;
        self.first_enqueued_at = ts;
        self
    }

    #[inline]
    pub(crate) fn same_target(&self, other: &WorkItem) -> bool {
        self.kind == other.kind && self.target_id == other.target_id
    }

    /// Time since first enqueue
    #[inline]
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.first_enqueued_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_defaults() {
        assert_eq!(UpdateKind::ALL.len(), 10);
        for (i, kind) in UpdateKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
            let (lo, hi) = kind.interval_bounds();
            assert!(lo <= hi);
        }
        assert_eq!(UpdateKind::Error.default_strategy(), Strategy::Immediate);
        assert_eq!(UpdateKind::Chart.default_strategy(), Strategy::Adaptive);
        assert_eq!(UpdateKind::Table.default_interval(), Duration::from_millis(300));
    }

    #[test]
    fn test_builder_clamps_priority() {
        let item = WorkItem::new(UpdateKind::Log, "console", &b"line"[..]).priority(250);
        assert_eq!(item.priority, 100);
        assert!(item.coalescing);
        assert!(!item.immediate);
        assert_eq!(item.payload, Bytes::from_static(b"line"));
    }

    #[test]
    fn test_at_sets_both_timestamps() {
        let t = Instant::now() + Duration::from_secs(1);
        let item = WorkItem::new(UpdateKind::Chart, "g1", Bytes::new()).at(t);
        assert_eq!(item.enqueued_at, t);
        assert_eq!(item.waited(t + Duration::from_millis(5)), Duration::from_millis(5));
    }
}
