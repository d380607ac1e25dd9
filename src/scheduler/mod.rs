//! Update scheduler
//!
//! Throttles, coalesces and rate-limits work items bound for the visual
//! output layer. Items of the same `(kind, target_id)` merge while
//! queued; ticks dispatch batches by priority once each kind's interval
//! has elapsed, and tuning retunes intervals from rolling dispatch times
//! and observed CPU and memory.

pub mod cache;
pub mod item;
pub mod update_scheduler;

pub use cache::{CacheConfig, CacheStats, EvictionPolicy, PayloadCache};
pub use item::{Strategy, UpdateKind, WorkItem, DEFAULT_PRIORITY};
pub use update_scheduler::{
    DropReason, KindStats, SchedulerConfig, SchedulerStats, SubmitOutcome, UpdateScheduler,
    UpdateSink,
};

use crate::core::NamedEvent;

/// Events emitted by the scheduler
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// Dispatched item with no registered sink
    UpdateRequired(WorkItem),
    /// More than one item dispatched in a single tick
    BatchUpdateRequired(Vec<WorkItem>),
    PerformanceWarning(String),
    StrategyChanged { kind: UpdateKind, strategy: Strategy },
}

impl NamedEvent for SchedulerEvent {
    fn name(&self) -> &'static str {
        match self {
            SchedulerEvent::UpdateRequired(_) => "update_required",
            SchedulerEvent::BatchUpdateRequired(_) => "batch_update_required",
            SchedulerEvent::PerformanceWarning(_) => "performance_warning",
            SchedulerEvent::StrategyChanged { .. } => "strategy_changed",
        }
    }
}
