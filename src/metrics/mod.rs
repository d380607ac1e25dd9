//! System and process metrics
//!
//! The collector samples through a [`SystemProbe`], keeps a bounded
//! history, evaluates threshold alerts and runs memory-pressure hooks.

pub mod alert;
pub mod collector;
pub mod probe;
pub mod snapshot;

pub use alert::{AlertAction, AlertSpec, FiredAlert};
pub use collector::{CollectorConfig, MetricsCollector};
pub use probe::{FakeProbe, LinuxProbe, ProbeSource, SystemProbe};
pub use snapshot::MetricsSnapshot;

use std::sync::Arc;

use crate::core::NamedEvent;

/// Events emitted by the metrics collector
#[derive(Debug, Clone)]
pub enum MetricsEvent {
    MetricsUpdated(Arc<MetricsSnapshot>),
    AlertTriggered {
        alert: AlertSpec,
        snapshot: Arc<MetricsSnapshot>,
    },
}

impl NamedEvent for MetricsEvent {
    fn name(&self) -> &'static str {
        match self {
            MetricsEvent::MetricsUpdated(_) => "metrics_updated",
            MetricsEvent::AlertTriggered { .. } => "alert_triggered",
        }
    }
}
