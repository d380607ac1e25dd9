//! Test doubles shared by the component tests

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;

use crate::fault::{ReportFault, Severity};
use crate::metrics::MetricsSnapshot;
use crate::scheduler::{UpdateKind, UpdateScheduler, WorkItem};

/// (severity, category, message, source)
pub type ReportedFault = (Severity, String, String, String);

/// Fault reporter that records everything it receives
#[derive(Default)]
pub struct RecordingReporter {
    records: Mutex<Vec<ReportedFault>>,
}

impl RecordingReporter {
    pub fn records(&self) -> Vec<ReportedFault> {
        self.records.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn count_at(&self, severity: Severity) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|(s, ..)| *s == severity)
            .count()
    }
}

impl ReportFault for RecordingReporter {
    fn report_fault(&self, severity: Severity, category: &str, message: &str, source: &str) {
        self.records.lock().push((
            severity,
            category.to_string(),
            message.to_string(),
            source.to_string(),
        ));
    }
}

/// Scheduler sink that keeps every dispatched item
#[derive(Clone, Default)]
pub struct RecordingSink {
    items: Arc<Mutex<Vec<WorkItem>>>,
}

impl RecordingSink {
    pub fn attach(&self, scheduler: &UpdateScheduler, kind: UpdateKind, target_id: &str) {
        let items = self.items.clone();
        scheduler.register_sink(kind, target_id, move |item| items.lock().push(item.clone()));
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.items.lock().iter().map(|i| i.payload.clone()).collect()
    }
}

/// Snapshot with the given CPU percent and process resident bytes
pub fn snapshot(cpu: f64, process_memory: u64) -> MetricsSnapshot {
    MetricsSnapshot {
        cpu_usage: cpu,
        memory_used: 4 * 1024 * 1024 * 1024,
        memory_total: 16 * 1024 * 1024 * 1024,
        process_memory,
        thread_count: 8,
        ..MetricsSnapshot::at(OffsetDateTime::now_utc())
    }
}
