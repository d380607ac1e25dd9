//! Fault classification, ingestion and recovery
//!
//! Components never throw internal faults out of their public APIs.
//! They hand them to a [`FaultReporter`], which forwards to the
//! [`FaultSink`] attached at wire-up. The sink tracks per-severity
//! counters and drives recovery when a threshold is crossed.

pub mod sink;

pub use sink::{FaultCallback, FaultSink, FaultSinkConfig, RecoveryAction};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::core::NamedEvent;

/// Fault severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
        Severity::Fatal,
    ];

    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
            Severity::Fatal => "FATAL",
        }
    }

    /// Error and above count against recovery thresholds
    #[inline]
    pub fn drives_recovery(self) -> bool {
        self >= Severity::Error
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One ingested fault
#[derive(Debug, Clone)]
pub struct FaultRecord {
    pub id: Uuid,
    pub timestamp: OffsetDateTime,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    pub source: String,
    pub details: String,
    pub handled: bool,
}

impl FaultRecord {
    pub fn new(severity: Severity, category: &str, message: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: OffsetDateTime::now_utc(),
            severity,
            category: category.to_string(),
            message: message.to_string(),
            source: String::new(),
            details: String::new(),
            handled: false,
        }
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn with_details(mut self, details: &str) -> Self {
        self.details = details.to_string();
        self
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] [{}] {}", self.severity, self.category, self.message)?;
        if !self.source.is_empty() {
            write!(f, " (source: {})", self.source)?;
        }
        if !self.details.is_empty() {
            write!(f, " - {}", self.details)?;
        }
        Ok(())
    }
}

/// Events emitted by the fault sink
#[derive(Debug, Clone)]
pub enum FaultEvent {
    ErrorReported(FaultRecord),
    CriticalError(String),
    FatalError(String),
    RecoveryTriggered(String),
    RecoveryCompleted(bool),
}

impl NamedEvent for FaultEvent {
    fn name(&self) -> &'static str {
        match self {
            FaultEvent::ErrorReported(_) => "error_reported",
            FaultEvent::CriticalError(_) => "critical_error",
            FaultEvent::FatalError(_) => "fatal_error",
            FaultEvent::RecoveryTriggered(_) => "recovery_triggered",
            FaultEvent::RecoveryCompleted(_) => "recovery_completed",
        }
    }
}

/// Anything that accepts fault reports
pub trait ReportFault: Send + Sync {
    fn report_fault(&self, severity: Severity, category: &str, message: &str, source: &str);
}

/// Weak, cloneable handle components use to report faults
///
/// Without an attached sink the report is only logged.
#[derive(Clone, Default)]
pub struct FaultReporter {
    sink: Option<Weak<dyn ReportFault>>,
    category: &'static str,
}

impl FaultReporter {
    /// Reporter that only logs
    pub fn detached(category: &'static str) -> Self {
        Self {
            sink: None,
            category,
        }
    }

    /// Reporter forwarding to `sink` under `category`
    pub fn new(category: &'static str, sink: &Arc<dyn ReportFault>) -> Self {
        Self {
            sink: Some(Arc::downgrade(sink)),
            category,
        }
    }

    pub fn category(&self) -> &'static str {
        self.category
    }

    /// True if a live sink is attached
    pub fn is_attached(&self) -> bool {
        self.sink
            .as_ref()
            .map(|s| s.strong_count() > 0)
            .unwrap_or(false)
    }

    pub fn report(&self, severity: Severity, message: &str, source: &str) {
        match self.sink.as_ref().and_then(Weak::upgrade) {
            Some(sink) => sink.report_fault(severity, self.category, message, source),
            None => match severity {
                Severity::Info => {
                    tracing::info!(target: "fault", category = self.category, source, "{}", message)
                }
                Severity::Warning => {
                    tracing::warn!(target: "fault", category = self.category, source, "{}", message)
                }
                _ => {
                    tracing::error!(target: "fault", category = self.category, source, severity = %severity, "{}", message)
                }
            },
        }
    }

    #[inline]
    pub fn warning(&self, message: &str, source: &str) {
        self.report(Severity::Warning, message, source);
    }

    #[inline]
    pub fn error(&self, message: &str, source: &str) {
        self.report(Severity::Error, message, source);
    }
}

impl fmt::Debug for FaultReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultReporter")
            .field("category", &self.category)
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingReporter;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Fatal > Severity::Critical);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error.drives_recovery());
        assert!(!Severity::Warning.drives_recovery());
        assert_eq!(Severity::Critical.index(), 3);
    }

    #[test]
    fn test_record_display() {
        let record = FaultRecord::new(Severity::Error, "buffer_pool", "boom")
            .with_source("release")
            .with_details("id 7");
        assert_eq!(
            record.to_string(),
            "[ERROR] [buffer_pool] boom (source: release) - id 7"
        );
    }

    #[test]
    fn test_reporter_forwards_until_sink_dropped() {
        let recorder = Arc::new(RecordingReporter::default());
        let sink: Arc<dyn ReportFault> = recorder.clone();
        let reporter = FaultReporter::new("scheduler", &sink);
        assert!(reporter.is_attached());

        reporter.warning("queue full", "submit");
        reporter.error("sink panicked", "tick");
        assert_eq!(recorder.count(), 2);
        assert_eq!(recorder.count_at(Severity::Error), 1);
        assert_eq!(recorder.records()[0].1, "scheduler");

        drop(sink);
        drop(recorder);
        assert!(!reporter.is_attached());
        // Falls back to logging only
        reporter.warning("after drop", "submit");
    }

    #[test]
    fn test_detached_reporter_logs_only() {
        let reporter = FaultReporter::detached("allocator");
        assert!(!reporter.is_attached());
        assert_eq!(reporter.category(), "allocator");
        reporter.report(Severity::Critical, "nothing attached", "test");
    }
}
