//! Central fault sink
//!
//! `report` enqueues a record and bumps its severity counter. A periodic
//! task drains the queue into the log and the registered callbacks. A
//! slower task compares counters to thresholds and starts recovery.
//! Fatal records skip the queue and are dispatched inside `report`.

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{FaultEvent, FaultRecord, ReportFault, Severity};
use crate::core::{EventBus, Subscription};
use crate::infrastructure::{RingBuffer, TimerSet};
use crate::Result;

/// Callback invoked for every dispatched record
pub type FaultCallback = Arc<dyn Fn(&FaultRecord) -> anyhow::Result<()> + Send + Sync>;

/// Action run when a recovery delay elapses
pub type RecoveryAction = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Fault sink settings
#[derive(Debug, Clone)]
pub struct FaultSinkConfig {
    /// History ring capacity; also bounds the pending queue
    pub history_capacity: usize,
    pub process_interval: Duration,
    pub threshold_interval: Duration,
    pub recovery_delay: Duration,
    pub recovery_backoff: Duration,
    pub max_recovery_attempts: u32,
    /// Combined Error + Critical + Fatal count that forces recovery
    pub max_error_count: u64,
    pub auto_recovery: bool,
    /// Per-severity trigger counts, indexed by `Severity::index`
    pub thresholds: [Option<u64>; 5],
}

impl Default for FaultSinkConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            process_interval: Duration::from_millis(50),
            threshold_interval: Duration::from_secs(5),
            recovery_delay: Duration::from_secs(1),
            recovery_backoff: Duration::from_secs(5),
            max_recovery_attempts: 3,
            max_error_count: 100,
            auto_recovery: true,
            thresholds: [None, Some(50), Some(20), Some(5), Some(1)],
        }
    }
}

#[derive(Debug, Default)]
struct RecoveryState {
    in_progress: bool,
    attempts: u32,
    due: Option<Instant>,
    reason: String,
}

struct SinkState {
    queue: VecDeque<FaultRecord>,
    history: RingBuffer<FaultRecord>,
    thresholds: [Option<u64>; 5],
    recovery: RecoveryState,
    dropped: u64,
}

/// Classified fault ingestion with threshold-driven recovery
pub struct FaultSink {
    config: FaultSinkConfig,
    state: Mutex<SinkState>,
    counters: [AtomicU64; 5],
    callbacks: RwLock<Vec<(String, FaultCallback)>>,
    actions: RwLock<Vec<(String, RecoveryAction)>>,
    events: EventBus<FaultEvent>,
    auto_recovery: AtomicBool,
    shut_down: AtomicBool,
    timers: Mutex<Option<TimerSet>>,
}

impl FaultSink {
    pub fn new(config: FaultSinkConfig) -> Self {
        let state = SinkState {
            queue: VecDeque::new(),
            history: RingBuffer::new(config.history_capacity),
            thresholds: config.thresholds,
            recovery: RecoveryState::default(),
            dropped: 0,
        };
        Self {
            auto_recovery: AtomicBool::new(config.auto_recovery),
            config,
            state: Mutex::new(state),
            counters: Default::default(),
            callbacks: RwLock::new(Vec::new()),
            actions: RwLock::new(Vec::new()),
            events: EventBus::new(),
            shut_down: AtomicBool::new(false),
            timers: Mutex::new(None),
        }
    }

    /// Start the processing and threshold timers
    ///
    /// # Errors
    /// Returns `NoRuntime` outside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut timers = self.timers.lock();
        if timers.is_some() {
            return Ok(());
        }
        self.shut_down.store(false, Ordering::Release);

        let mut set = TimerSet::new("fault")?;
        set.every(self.config.process_interval, self, |sink| {
            sink.process_queue();
            sink.poll_recovery();
        });
        set.every(self.config.threshold_interval, self, |sink| {
            sink.check_thresholds();
        });
        *timers = Some(set);

        tracing::info!(target: "fault", "Fault sink started");
        Ok(())
    }

    /// Stop timers and flush the pending queue; idempotent
    pub fn shutdown(&self) {
        if let Some(timers) = self.timers.lock().take() {
            timers.stop();
        }
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            self.process_queue();
            tracing::info!(target: "fault", "Fault sink shut down");
        }
    }

    /// Ingest a fault
    ///
    /// Returns the record id. After shutdown the fault is only logged.
    pub fn report(
        &self,
        severity: Severity,
        category: &str,
        message: &str,
        source: Option<&str>,
        details: Option<&str>,
    ) -> Uuid {
        let mut record = FaultRecord::new(severity, category, message);
        if let Some(source) = source {
            record.source = source.to_string();
        }
        if let Some(details) = details {
            record.details = details.to_string();
        }
        let id = record.id;

        if self.shut_down.load(Ordering::Acquire) {
            log_record(&record);
            return id;
        }

        self.counters[severity.index()].fetch_add(1, Ordering::AcqRel);

        {
            let mut state = self.state.lock();
            state.history.push(record.clone());
            if severity != Severity::Fatal {
                if state.queue.len() >= self.config.history_capacity {
                    state.queue.pop_front();
                    state.dropped += 1;
                }
                state.queue.push_back(record.clone());
            }
        }

        if severity == Severity::Fatal {
            self.dispatch(&record);
        }
        id
    }

    pub fn report_info(&self, category: &str, message: &str) -> Uuid {
        self.report(Severity::Info, category, message, None, None)
    }

    pub fn report_warning(&self, category: &str, message: &str) -> Uuid {
        self.report(Severity::Warning, category, message, None, None)
    }

    pub fn report_error(&self, category: &str, message: &str) -> Uuid {
        self.report(Severity::Error, category, message, None, None)
    }

    pub fn report_critical(&self, category: &str, message: &str) -> Uuid {
        self.report(Severity::Critical, category, message, None, None)
    }

    pub fn report_fatal(&self, category: &str, message: &str) -> Uuid {
        self.report(Severity::Fatal, category, message, None, None)
    }

    /// Register a per-record callback; replaces one with the same name
    ///
    /// Callbacks run in registration order.
    pub fn register_recovery_callback<F>(&self, name: &str, callback: F)
    where
        F: Fn(&FaultRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: FaultCallback = Arc::new(callback);
        let mut callbacks = self.callbacks.write();
        match callbacks.iter_mut().find(|(n, _)| n.as_str() == name) {
            Some(slot) => slot.1 = callback,
            None => callbacks.push((name.to_string(), callback)),
        }
    }

    /// Register an action run when recovery fires
    pub fn register_recovery_action<F>(&self, name: &str, action: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let action: RecoveryAction = Arc::new(action);
        let mut actions = self.actions.write();
        match actions.iter_mut().find(|(n, _)| n.as_str() == name) {
            Some(slot) => slot.1 = action,
            None => actions.push((name.to_string(), action)),
        }
    }

    /// Remove a callback or recovery action by name
    pub fn unregister(&self, name: &str) -> bool {
        let mut removed = false;
        self.callbacks.write().retain(|(n, _)| {
            let keep = n.as_str() != name;
            removed |= !keep;
            keep
        });
        self.actions.write().retain(|(n, _)| {
            let keep = n.as_str() != name;
            removed |= !keep;
            keep
        });
        removed
    }

    /// Drain the pending queue through the log and callbacks
    pub fn process_queue(&self) -> usize {
        let pending: Vec<FaultRecord> = {
            let mut state = self.state.lock();
            state.queue.drain(..).collect()
        };
        for record in &pending {
            self.dispatch(record);
        }
        pending.len()
    }

    fn dispatch(&self, record: &FaultRecord) {
        log_record(record);

        let callbacks: Vec<(String, FaultCallback)> = self.callbacks.read().clone();
        for (name, callback) in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(record))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(target: "fault", "Fault callback {} failed: {:#}", name, e);
                }
                Err(_) => {
                    tracing::error!(target: "fault", "Fault callback {} panicked", name);
                }
            }
        }

        self.events.emit(FaultEvent::ErrorReported(record.clone()));
        match record.severity {
            Severity::Critical => self
                .events
                .emit(FaultEvent::CriticalError(record.message.clone())),
            Severity::Fatal => self
                .events
                .emit(FaultEvent::FatalError(record.message.clone())),
            _ => {}
        }
    }

    /// Compare counters to thresholds, triggering recovery on exceedance
    pub fn check_thresholds(&self) -> bool {
        self.check_thresholds_at(Instant::now())
    }

    pub fn check_thresholds_at(&self, now: Instant) -> bool {
        if !self.auto_recovery.load(Ordering::Acquire) || self.is_recovery_in_progress() {
            return false;
        }

        let thresholds = self.state.lock().thresholds;
        for severity in Severity::ALL.iter().rev() {
            let Some(limit) = thresholds[severity.index()] else {
                continue;
            };
            let count = self.count(*severity);
            if limit > 0 && count >= limit {
                let reason = format!("{} threshold exceeded: {} >= {}", severity, count, limit);
                return self.trigger_recovery_at(&reason, now);
            }
        }

        let serious: u64 = Severity::ALL
            .iter()
            .filter(|s| s.drives_recovery())
            .map(|s| self.count(*s))
            .sum();
        if serious >= self.config.max_error_count {
            let reason = format!(
                "error count {} reached limit {}",
                serious, self.config.max_error_count
            );
            return self.trigger_recovery_at(&reason, now);
        }
        false
    }

    /// Start recovery unless one is already in flight
    pub fn trigger_recovery(&self, reason: &str) -> bool {
        self.trigger_recovery_at(reason, Instant::now())
    }

    pub fn trigger_recovery_at(&self, reason: &str, now: Instant) -> bool {
        {
            let mut state = self.state.lock();
            let recovery = &mut state.recovery;
            if recovery.in_progress {
                drop(state);
                tracing::warn!(target: "fault", "Recovery already in progress, ignoring: {}", reason);
                return false;
            }
            recovery.in_progress = true;
            recovery.attempts = 1;
            recovery.due = Some(now + self.config.recovery_delay);
            recovery.reason = reason.to_string();
        }

        tracing::warn!(target: "fault", "Recovery triggered: {}", reason);
        self.events
            .emit(FaultEvent::RecoveryTriggered(reason.to_string()));
        true
    }

    /// Advance the recovery state machine
    ///
    /// Returns `Some(success)` when a recovery finished on this call.
    pub fn poll_recovery(&self) -> Option<bool> {
        self.poll_recovery_at(Instant::now())
    }

    pub fn poll_recovery_at(&self, now: Instant) -> Option<bool> {
        {
            let mut state = self.state.lock();
            let recovery = &mut state.recovery;
            let ready = matches!(recovery.due, Some(due) if recovery.in_progress && now >= due);
            if !ready {
                return None;
            }
            recovery.due = None;
        }

        let success = self.run_recovery_actions();

        let mut state = self.state.lock();
        if success {
            let reason = std::mem::take(&mut state.recovery.reason);
            state.recovery = RecoveryState::default();
            state.history.clear();
            let discarded = state.queue.len();
            state.queue.clear();
            drop(state);
            if discarded > 0 {
                tracing::debug!(target: "fault", "Recovery discarded {} undispatched records", discarded);
            }
            self.reset_counters();
            tracing::info!(target: "fault", "Recovery completed: {}", reason);
            self.events.emit(FaultEvent::RecoveryCompleted(true));
            return Some(true);
        }

        if state.recovery.attempts < self.config.max_recovery_attempts {
            state.recovery.attempts += 1;
            state.recovery.due = Some(now + self.config.recovery_backoff);
            let attempt = state.recovery.attempts;
            drop(state);
            tracing::warn!(
                target: "fault",
                "Recovery attempt failed, retrying (attempt {} of {})",
                attempt,
                self.config.max_recovery_attempts
            );
            return None;
        }

        state.recovery = RecoveryState::default();
        drop(state);
        tracing::error!(target: "fault", "Recovery failed after {} attempts", self.config.max_recovery_attempts);
        self.events.emit(FaultEvent::RecoveryCompleted(false));
        Some(false)
    }

    fn run_recovery_actions(&self) -> bool {
        let actions: Vec<(String, RecoveryAction)> = self.actions.read().clone();
        let mut success = true;
        for (name, action) in &actions {
            match catch_unwind(AssertUnwindSafe(|| action())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(target: "fault", "Recovery action {} failed: {:#}", name, e);
                    success = false;
                }
                Err(_) => {
                    tracing::error!(target: "fault", "Recovery action {} panicked", name);
                    success = false;
                }
            }
        }
        success
    }

    /// Clear history and pending queue; resets counters
    pub fn clear_history(&self) {
        let discarded = {
            let mut state = self.state.lock();
            state.history.clear();
            let discarded = state.queue.len();
            state.queue.clear();
            discarded
        };
        if discarded > 0 {
            tracing::debug!(target: "fault", "Cleared {} undispatched records", discarded);
        }
        self.reset_counters();
    }

    fn reset_counters(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Release);
        }
    }

    /// Set a trigger count; zero disables the threshold
    pub fn set_threshold(&self, severity: Severity, count: u64) {
        self.state.lock().thresholds[severity.index()] = (count > 0).then_some(count);
    }

    pub fn threshold(&self, severity: Severity) -> Option<u64> {
        self.state.lock().thresholds[severity.index()]
    }

    pub fn set_auto_recovery(&self, enabled: bool) {
        self.auto_recovery.store(enabled, Ordering::Release);
    }

    /// Last `n` records, oldest first
    pub fn recent(&self, n: usize) -> Vec<FaultRecord> {
        self.state.lock().history.tail(n).cloned().collect()
    }

    pub fn by_category(&self, category: &str) -> Vec<FaultRecord> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|r| r.category == category)
            .cloned()
            .collect()
    }

    #[inline]
    pub fn count(&self, severity: Severity) -> u64 {
        self.counters[severity.index()].load(Ordering::Acquire)
    }

    pub fn total_count(&self) -> u64 {
        self.counters.iter().map(|c| c.load(Ordering::Acquire)).sum()
    }

    /// Records dropped from the pending queue on overflow
    pub fn dropped_count(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn has_unhandled(&self) -> bool {
        self.state.lock().history.iter().any(|r| !r.handled)
    }

    pub fn mark_all_handled(&self) {
        let mut state = self.state.lock();
        for record in state.history.iter_mut() {
            record.handled = true;
        }
    }

    pub fn is_recovery_in_progress(&self) -> bool {
        self.state.lock().recovery.in_progress
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.state.lock().recovery.attempts
    }

    pub fn subscribe(&self) -> Subscription<FaultEvent> {
        self.events.subscribe()
    }

    /// Per-severity counter summary
    pub fn report_text(&self) -> String {
        let mut out = String::from("Faults:\n");
        for severity in Severity::ALL {
            out.push_str(&format!("  {:<9} {}\n", severity.name(), self.count(severity)));
        }
        out.push_str(&format!(
            "  recovery in progress: {}\n",
            self.is_recovery_in_progress()
        ));
        out
    }
}

impl Default for FaultSink {
    fn default() -> Self {
        Self::new(FaultSinkConfig::default())
    }
}

impl ReportFault for FaultSink {
    fn report_fault(&self, severity: Severity, category: &str, message: &str, source: &str) {
        let source = (!source.is_empty()).then_some(source);
        self.report(severity, category, message, source, None);
    }
}

impl Drop for FaultSink {
    fn drop(&mut self) {
        if let Some(timers) = self.timers.get_mut().take() {
            timers.stop();
        }
    }
}

fn log_record(record: &FaultRecord) {
    match record.severity {
        Severity::Info => crate::log_fault!(tracing::Level::INFO, "{}", record),
        Severity::Warning => tracing::warn!(target: "fault", "{}", record),
        Severity::Error | Severity::Critical => tracing::error!(target: "fault", "{}", record),
        Severity::Fatal => tracing::error!(target: "fault", fatal = true, "{}", record),
    }
}
