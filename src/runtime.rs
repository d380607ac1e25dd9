//! Service wiring
//!
//! Builds the five services from one [`Config`] and connects them with
//! weak back-references: metrics feed the scheduler and trigger
//! allocator cleanup under memory pressure, recovery cleans both pools,
//! and every service reports faults to the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::allocator::BlockAllocator;
use crate::buffers::BufferPool;
use crate::fault::{FaultReporter, FaultSink, ReportFault};
use crate::infrastructure::config::Config;
use crate::metrics::{MetricsCollector, SystemProbe};
use crate::scheduler::UpdateScheduler;
use crate::{Result, SubstrateError};

/// The wired set of services
pub struct Substrate {
    config: Config,
    faults: Arc<FaultSink>,
    buffers: Arc<BufferPool>,
    allocator: Arc<BlockAllocator>,
    metrics: Arc<MetricsCollector>,
    scheduler: Arc<UpdateScheduler>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl Substrate {
    /// Construct and wire every service; nothing runs until [`start`](Self::start)
    pub fn new(config: Config, probe: Arc<dyn SystemProbe>) -> Self {
        let faults = Arc::new(FaultSink::new(config.fault_sink()));
        let buffers = Arc::new(BufferPool::new());
        let allocator = Arc::new(BlockAllocator::new(config.allocator()));
        let metrics = Arc::new(MetricsCollector::new(config.collector(), probe));
        let scheduler = Arc::new(UpdateScheduler::new(config.scheduler()));

        let sink: Arc<dyn ReportFault> = faults.clone();
        buffers.set_fault_reporter(FaultReporter::new("buffer_pool", &sink));
        allocator.set_fault_reporter(FaultReporter::new("allocator", &sink));
        metrics.set_fault_reporter(FaultReporter::new("metrics", &sink));
        scheduler.set_fault_reporter(FaultReporter::new("scheduler", &sink));

        let weak = Arc::downgrade(&allocator);
        metrics.on_memory_pressure("allocator_cleanup", move |_| {
            if let Some(allocator) = weak.upgrade() {
                allocator.perform_cleanup();
            }
        });
        let weak = Arc::downgrade(&scheduler);
        metrics.register_callback("scheduler_tuning", move |snapshot| {
            if let Some(scheduler) = weak.upgrade() {
                scheduler.observe_metrics(snapshot);
            }
        });

        let weak = Arc::downgrade(&buffers);
        faults.register_recovery_action("buffer_pool_cleanup", move || {
            if let Some(buffers) = weak.upgrade() {
                buffers.cleanup_idle();
            }
            Ok(())
        });
        let weak = Arc::downgrade(&allocator);
        faults.register_recovery_action("allocator_cleanup", move || {
            if let Some(allocator) = weak.upgrade() {
                allocator.perform_cleanup();
            }
            Ok(())
        });

        tracing::debug!(target: "substrate", "Services wired");
        Self {
            config,
            faults,
            buffers,
            allocator,
            metrics,
            scheduler,
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Initialize the buffer pool and start every timer
    ///
    /// # Errors
    /// `NoRuntime` outside a tokio runtime, `ShutDown` after
    /// [`shutdown`](Self::shutdown), or a buffer pool configuration error.
    pub fn start(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SubstrateError::ShutDown("substrate"));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.start_services();
        if result.is_err() {
            self.started.store(false, Ordering::Release);
        }
        result
    }

    fn start_services(&self) -> Result<()> {
        self.faults.start()?;
        self.buffers.initialize(self.config.buffer_pool())?;
        self.buffers.start()?;
        self.allocator.start()?;
        self.metrics.start()?;
        self.scheduler.start()?;
        tracing::info!(target: "substrate", "Substrate started");
        Ok(())
    }

    /// Stop services in reverse start order; idempotent
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.shutdown();
        self.metrics.stop();
        self.allocator.shutdown();
        self.buffers.shutdown();
        self.faults.shutdown();
        tracing::info!(target: "substrate", "Substrate shut down");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shut_down.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn faults(&self) -> &Arc<FaultSink> {
        &self.faults
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    pub fn allocator(&self) -> &Arc<BlockAllocator> {
        &self.allocator
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn scheduler(&self) -> &Arc<UpdateScheduler> {
        &self.scheduler
    }

    /// Combined diagnostic text from every service
    pub fn diagnostic_report(&self) -> String {
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| String::from("unknown time"));
        let mut out = format!("=== Performance report ({}) ===\n", now);
        for section in [
            self.faults.report_text(),
            self.buffers.report(),
            self.allocator.memory_report(),
            self.metrics.report(),
            self.scheduler.report(),
        ] {
            out.push_str(&section);
        }
        out
    }
}
