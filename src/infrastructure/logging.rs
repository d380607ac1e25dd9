//! Per-component rolling file logs
//!
//! Writes logs to files under a log directory, separated by log type:
//! - main/ - all events, JSON
//! - error/ - WARN and ERROR only
//! - fault/ - fault sink ingestion and recovery
//! - memory/ - buffer pool and block allocator
//! - scheduler/ - update scheduler
//! - metrics/ - metrics collector

use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log subdirectories created by [`init_logging`]
pub const LOG_TYPES: [&str; 6] = ["main", "error", "fault", "memory", "scheduler", "metrics"];

/// Install the file and console subscriber
///
/// Creates `dir` and one subdirectory per log type. Returns the worker
/// guards, which must be kept alive for the duration of the program.
///
/// # Errors
/// Returns an IO error if a log directory cannot be created.
pub fn init_logging<P: AsRef<Path>>(dir: P) -> std::io::Result<Vec<WorkerGuard>> {
    let logs_dir = dir.as_ref();
    for log_type in &LOG_TYPES {
        fs::create_dir_all(logs_dir.join(log_type))?;
    }

    let mut guards = Vec::new();
    let mut appender = |name: &str| {
        let (writer, guard) = create_appender(&logs_dir.join(name), name);
        guards.push(guard);
        writer
    };

    let main_appender = appender("main");
    let error_appender = appender("error");
    let fault_appender = appender("fault");
    let memory_appender = appender("memory");
    let scheduler_appender = appender("scheduler");
    let metrics_appender = appender("metrics");

    // Main log - all logs
    let main_layer = tracing_subscriber::fmt::layer()
        .with_writer(main_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .json();

    // Error log - ERROR and WARN only
    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::LevelFilter::WARN);

    let fault_layer = tracing_subscriber::fmt::layer()
        .with_writer(fault_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target().starts_with("fault")
        }));

    let memory_layer = tracing_subscriber::fmt::layer()
        .with_writer(memory_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target().starts_with("buffer_pool")
                || metadata.target().starts_with("allocator")
        }));

    let scheduler_layer = tracing_subscriber::fmt::layer()
        .with_writer(scheduler_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target().starts_with("scheduler")
        }));

    let metrics_layer = tracing_subscriber::fmt::layer()
        .with_writer(metrics_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target().starts_with("metrics")
        }));

    // Console layer for development
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(main_layer)
        .with(error_layer)
        .with(fault_layer)
        .with(memory_layer)
        .with(scheduler_layer)
        .with(metrics_layer)
        .with(console_layer)
        .init();

    tracing::info!(
        target: "substrate",
        "Logging system initialized. Log files in {}",
        logs_dir.display()
    );

    Ok(guards)
}

/// Console-only subscriber for tests and tools
///
/// Safe to call repeatedly; only the first call installs a subscriber.
pub fn init_console_logging() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_test_writer(),
        )
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Daily appender under `dir`
fn create_appender(dir: &Path, name: &str) -> (NonBlocking, WorkerGuard) {
    let appender = RollingFileAppender::new(Rotation::DAILY, dir, name);
    tracing_appender::non_blocking(appender)
}

/// Shorthand for events on the component log targets
#[macro_export]
macro_rules! log_fault {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "fault", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_memory {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "allocator", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_scheduler {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "scheduler", $level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_metrics {
    ($level:expr, $($arg:tt)+) => {
        tracing::event!(target: "metrics", $level, $($arg)+)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_creation() {
        let test_dir = std::env::temp_dir().join(format!("perf_logs_test_{}", std::process::id()));
        if test_dir.exists() {
            fs::remove_dir_all(&test_dir).ok();
        }

        for log_type in &LOG_TYPES {
            fs::create_dir_all(test_dir.join(log_type)).unwrap();
        }
        assert!(test_dir.join("scheduler").exists());
        assert!(test_dir.join("memory").exists());

        fs::remove_dir_all(&test_dir).ok();
    }

    #[test]
    fn test_console_logging_is_idempotent() {
        init_console_logging();
        init_console_logging();
        crate::log_scheduler!(tracing::Level::DEBUG, "console logging ready");
    }
}
