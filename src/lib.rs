//! Runtime performance substrate for a host-PC application
//!
//! Cooperating in-process services:
//! - **fault**: classified fault ingestion, thresholds and recovery dispatch
//! - **buffers**: size-classed recycling of opaque byte buffers
//! - **allocator**: size-classed raw memory blocks and typed object pools
//! - **metrics**: periodic system/process sampling, rolling history, alerts
//! - **scheduler**: priority/coalescing update scheduler with adaptive cadence
//! - **runtime**: explicit wiring of the services above
//! - **infrastructure**: config, logging, timers, rolling windows

pub mod allocator;
pub mod buffers;
pub mod core;
pub mod fault;
pub mod infrastructure;
pub mod metrics;
pub mod runtime;
pub mod scheduler;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types
pub use fault::{FaultSink, Severity};
pub use infrastructure::config::Config;
pub use runtime::Substrate;

use thiserror::Error;

/// Main error type for lifecycle and configuration paths
///
/// Runtime faults inside components are reported to the fault sink,
/// not returned through this type.
#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    #[error("{0} is shut down")]
    ShutDown(&'static str),

    #[error("No tokio runtime available to start timers")]
    NoRuntime,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("System probe error: {0}")]
    Probe(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<infrastructure::config::ConfigError> for SubstrateError {
    fn from(e: infrastructure::config::ConfigError) -> Self {
        SubstrateError::Config(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SubstrateError>;
