//! Performance substrate daemon
//!
//! Loads the configuration, wires the services against the host's procfs
//! probe and runs until Ctrl-C, logging a diagnostic report on exit.

use perf_substrate::infrastructure::logging::init_logging;
use perf_substrate::metrics::LinuxProbe;
use perf_substrate::{Config, Substrate};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Guards flush the file appenders on drop
    let _guards = init_logging("logs")?;

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(target: "substrate", "Failed to load config, using defaults: {}", e);
            Config::default()
        }
    };

    let substrate = Substrate::new(config, Arc::new(LinuxProbe::new()));
    substrate.start()?;
    tracing::info!(target: "substrate", "Running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!(target: "substrate", "Shutdown requested");

    tracing::info!(target: "substrate", "{}", substrate.diagnostic_report());
    substrate.shutdown();
    Ok(())
}
