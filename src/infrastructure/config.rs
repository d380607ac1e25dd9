//! Configuration management for the performance substrate
//!
//! Loads a single structured document (JSON, or TOML by extension) at
//! startup. Every value has a default, unknown keys are ignored, and the
//! raw document stays available for dotted-key lookups.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::allocator::AllocatorConfig;
use crate::buffers::PoolConfig;
use crate::core::SizeClass;
use crate::fault::FaultSinkConfig;
use crate::metrics::CollectorConfig;
use crate::scheduler::SchedulerConfig;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "PERF_CONFIG_PATH";

/// Default config file name
pub const DEFAULT_CONFIG_FILE: &str = "performance_config.json";

/// Substrate configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub performance_monitoring: MonitoringConfig,

    #[serde(default)]
    pub optimization_parameters: OptimizationParameters,

    /// Document as loaded, for dotted-key access
    #[serde(skip)]
    raw: serde_json::Value,
}

/// Sampling and threshold settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,

    #[serde(default)]
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Thresholds {
    #[serde(default = "default_memory_usage_percent")]
    pub memory_usage_percent: f64,

    #[serde(default = "default_cpu_usage_percent")]
    pub cpu_usage_percent: f64,

    #[serde(default = "default_database_query_time_ms")]
    pub database_query_time_ms: u64,

    #[serde(default = "default_ui_response_time_ms")]
    pub ui_response_time_ms: u64,

    #[serde(default = "default_communication_timeout_ms")]
    pub communication_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OptimizationParameters {
    #[serde(default)]
    pub database_connection_pool: DatabasePoolConfig,

    #[serde(default)]
    pub memory_optimizer: MemoryOptimizerConfig,

    #[serde(default)]
    pub ui_update_optimizer: UiUpdateConfig,

    #[serde(default)]
    pub communication_buffer: CommunicationBufferConfig,
}

/// Carried for the host application; not consumed by the substrate
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabasePoolConfig {
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryOptimizerConfig {
    #[serde(default = "default_true")]
    pub enable_object_pool: bool,

    #[serde(default = "default_true")]
    pub enable_memory_tracking: bool,

    #[serde(default = "default_true")]
    pub enable_auto_cleanup: bool,

    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UiUpdateConfig {
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    #[serde(default = "default_true")]
    pub enable_adaptive_tuning: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommunicationBufferConfig {
    #[serde(default = "default_buffer_size_kb")]
    pub buffer_size_kb: usize,

    #[serde(default = "default_max_buffers")]
    pub max_buffers: usize,

    #[serde(default = "default_communication_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_true")]
    pub compression_enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling_interval_ms: default_sampling_interval_ms(),
            thresholds: Thresholds::default(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            memory_usage_percent: default_memory_usage_percent(),
            cpu_usage_percent: default_cpu_usage_percent(),
            database_query_time_ms: default_database_query_time_ms(),
            ui_response_time_ms: default_ui_response_time_ms(),
            communication_timeout_ms: default_communication_timeout_ms(),
        }
    }
}

impl Default for DatabasePoolConfig {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            connection_timeout_ms: default_connection_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl Default for MemoryOptimizerConfig {
    fn default() -> Self {
        Self {
            enable_object_pool: true,
            enable_memory_tracking: true,
            enable_auto_cleanup: true,
            cleanup_interval_ms: default_cleanup_interval_ms(),
            memory_threshold_mb: default_memory_threshold_mb(),
        }
    }
}

impl Default for UiUpdateConfig {
    fn default() -> Self {
        Self {
            max_fps: default_max_fps(),
            batch_size: default_batch_size(),
            update_interval_ms: default_update_interval_ms(),
            enable_adaptive_tuning: true,
        }
    }
}

impl Default for CommunicationBufferConfig {
    fn default() -> Self {
        Self {
            buffer_size_kb: default_buffer_size_kb(),
            max_buffers: default_max_buffers(),
            timeout_ms: default_communication_timeout_ms(),
            compression_enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_sampling_interval_ms() -> u64 {
    1000
}

fn default_memory_usage_percent() -> f64 {
    80.0
}

fn default_cpu_usage_percent() -> f64 {
    80.0
}

fn default_database_query_time_ms() -> u64 {
    100
}

fn default_ui_response_time_ms() -> u64 {
    50
}

fn default_communication_timeout_ms() -> u64 {
    5000
}

fn default_min_connections() -> u32 {
    5
}

fn default_max_connections() -> u32 {
    20
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_memory_threshold_mb() -> u64 {
    512
}

fn default_max_fps() -> u32 {
    60
}

fn default_batch_size() -> usize {
    10
}

fn default_update_interval_ms() -> u64 {
    16
}

fn default_buffer_size_kb() -> usize {
    64
}

fn default_max_buffers() -> usize {
    1000
}

impl Config {
    /// Load configuration from the file named by `PERF_CONFIG_PATH`
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(config_path)
    }

    /// Load from an explicit path; `.toml` files are parsed as TOML
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let is_toml = path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("toml"))
                    .unwrap_or(false);
                if is_toml {
                    Self::from_toml_str(&contents)
                } else {
                    Self::from_json_str(&contents)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(target: "substrate", "Config {} not found, using defaults", path.display());
                Ok(Config::default())
            }
            Err(e) => Err(ConfigError::IoError(e)),
        }
    }

    /// Parse a JSON document
    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let raw: serde_json::Value =
            serde_json::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let mut config: Config = serde_json::from_value(raw.clone())
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.raw = raw;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let table: toml::Table = contents
            .parse()
            .map_err(|e: toml::de::Error| ConfigError::ParseError(e.to_string()))?;
        config.raw =
            serde_json::to_value(table).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(config)
    }

    /// Dotted-key lookup, e.g. `performance_monitoring.thresholds.cpu_usage_percent`
    ///
    /// Falls back to the effective (defaulted) value when the key is
    /// absent from the loaded document.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        if let Some(v) = lookup(&self.raw, key) {
            return Some(v.clone());
        }
        let effective = serde_json::to_value(self).ok()?;
        lookup(&effective, key).cloned()
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    /// Fault sink settings (no configurable keys; defaults)
    pub fn fault_sink(&self) -> FaultSinkConfig {
        FaultSinkConfig::default()
    }

    /// Byte-buffer pool settings
    pub fn buffer_pool(&self) -> PoolConfig {
        let comm = &self.optimization_parameters.communication_buffer;
        let mut pool = PoolConfig::default();
        pool.max_pool_size = comm.max_buffers.max(4);
        let large = comm.buffer_size_kb.saturating_mul(1024);
        let medium = pool.classes.capacity(SizeClass::Medium).unwrap_or(0);
        let huge = pool.classes.capacity(SizeClass::Huge).unwrap_or(usize::MAX);
        if large > medium && large < huge {
            pool.classes.set_capacity(SizeClass::Large, large);
        } else {
            tracing::warn!(
                target: "substrate",
                "buffer_size_kb {} does not fit between medium and huge classes, keeping default",
                comm.buffer_size_kb
            );
        }
        pool
    }

    /// Block allocator settings
    pub fn allocator(&self) -> AllocatorConfig {
        let mem = &self.optimization_parameters.memory_optimizer;
        AllocatorConfig {
            enable_object_pools: mem.enable_object_pool,
            enable_tracking: mem.enable_memory_tracking,
            enable_auto_cleanup: mem.enable_auto_cleanup,
            cleanup_interval: Duration::from_millis(mem.cleanup_interval_ms.max(1000)),
            memory_threshold: mem.memory_threshold_mb.saturating_mul(1024 * 1024) as usize,
            ..AllocatorConfig::default()
        }
    }

    /// Metrics collector settings
    pub fn collector(&self) -> CollectorConfig {
        let mon = &self.performance_monitoring;
        CollectorConfig {
            enabled: mon.enabled,
            interval: Duration::from_millis(mon.sampling_interval_ms),
            memory_threshold_percent: mon.thresholds.memory_usage_percent,
            ..CollectorConfig::default()
        }
    }

    /// Update scheduler settings
    pub fn scheduler(&self) -> SchedulerConfig {
        let ui = &self.optimization_parameters.ui_update_optimizer;
        SchedulerConfig {
            target_fps: ui.max_fps.max(1),
            max_batch: ui.batch_size.max(1),
            tick_interval: Duration::from_millis(ui.update_interval_ms.max(1)),
            adaptive_tuning: ui.enable_adaptive_tuning,
            cpu_threshold: self.performance_monitoring.thresholds.cpu_usage_percent,
            ..SchedulerConfig::default()
        }
    }
}

fn lookup<'a>(root: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
    let mut node = root;
    for part in key.split('.') {
        node = node.as_object()?.get(part)?;
    }
    Some(node)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading file
    IoError(std::io::Error),
    /// Parse error (invalid JSON or TOML)
    ParseError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::ParseError(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.performance_monitoring.enabled);
        assert_eq!(config.performance_monitoring.sampling_interval_ms, 1000);
        assert_eq!(config.performance_monitoring.thresholds.memory_usage_percent, 80.0);
        assert_eq!(
            config.optimization_parameters.database_connection_pool.max_connections,
            20
        );
        assert_eq!(config.optimization_parameters.ui_update_optimizer.max_fps, 60);
        assert_eq!(
            config.optimization_parameters.communication_buffer.buffer_size_kb,
            64
        );
    }

    #[test]
    fn test_partial_json_with_unknown_keys() {
        let doc = r#"{
            "performance_monitoring": {
                "sampling_interval_ms": 250,
                "thresholds": { "cpu_usage_percent": 65.5 },
                "future_knob": 7
            },
            "something_else": { "x": 1 }
        }"#;
        let config = Config::from_json_str(doc).unwrap();
        assert_eq!(config.performance_monitoring.sampling_interval_ms, 250);
        assert_eq!(config.performance_monitoring.thresholds.cpu_usage_percent, 65.5);
        // Missing keys keep defaults
        assert_eq!(config.performance_monitoring.thresholds.memory_usage_percent, 80.0);
        assert_eq!(config.get_u64("something_else.x"), Some(1));
    }

    #[test]
    fn test_dotted_get_falls_back_to_defaults() {
        let config = Config::default();
        assert_eq!(
            config.get_u64("optimization_parameters.memory_optimizer.memory_threshold_mb"),
            Some(512)
        );
        assert_eq!(
            config.get_bool("optimization_parameters.communication_buffer.compression_enabled"),
            Some(true)
        );
        assert_eq!(config.get("no.such.key"), None);
    }

    #[test]
    fn test_toml_document() {
        let doc = r#"
            [optimization_parameters.ui_update_optimizer]
            max_fps = 30
            batch_size = 4
        "#;
        let config = Config::from_toml_str(doc).unwrap();
        let sched = config.scheduler();
        assert_eq!(sched.target_fps, 30);
        assert_eq!(sched.max_batch, 4);
        assert_eq!(
            config.get_u64("optimization_parameters.ui_update_optimizer.max_fps"),
            Some(30)
        );
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let result = Config::from_json_str("{ not json");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = Config::load_from("definitely/not/here.json").unwrap();
        assert_eq!(config.performance_monitoring.sampling_interval_ms, 1000);
    }

    #[test]
    fn test_component_projections() {
        let doc = r#"{
            "optimization_parameters": {
                "communication_buffer": { "buffer_size_kb": 128, "max_buffers": 200 },
                "memory_optimizer": { "memory_threshold_mb": 64, "enable_object_pool": false }
            }
        }"#;
        let config = Config::from_json_str(doc).unwrap();

        let pool = config.buffer_pool();
        assert_eq!(pool.max_pool_size, 200);
        assert_eq!(pool.classes.capacity(SizeClass::Large), Some(128 * 1024));

        let alloc = config.allocator();
        assert_eq!(alloc.memory_threshold, 64 * 1024 * 1024);
        assert!(!alloc.enable_object_pools);

        let collector = config.collector();
        assert_eq!(collector.interval, Duration::from_millis(1000));
    }
}
