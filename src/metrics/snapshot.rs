//! Point-in-time system and process readings

use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// One sample of system, process and custom metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// System-wide CPU usage, percent
    pub cpu_usage: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_used: u64,
    pub disk_total: u64,
    /// Bytes received since the previous sample, loopback excluded
    pub net_in: u64,
    pub net_out: u64,
    /// Resident set size of this process
    pub process_memory: u64,
    /// Process CPU usage normalized by CPU count, percent
    pub process_cpu: f64,
    pub thread_count: u32,
    pub custom: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    /// Empty sample stamped `timestamp`
    pub fn at(timestamp: OffsetDateTime) -> Self {
        Self {
            timestamp,
            cpu_usage: 0.0,
            memory_used: 0,
            memory_total: 0,
            disk_used: 0,
            disk_total: 0,
            net_in: 0,
            net_out: 0,
            process_memory: 0,
            process_cpu: 0.0,
            thread_count: 0,
            custom: BTreeMap::new(),
        }
    }

    pub fn memory_usage_percent(&self) -> f64 {
        percent(self.memory_used, self.memory_total)
    }

    pub fn disk_usage_percent(&self) -> f64 {
        percent(self.disk_used, self.disk_total)
    }

    /// Process resident memory as a percent of total memory
    pub fn process_memory_percent(&self) -> f64 {
        percent(self.process_memory, self.memory_total)
    }

    /// Resolve an alert metric path
    ///
    /// Built-in names are checked first, then custom metrics.
    pub fn value(&self, path: &str) -> Option<f64> {
        let v = match path {
            "cpu_usage" => self.cpu_usage,
            "memory_usage" => self.memory_usage_percent(),
            "memory_used" => self.memory_used as f64,
            "disk_usage" => self.disk_usage_percent(),
            "proc_memory" => self.process_memory as f64,
            "proc_cpu_usage" => self.process_cpu,
            "thread_count" => self.thread_count as f64,
            "net_in" => self.net_in as f64,
            "net_out" => self.net_out as f64,
            other => return self.custom.get(other).copied(),
        };
        Some(v)
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}
