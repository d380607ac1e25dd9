//! Threshold alerts over metric paths

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::fault::Severity;

/// What firing an alert does beyond events and alert callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    /// Events and callbacks only
    Notify,
    /// Also report a Warning fault
    #[default]
    Warning,
    /// Also report a Critical fault
    Critical,
}

impl AlertAction {
    pub fn severity(self) -> Option<Severity> {
        match self {
            AlertAction::Notify => None,
            AlertAction::Warning => Some(Severity::Warning),
            AlertAction::Critical => Some(Severity::Critical),
        }
    }
}

/// Alert definition
///
/// Fires when the metric at `metric_path` is at or above `threshold`,
/// at most once every `duration_s` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSpec {
    pub name: String,
    pub metric_path: String,
    pub threshold: f64,
    #[serde(default)]
    pub duration_s: u64,
    #[serde(default)]
    pub action: AlertAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AlertSpec {
    pub fn new(name: &str, metric_path: &str, threshold: f64) -> Self {
        Self {
            name: name.to_string(),
            metric_path: metric_path.to_string(),
            threshold,
            duration_s: 0,
            action: AlertAction::default(),
            enabled: true,
        }
    }

    pub fn duration(mut self, seconds: u64) -> Self {
        self.duration_s = seconds;
        self
    }

    pub fn action(mut self, action: AlertAction) -> Self {
        self.action = action;
        self
    }

    /// High CPU (80%) and high memory (85%) alerts, 30 s debounce
    pub fn defaults() -> Vec<AlertSpec> {
        vec![
            AlertSpec::new("High CPU Usage", "cpu_usage", 80.0).duration(30),
            AlertSpec::new("High Memory Usage", "memory_usage", 85.0).duration(30),
        ]
    }
}

/// A fired alert with the value that tripped it
#[derive(Debug, Clone, Serialize)]
pub struct FiredAlert {
    pub alert: AlertSpec,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_json() {
        let spec: AlertSpec = serde_json::from_str(
            r#"{"name":"q","metric_path":"queue_depth","threshold":10,"action":"critical"}"#,
        )
        .unwrap();
        assert_eq!(spec.duration_s, 0);
        assert!(spec.enabled);
        assert_eq!(spec.action.severity(), Some(Severity::Critical));
    }

    #[test]
    fn test_defaults() {
        let defaults = AlertSpec::defaults();
        assert_eq!(defaults.len(), 2);
        assert!(defaults.iter().all(|a| a.duration_s == 30));
    }
}
