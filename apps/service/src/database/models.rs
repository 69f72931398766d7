use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitoring::types::{ProbeResult, TargetStatus};

/// Target model - one monitored endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Unique key, stable across reloads
    pub key: String,
    /// `http(s)://…`, `tcp://host:port`, `host:port` or a bare host
    pub address: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Target {
    /// Create an enabled target
    pub fn new(key: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            address: address.into(),
            label: String::new(),
            category: String::new(),
            enabled: true,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Snapshot model - latest known status of a target as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: String,
    pub status: TargetStatus,
    pub latency_ms: Option<u64>,
    pub checked_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl From<&ProbeResult> for Snapshot {
    fn from(result: &ProbeResult) -> Self {
        Self {
            key: result.key.clone(),
            status: result.status(),
            latency_ms: result.latency_ms,
            checked_at: result.timestamp,
            error: result.error.as_ref().map(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::checker::ProbeError;

    #[test]
    fn test_target_deserializes_with_defaults() {
        let target: Target = toml::from_str("key = \"gate-1\"\naddress = \"10.0.0.1\"").unwrap();
        assert_eq!(target, Target::new("gate-1", "10.0.0.1"));
        assert!(target.enabled);
    }

    #[test]
    fn test_snapshot_from_failed_probe() {
        let result = ProbeResult::failed("gate-1", ProbeError::Timeout(3000), Utc::now());
        let snapshot = Snapshot::from(&result);
        assert_eq!(snapshot.status, TargetStatus::Offline);
        assert_eq!(snapshot.error.as_deref(), Some("timed out after 3000 ms"));
    }
}
