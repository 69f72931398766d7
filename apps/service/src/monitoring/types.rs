use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::checker::ProbeError;

/// Status of a monitored target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    #[default]
    Unknown,
    Online,
    Offline,
    Error,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetStatus::Unknown => write!(f, "unknown"),
            TargetStatus::Online => write!(f, "online"),
            TargetStatus::Offline => write!(f, "offline"),
            TargetStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for TargetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(TargetStatus::Unknown),
            "online" => Ok(TargetStatus::Online),
            "offline" => Ok(TargetStatus::Offline),
            "error" => Ok(TargetStatus::Error),
            other => Err(format!("invalid target status: {other}")),
        }
    }
}

/// Outcome of one probe execution
///
/// Produced once by the probe runner and consumed by the target's monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Key of the target that was probed
    pub key: String,

    /// Whether the target answered
    pub reachable: bool,

    /// Round trip in milliseconds (reachable results only)
    pub latency_ms: Option<u64>,

    /// When the probe completed
    pub timestamp: DateTime<Utc>,

    /// Why the probe failed, if it did
    pub error: Option<ProbeError>,
}

impl ProbeResult {
    /// A successful probe
    pub fn reachable(key: impl Into<String>, latency: Duration, timestamp: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            reachable: true,
            latency_ms: Some(latency.as_millis() as u64),
            timestamp,
            error: None,
        }
    }

    /// A failed probe (unreachable, timed out, or faulted)
    pub fn failed(key: impl Into<String>, error: ProbeError, timestamp: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            reachable: false,
            latency_ms: None,
            timestamp,
            error: Some(error),
        }
    }

    /// Status implied by this single result
    pub fn status(&self) -> TargetStatus {
        match (&self.error, self.reachable) {
            (_, true) => TargetStatus::Online,
            (Some(error), false) if error.is_fault() => TargetStatus::Error,
            _ => TargetStatus::Offline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_result() {
        let now = Utc::now();
        let up = ProbeResult::reachable("a", Duration::from_millis(12), now);
        assert_eq!(up.status(), TargetStatus::Online);
        assert_eq!(up.latency_ms, Some(12));

        let down = ProbeResult::failed("a", ProbeError::Timeout(3000), now);
        assert_eq!(down.status(), TargetStatus::Offline);
        assert!(down.latency_ms.is_none());

        let fault = ProbeResult::failed("a", ProbeError::Fault("boom".into()), now);
        assert_eq!(fault.status(), TargetStatus::Error);
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in [
            TargetStatus::Unknown,
            TargetStatus::Online,
            TargetStatus::Offline,
            TargetStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<TargetStatus>(), Ok(status));
        }
        assert!("sideways".parse::<TargetStatus>().is_err());
    }
}
