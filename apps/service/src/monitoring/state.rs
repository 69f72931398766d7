use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::{ProbeResult, TargetStatus};
use crate::database::models::Target;

/// Rules deciding when a status change becomes a signal
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPolicy {
    /// Minimum time between two signals for the same target
    pub debounce: Duration,
    /// Number of recent reachability outcomes inspected for flapping
    pub flap_window: usize,
    /// More flips than this inside the window marks the target unstable
    pub max_flips: usize,
    /// Consecutive same-direction outcomes that clear the unstable flag
    pub stabilization_count: u32,
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(60),
            flap_window: 10,
            max_flips: 4,
            stabilization_count: 5,
        }
    }
}

/// Observed state of one target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub status: TargetStatus,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_transition_at: Option<DateTime<Utc>>,
    /// Notifications are muted while set
    pub unstable: bool,
    pub last_error: Option<String>,
}

/// A status change that passed debounce and flap suppression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub key: String,
    pub address: String,
    pub label: String,
    pub old_status: TargetStatus,
    pub new_status: TargetStatus,
    pub latency_ms: Option<u64>,
    pub at: DateTime<Utc>,
    /// First signal after the target settled down from flapping
    pub after_flapping: bool,
}

/// Per-target state machine
///
/// Consumes probe results and decides whether a change is worth reporting.
/// The reported status is what observers last heard about; the observed
/// status in [`TargetState`] always follows the latest probe.
#[derive(Debug, Clone)]
pub struct TargetMonitor {
    target: Target,
    state: TargetState,
    reported: Option<TargetStatus>,
    last_signaled_at: Option<DateTime<Utc>>,
    outcomes: VecDeque<bool>,
    settled_from_flapping: bool,
}

impl TargetMonitor {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            state: TargetState::default(),
            reported: None,
            last_signaled_at: None,
            outcomes: VecDeque::new(),
            settled_from_flapping: false,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn state(&self) -> &TargetState {
        &self.state
    }

    /// Replace address, label and category; counters and history stay
    pub fn update_target(&mut self, target: Target) -> bool {
        if self.target == target {
            return false;
        }
        self.target = target;
        true
    }

    /// Fold one probe result into the state
    pub fn apply(&mut self, result: &ProbeResult, policy: &TransitionPolicy) -> Option<StatusChange> {
        let now = result.timestamp;
        let new_status = result.status();

        if result.reachable {
            self.state.consecutive_successes = self.state.consecutive_successes.saturating_add(1);
            self.state.consecutive_failures = 0;
        } else {
            self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
            self.state.consecutive_successes = 0;
        }

        if new_status != self.state.status {
            self.state.last_transition_at = Some(now);
        }
        self.state.status = new_status;
        self.state.last_probe_at = Some(now);
        self.state.latency_ms = result.latency_ms;
        self.state.last_error = result.error.as_ref().map(|e| e.to_string());

        self.track_flapping(result.reachable, policy);
        self.evaluate(now, policy)
    }

    fn track_flapping(&mut self, reachable: bool, policy: &TransitionPolicy) {
        if policy.flap_window == 0 {
            return;
        }

        self.outcomes.push_back(reachable);
        while self.outcomes.len() > policy.flap_window {
            self.outcomes.pop_front();
        }

        if self.state.unstable {
            let streak = self.state.consecutive_successes.max(self.state.consecutive_failures);
            if streak >= policy.stabilization_count {
                self.state.unstable = false;
                self.settled_from_flapping = true;
                self.outcomes.clear();
                info!(target = %self.target.key, "Target stabilized, notifications resumed");
            }
        } else if flips(&self.outcomes) > policy.max_flips {
            self.state.unstable = true;
            warn!(target = %self.target.key, "Target is flapping, notifications muted");
        }
    }

    fn evaluate(&mut self, now: DateTime<Utc>, policy: &TransitionPolicy) -> Option<StatusChange> {
        let current = self.state.status;

        // The first real observation sets the baseline silently
        let Some(reported) = self.reported else {
            self.reported = Some(current);
            return None;
        };

        if reported == current {
            return None;
        }

        if self.state.unstable {
            debug!(target = %self.target.key, %reported, %current, "Change suppressed while flapping");
            return None;
        }

        if let Some(last) = self.last_signaled_at {
            let elapsed = now.signed_duration_since(last).to_std().unwrap_or(Duration::ZERO);
            if elapsed < policy.debounce {
                debug!(target = %self.target.key, %reported, %current, "Change debounced");
                return None;
            }
        }

        self.reported = Some(current);
        self.last_signaled_at = Some(now);

        Some(StatusChange {
            key: self.target.key.clone(),
            address: self.target.address.clone(),
            label: self.target.label.clone(),
            old_status: reported,
            new_status: current,
            latency_ms: self.state.latency_ms,
            at: now,
            after_flapping: std::mem::take(&mut self.settled_from_flapping),
        })
    }
}

fn flips(outcomes: &VecDeque<bool>) -> usize {
    outcomes.iter().zip(outcomes.iter().skip(1)).filter(|(a, b)| a != b).count()
}
