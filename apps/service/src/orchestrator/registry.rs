use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::database::models::Target;
use crate::monitoring::state::{StatusChange, TargetMonitor, TargetState, TransitionPolicy};
use crate::monitoring::types::ProbeResult;

/// Outcome of reconciling the monitor set against a fresh target list
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub active: usize,
}

impl ReconcileSummary {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Read-only copy of one monitor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSnapshot {
    pub target: Target,
    pub state: TargetState,
}

/// The live set of target monitors
///
/// Readers always get copies; the set itself is swapped in one step during
/// reconciliation so no reader sees a half-applied reload.
#[derive(Default)]
pub struct MonitorRegistry {
    monitors: RwLock<HashMap<String, TargetMonitor>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match monitors to the enabled targets in `targets`
    ///
    /// New keys get a fresh monitor, vanished or disabled keys are dropped,
    /// and monitors whose metadata changed keep their state.
    pub async fn reconcile(&self, targets: Vec<Target>) -> ReconcileSummary {
        let mut monitors = self.monitors.write().await;
        let mut previous = std::mem::take(&mut *monitors);
        let mut next = HashMap::with_capacity(targets.len());
        let mut summary = ReconcileSummary::default();

        for target in targets.into_iter().filter(|t| t.enabled) {
            let key = target.key.clone();
            if next.contains_key(&key) {
                warn!(target = %key, "Duplicate target key, keeping the first definition");
                continue;
            }

            let monitor = match previous.remove(&key) {
                Some(mut monitor) => {
                    if monitor.update_target(target) {
                        summary.updated.push(key.clone());
                    }
                    monitor
                }
                None => {
                    summary.added.push(key.clone());
                    TargetMonitor::new(target)
                }
            };
            next.insert(key, monitor);
        }

        summary.removed = previous.into_keys().collect();
        summary.added.sort();
        summary.removed.sort();
        summary.updated.sort();
        summary.active = next.len();

        *monitors = next;
        debug!(?summary, "Monitor set reconciled");
        summary
    }

    /// Feed results to their monitors; results for unknown keys are ignored
    pub async fn apply_results(&self, results: &[ProbeResult], policy: &TransitionPolicy) -> Vec<StatusChange> {
        let mut monitors = self.monitors.write().await;
        let mut changes = Vec::new();

        for result in results {
            match monitors.get_mut(&result.key) {
                Some(monitor) => changes.extend(monitor.apply(result, policy)),
                None => debug!(target = %result.key, "Result for a target removed mid-cycle"),
            }
        }

        changes
    }

    pub async fn snapshot(&self) -> Vec<TargetSnapshot> {
        let monitors = self.monitors.read().await;
        let mut snapshot: Vec<TargetSnapshot> = monitors.values().map(to_snapshot).collect();
        snapshot.sort_by(|a, b| a.target.key.cmp(&b.target.key));
        snapshot
    }

    pub async fn get(&self, key: &str) -> Option<TargetSnapshot> {
        self.monitors.read().await.get(key).map(to_snapshot)
    }

    pub async fn target(&self, key: &str) -> Option<Target> {
        self.monitors.read().await.get(key).map(|m| m.target().clone())
    }

    pub async fn targets(&self) -> Vec<Target> {
        let monitors = self.monitors.read().await;
        let mut targets: Vec<Target> = monitors.values().map(|m| m.target().clone()).collect();
        targets.sort_by(|a, b| a.key.cmp(&b.key));
        targets
    }

    pub async fn len(&self) -> usize {
        self.monitors.read().await.len()
    }
}

fn to_snapshot(monitor: &TargetMonitor) -> TargetSnapshot {
    TargetSnapshot { target: monitor.target().clone(), state: monitor.state().clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reconcile_add_update_remove() {
        let registry = MonitorRegistry::new();
        let summary = registry
            .reconcile(vec![Target::new("a", "10.0.0.1"), Target::new("b", "10.0.0.2")])
            .await;
        assert_eq!(summary.added, vec!["a", "b"]);
        assert_eq!(summary.active, 2);

        let policy = TransitionPolicy::default();
        let result = ProbeResult::reachable("a", Duration::from_millis(4), Utc::now());
        registry.apply_results(&[result], &policy).await;

        let summary = registry
            .reconcile(vec![
                Target::new("a", "10.0.0.1").with_label("renamed"),
                Target::new("b", "10.0.0.2").disabled(),
                Target::new("c", "10.0.0.3"),
            ])
            .await;
        assert_eq!(summary.added, vec!["c"]);
        assert_eq!(summary.removed, vec!["b"]);
        assert_eq!(summary.updated, vec!["a"]);

        let a = registry.get("a").await.unwrap();
        assert_eq!(a.target.label, "renamed");
        assert_eq!(a.state.consecutive_successes, 1);
        assert!(registry.get("b").await.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_same_set_is_unchanged() {
        let registry = MonitorRegistry::new();
        let targets = vec![Target::new("a", "10.0.0.1")];
        registry.reconcile(targets.clone()).await;
        assert!(registry.reconcile(targets).await.is_unchanged());
    }

    #[tokio::test]
    async fn test_results_for_unknown_keys_are_ignored() {
        let registry = MonitorRegistry::new();
        registry.reconcile(vec![Target::new("a", "10.0.0.1")]).await;

        let result = ProbeResult::reachable("ghost", Duration::from_millis(1), Utc::now());
        let changes = registry.apply_results(&[result], &TransitionPolicy::default()).await;
        assert!(changes.is_empty());
        assert_eq!(registry.len().await, 1);
    }
}
