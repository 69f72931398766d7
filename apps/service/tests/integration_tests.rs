//! Integration tests for the vigil engine
//!
//! These tests drive the assembled service the way the binaries do.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use common::engine;
use vigil_service::bus::{EventBus, EventKind};
use vigil_service::database::models::Target;
use vigil_service::monitoring::types::TargetStatus;
use vigil_service::shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownReason};

fn three_gates() -> Vec<Target> {
    vec![
        Target::new("gate-1", "10.0.0.1").with_label("Front door"),
        Target::new("gate-2", "10.0.0.2"),
        Target::new("gate-3", "10.0.0.3").with_category("backup"),
    ]
}

#[tokio::test]
async fn test_monitoring_loop_end_to_end() -> Result<()> {
    logger::try_init_for_tests();

    let e = engine(three_gates());
    e.probe.up("10.0.0.1");
    e.probe.up("10.0.0.2");
    e.probe.down("10.0.0.3");

    let mut events = e.service.bus().subscribe();
    e.service.start().await?;

    let summary = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let EventKind::CycleCompleted(summary) = event.kind {
                return Some(summary);
            }
        }
        None
    })
    .await?
    .expect("a completed cycle");

    assert_eq!((summary.total, summary.online, summary.offline), (3, 2, 1));
    assert!(summary.persisted);
    assert_eq!(e.store.snapshots().len(), 3);
    assert_eq!(e.store.snapshot("gate-3").map(|s| s.status), Some(TargetStatus::Offline));

    let report = e.service.shutdown(ShutdownReason::UserRequest).await.expect("first shutdown");
    assert_eq!(report.outcome(), ShutdownOutcome::Clean);
    assert!(!e.service.orchestrator().is_running().await);
    Ok(())
}

#[tokio::test]
async fn test_status_change_reaches_subscribers_after_persisting() -> Result<()> {
    let e = engine(three_gates());
    for address in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        e.probe.up(address);
    }
    let orchestrator = e.service.orchestrator();
    orchestrator.reload_targets().await;
    orchestrator.run_cycle_now().await?;

    let mut events = e.service.bus().subscribe();
    e.probe.down("10.0.0.1");
    orchestrator.run_cycle_now().await?;

    let received: Vec<_> = std::iter::from_fn(|| events.try_recv()).collect();
    let change = received
        .iter()
        .find_map(|event| match &event.kind {
            EventKind::StatusChanged(change) => Some(change.clone()),
            _ => None,
        })
        .expect("gate-1 went down");

    assert_eq!(change.key, "gate-1");
    assert_eq!(change.label, "Front door");
    assert_eq!((change.old_status, change.new_status), (TargetStatus::Online, TargetStatus::Offline));
    assert_eq!(e.store.snapshot("gate-1").map(|s| s.status), Some(TargetStatus::Offline));
    assert!(matches!(received.last().map(|e| &e.kind), Some(EventKind::CycleCompleted(_))));
    Ok(())
}

#[tokio::test]
async fn test_disabled_target_is_dropped_on_reload() -> Result<()> {
    let e = engine(three_gates());
    e.probe.up("10.0.0.1");
    let orchestrator = e.service.orchestrator();
    orchestrator.reload_targets().await;
    orchestrator.run_cycle_now().await?;

    assert!(e.store.set_enabled("gate-3", false));
    let summary = e.service.reload_configuration().await?;

    assert_eq!(summary.removed, vec!["gate-3"]);
    assert_eq!(summary.active, 2);
    assert!(orchestrator.target_state("gate-3").await.is_none());

    let kept = orchestrator.target_state("gate-1").await.expect("gate-1 is still monitored");
    assert_eq!(kept.state.consecutive_successes, 1);

    let cycle = orchestrator.run_cycle_now().await?;
    assert_eq!(cycle.total, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cached_check_expires_after_ttl() -> Result<()> {
    let e = engine(three_gates());
    e.probe.up("10.0.0.2");
    let orchestrator = e.service.orchestrator();
    orchestrator.reload_targets().await;

    assert!(orchestrator.check_target("gate-2", false).await?.reachable);

    e.probe.down("10.0.0.2");
    assert!(orchestrator.check_target("gate-2", false).await?.reachable, "served from cache");

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(!orchestrator.check_target("gate-2", false).await?.reachable);
    Ok(())
}

#[tokio::test]
async fn test_slow_subscriber_gets_first_events_only() {
    let bus = EventBus::new(3, 10);
    let mut slow = bus.subscribe();

    for _ in 0..5 {
        bus.publish(EventKind::MonitoringStopped);
    }

    let received: Vec<u64> = std::iter::from_fn(|| slow.try_recv()).map(|e| e.id).collect();
    assert_eq!(received, vec![1, 2, 3]);

    let stats = bus.stats();
    assert_eq!(stats.published, 5);
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.history, 5);
}

#[tokio::test(start_paused = true)]
async fn test_critical_timeout_skips_remaining_tasks() {
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
    let after_ran = Arc::new(AtomicBool::new(false));
    let late_ran = Arc::new(AtomicBool::new(false));

    coordinator.register_task("flush", 1, Duration::from_secs(1), false, || async { Ok(()) });
    coordinator.register_task("stop-monitoring", 2, Duration::from_millis(50), true, || async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    });
    let late = late_ran.clone();
    coordinator.register_task("close-event-bus", 3, Duration::from_secs(1), false, move || async move {
        late.store(true, Ordering::SeqCst);
        Ok(())
    });
    let after = after_ran.clone();
    coordinator.after_shutdown("farewell", move || async move {
        after.store(true, Ordering::SeqCst);
        Ok(())
    });

    let report = coordinator.shutdown(ShutdownReason::Terminate).await.expect("first shutdown");

    assert_eq!(report.outcome(), ShutdownOutcome::Aborted);
    assert_eq!(report.completed, vec!["flush"]);
    assert_eq!(report.aborted_by.as_deref(), Some("stop-monitoring"));
    assert_eq!(report.skipped, vec!["close-event-bus"]);
    assert!(!late_ran.load(Ordering::SeqCst));
    assert!(after_ran.load(Ordering::SeqCst));
}
