/// Orchestrator module - drives the monitoring cycle
///
/// The orchestrator is the core coordinator that:
/// - Keeps the monitor set in sync with the target source
/// - Probes every active target once per cycle under the rate limiter
/// - Persists snapshots, updates the state machines and publishes events
/// - Serves on-demand checks through the result cache
pub mod registry;


pub use registry::{MonitorRegistry, ReconcileSummary, TargetSnapshot};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{BusStats, EventBus, EventKind};
use crate::cache::{CacheStats, ResultCache};
use crate::config::EngineSettings;
use crate::database::models::Snapshot;
use crate::database::{SnapshotSink, TargetSource};
use crate::error::{EngineError, Result};
use crate::limiter::RateLimiter;
use crate::monitoring::checker::Probe;
use crate::monitoring::executor::{ProbeRunner, panic_message};
use crate::monitoring::types::{ProbeResult, TargetStatus};

/// Counts and timings of one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub error: usize,
    pub probe_ms: u64,
    pub persist_ms: u64,
    pub total_ms: u64,
    /// False when the snapshot write failed
    pub persisted: bool,
    /// Share of online targets, 0 for an empty cycle
    pub availability_pct: f64,
    /// Mean latency over reachable results
    pub avg_latency_ms: Option<f64>,
}

impl CycleSummary {
    fn tally(&mut self, results: &[ProbeResult]) {
        self.total = results.len();
        for result in results {
            match result.status() {
                TargetStatus::Online => self.online += 1,
                TargetStatus::Offline => self.offline += 1,
                TargetStatus::Error | TargetStatus::Unknown => self.error += 1,
            }
        }

        if self.total > 0 {
            self.availability_pct = self.online as f64 * 100.0 / self.total as f64;
        }
        let latencies: Vec<u64> = results.iter().filter(|r| r.reachable).filter_map(|r| r.latency_ms).collect();
        if !latencies.is_empty() {
            self.avg_latency_ms = Some(latencies.iter().sum::<u64>() as f64 / latencies.len() as f64);
        }
    }
}

/// Current status counts for one target category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub error: usize,
    pub unknown: usize,
}

const UNCATEGORIZED: &str = "uncategorized";

fn categorize(targets: &[TargetSnapshot]) -> BTreeMap<String, CategoryStats> {
    let mut categories: BTreeMap<String, CategoryStats> = BTreeMap::new();
    for snapshot in targets {
        let name = match snapshot.target.category.trim() {
            "" => UNCATEGORIZED,
            category => category,
        };
        let stats = categories.entry(name.to_string()).or_default();
        stats.total += 1;
        match snapshot.state.status {
            TargetStatus::Online => stats.online += 1,
            TargetStatus::Offline => stats.offline += 1,
            TargetStatus::Error => stats.error += 1,
            TargetStatus::Unknown => stats.unknown += 1,
        }
    }
    categories
}

/// Point-in-time view of the orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub targets: usize,
    pub cycle_interval_secs: u64,
    pub cycles_completed: u64,
    pub last_cycle: Option<CycleSummary>,
    /// Probes run since start-up, scheduled and on-demand
    pub checks_performed: u64,
    /// Probes among those that did not come back online
    pub failures: u64,
    pub failure_rate_pct: f64,
    pub categories: BTreeMap<String, CategoryStats>,
    pub cache: CacheStats,
    pub bus: BusStats,
}

#[derive(Default)]
struct LoopControl {
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    settings: RwLock<EngineSettings>,
    source: Arc<dyn TargetSource>,
    sink: Arc<dyn SnapshotSink>,
    probe: Arc<dyn Probe>,
    limiter: RwLock<Arc<RateLimiter>>,
    cache: ResultCache<ProbeResult>,
    registry: MonitorRegistry,
    bus: EventBus,
    control: Mutex<LoopControl>,
    /// Serializes cycles between the loop and on-demand runs
    cycle_lock: Mutex<()>,
    wake: Notify,
    reload_requested: AtomicBool,
    last_reload: std::sync::Mutex<Option<Instant>>,
    cycles: AtomicU64,
    checks: AtomicU64,
    failures: AtomicU64,
    last_cycle: RwLock<Option<CycleSummary>>,
    shutdown: CancellationToken,
}

/// Main orchestrator for the monitoring engine
///
/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        settings: EngineSettings,
        source: Arc<dyn TargetSource>,
        sink: Arc<dyn SnapshotSink>,
        probe: Arc<dyn Probe>,
        bus: EventBus,
    ) -> Self {
        let limiter = Arc::new(settings.limits.limiter());
        Self {
            inner: Arc::new(Inner {
                settings: RwLock::new(settings),
                source,
                sink,
                probe,
                limiter: RwLock::new(limiter),
                cache: ResultCache::new(),
                registry: MonitorRegistry::new(),
                bus,
                control: Mutex::new(LoopControl::default()),
                cycle_lock: Mutex::new(()),
                wake: Notify::new(),
                reload_requested: AtomicBool::new(false),
                last_reload: std::sync::Mutex::new(None),
                cycles: AtomicU64::new(0),
                checks: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                last_cycle: RwLock::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> EngineSettings {
        read(&self.inner.settings).clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    fn limiter(&self) -> Arc<RateLimiter> {
        read(&self.inner.limiter).clone()
    }

    fn runner(&self, settings: &EngineSettings) -> ProbeRunner {
        ProbeRunner::new(
            self.inner.probe.clone(),
            settings.probe.timeout(),
            settings.probe.retry_policy(),
        )
    }

    pub async fn is_running(&self) -> bool {
        let control = self.inner.control.lock().await;
        control.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Load targets and spawn the monitoring loop; no-op when already running
    pub async fn start(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let mut control = self.inner.control.lock().await;
        if control.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            warn!("Monitoring loop already running");
            return Ok(());
        }

        self.reload_targets().await;

        // Wakes requested while stopped must not cut the first pause short
        let _ = self.inner.wake.notified().now_or_never();

        let token = self.inner.shutdown.child_token();
        let handle = tokio::spawn(self.clone().run_loop(token.clone()));
        control.token = Some(token);
        control.handle = Some(handle);
        drop(control);

        let targets = self.inner.registry.len().await;
        let interval_secs = self.settings().monitoring.cycle_interval().as_secs();
        info!("Monitoring started with {} targets every {}s", targets, interval_secs);
        self.inner.bus.publish(EventKind::MonitoringStarted { targets, interval_secs });
        Ok(())
    }

    /// Stop for good: the loop exits, waiting probes are released and
    /// `start` is refused from now on
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.stop().await;
        self.limiter().close();
    }

    /// Cancel the loop and wait for it to exit; in-flight probes are dropped
    pub async fn stop(&self) {
        let mut control = self.inner.control.lock().await;
        let (Some(token), Some(handle)) = (control.token.take(), control.handle.take()) else {
            debug!("Monitoring loop not running");
            return;
        };
        drop(control);

        token.cancel();
        if let Err(e) = handle.await {
            error!("Monitoring loop ended abnormally: {}", e);
        }

        info!("Monitoring stopped");
        self.inner.bus.publish(EventKind::MonitoringStopped);
    }

    /// Wake the loop so the next cycle starts now instead of after the interval
    pub fn trigger_cycle(&self) {
        self.inner.wake.notify_one();
    }

    /// Ask the loop to re-read targets before its next cycle
    pub fn request_reload(&self) {
        self.inner.reload_requested.store(true, Ordering::SeqCst);
        self.trigger_cycle();
    }

    /// Replace the engine settings; takes effect from the next cycle
    pub fn apply_settings(&self, settings: EngineSettings) {
        let mut current = write(&self.inner.settings);
        if *current == settings {
            return;
        }

        if current.limits != settings.limits {
            *write(&self.inner.limiter) = Arc::new(settings.limits.limiter());
            info!(
                "Rate limits updated: {} concurrent, {} per {}ms",
                settings.limits.max_concurrent, settings.limits.max_per_window, settings.limits.window_ms
            );
        }
        if current.cache != settings.cache {
            self.inner.cache.clear();
        }

        *current = settings;
        drop(current);
        info!("Engine settings applied");
        self.trigger_cycle();
    }

    async fn run_loop(self, token: CancellationToken) {
        info!("Monitoring loop started");

        loop {
            if token.is_cancelled() {
                break;
            }

            if self.reload_due() {
                if let Err(panic) = AssertUnwindSafe(self.reload_targets()).catch_unwind().await {
                    error!("Target reload panicked: {}", panic_message(panic.as_ref()));
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                outcome = AssertUnwindSafe(self.run_cycle()).catch_unwind() => match outcome {
                    Ok(outcome) => outcome,
                    Err(panic) => Err(EngineError::CyclePanicked(panic_message(panic.as_ref()))),
                },
            };

            let pause = match outcome {
                Ok(_) => self.settings().monitoring.cycle_interval(),
                Err(e) => {
                    error!("Monitoring cycle failed: {}", e);
                    self.settings().monitoring.error_backoff()
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(pause) => {}
                _ = self.inner.wake.notified() => debug!("Monitoring loop woken early"),
            }
        }

        info!("Monitoring loop exited");
    }

    fn reload_due(&self) -> bool {
        if self.inner.reload_requested.swap(false, Ordering::SeqCst) {
            return true;
        }
        let interval = self.settings().monitoring.target_reload();
        let last = *self.inner.last_reload.lock().unwrap_or_else(|p| p.into_inner());
        last.is_none_or(|at| at.elapsed() >= interval)
    }

    /// Re-read the target list and reconcile the monitor set
    ///
    /// When the source fails the current set is kept as the last known good.
    #[instrument(skip(self))]
    pub async fn reload_targets(&self) -> ReconcileSummary {
        *self.inner.last_reload.lock().unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());

        let targets = match self.inner.source.list_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                let active = self.inner.registry.len().await;
                warn!("Target source unavailable, keeping {} known targets: {:#}", active, e);
                return ReconcileSummary { active, ..Default::default() };
            }
        };

        let before = self.inner.registry.targets().await;
        let summary = self.inner.registry.reconcile(targets).await;

        for key in summary.removed.iter() {
            self.inner.cache.invalidate(key);
        }
        for key in summary.updated.iter() {
            let moved = before
                .iter()
                .find(|t| &t.key == key)
                .zip(self.inner.registry.target(key).await)
                .is_some_and(|(old, new)| old.address != new.address);
            if moved {
                self.inner.cache.invalidate(key);
            }
        }

        if !summary.is_unchanged() {
            info!(
                "Targets reloaded: {} added, {} removed, {} updated, {} active",
                summary.added.len(),
                summary.removed.len(),
                summary.updated.len(),
                summary.active
            );
            self.inner.bus.publish(EventKind::TargetsReloaded(summary.clone()));
        }

        summary
    }

    /// Run one full cycle immediately, outside the loop's schedule
    pub async fn run_cycle_now(&self) -> Result<CycleSummary> {
        self.run_cycle().await
    }

    /// Probe, persist, reconcile, notify
    #[instrument(skip(self))]
    async fn run_cycle(&self) -> Result<CycleSummary> {
        let _guard = self.inner.cycle_lock.lock().await;
        let settings = self.settings();
        let targets = self.inner.registry.targets().await;

        let started = Instant::now();
        let mut summary = CycleSummary { started_at: Some(Utc::now()), ..Default::default() };

        if targets.is_empty() {
            debug!("No active targets, skipping cycle");
            return Ok(summary);
        }

        // Phase 1: probe everything concurrently, bounded by the limiter
        let runner = self.runner(&settings);
        let limiter = self.limiter();
        let probes = targets.iter().map(|target| {
            let runner = &runner;
            let limiter = &limiter;
            async move {
                let _permit = limiter.acquire().await?;
                Ok::<_, EngineError>(runner.run(&target.key, &target.address).await)
            }
        });
        let results = join_all(probes).await.into_iter().collect::<Result<Vec<_>>>()?;
        summary.probe_ms = started.elapsed().as_millis() as u64;
        self.count_checks(&results);

        let ttls = settings.cache.ttls();
        for result in &results {
            self.inner.cache.set(result.key.clone(), result.clone(), ttls.ttl_for(result.status()));
        }

        // Phase 2: persist before anyone hears about it
        let snapshots: Vec<Snapshot> = results.iter().map(Snapshot::from).collect();
        let persist_started = Instant::now();
        let upsert = AssertUnwindSafe(self.inner.sink.upsert_snapshots(&snapshots)).catch_unwind();
        summary.persisted = match upsert.await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Failed to persist {} snapshots: {:#}", snapshots.len(), e);
                false
            }
            Err(panic) => {
                error!(
                    "Snapshot sink panicked persisting {} snapshots: {}",
                    snapshots.len(),
                    panic_message(panic.as_ref())
                );
                false
            }
        };
        summary.persist_ms = persist_started.elapsed().as_millis() as u64;

        // Phase 3: fold results into the state machines
        let changes = self.inner.registry.apply_results(&results, &settings.transitions.policy()).await;

        // Phase 4: notify
        summary.cycle = self.inner.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        summary.tally(&results);
        summary.total_ms = started.elapsed().as_millis() as u64;

        for change in changes {
            self.inner.bus.publish(EventKind::StatusChanged(change));
        }
        self.inner.bus.publish(EventKind::CycleCompleted(summary.clone()));

        let swept = self.inner.cache.sweep();
        if swept > 0 {
            debug!("Swept {} expired cache entries", swept);
        }

        info!(
            "Cycle {} completed in {}ms: {} online, {} offline, {} error",
            summary.cycle, summary.total_ms, summary.online, summary.offline, summary.error
        );
        *write(&self.inner.last_cycle) = Some(summary.clone());
        Ok(summary)
    }

    /// Probe one target on demand, serving from the cache unless forced
    ///
    /// The result is not fed into the target's state machine.
    #[instrument(skip(self))]
    pub async fn check_target(&self, key: &str, force_refresh: bool) -> Result<ProbeResult> {
        let target = self
            .inner
            .registry
            .target(key)
            .await
            .ok_or_else(|| EngineError::UnknownTarget(key.to_string()))?;

        if !force_refresh {
            if let Some(cached) = self.inner.cache.get(key) {
                debug!(target = %key, "Serving cached probe result");
                return Ok(cached);
            }
        }

        let settings = self.settings();
        let limiter = self.limiter();
        let _permit = limiter.acquire().await?;
        let result = self.runner(&settings).run(&target.key, &target.address).await;
        self.count_checks(std::slice::from_ref(&result));

        let ttl = settings.cache.ttls().ttl_for(result.status());
        self.inner.cache.set(key, result.clone(), ttl);
        Ok(result)
    }

    fn count_checks(&self, results: &[ProbeResult]) {
        let failed = results.iter().filter(|r| r.status() != TargetStatus::Online).count();
        self.inner.checks.fetch_add(results.len() as u64, Ordering::SeqCst);
        self.inner.failures.fetch_add(failed as u64, Ordering::SeqCst);
    }

    /// Copies of every monitor's target and state, sorted by key
    pub async fn snapshot(&self) -> Vec<TargetSnapshot> {
        self.inner.registry.snapshot().await
    }

    pub async fn target_state(&self, key: &str) -> Option<TargetSnapshot> {
        self.inner.registry.get(key).await
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let targets = self.inner.registry.snapshot().await;
        let checks_performed = self.inner.checks.load(Ordering::SeqCst);
        let failures = self.inner.failures.load(Ordering::SeqCst);
        let failure_rate_pct =
            if checks_performed == 0 { 0.0 } else { failures as f64 * 100.0 / checks_performed as f64 };

        OrchestratorStatus {
            running: self.is_running().await,
            targets: targets.len(),
            cycle_interval_secs: self.settings().monitoring.cycle_interval().as_secs(),
            cycles_completed: self.inner.cycles.load(Ordering::SeqCst),
            last_cycle: read(&self.inner.last_cycle).clone(),
            checks_performed,
            failures,
            failure_rate_pct,
            categories: categorize(&targets),
            cache: self.inner.cache.stats(),
            bus: self.inner.bus.stats(),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}
