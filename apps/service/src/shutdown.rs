//! Graceful shutdown coordination.
//!
//! Teardown runs once: before-callbacks, then registered tasks in priority
//! order (each under its own timeout), then cancellation of background
//! tasks with a grace period, then after-callbacks.

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    UserRequest,
    CriticalError,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "interrupt"),
            ShutdownReason::Terminate => write!(f, "terminate"),
            ShutdownReason::UserRequest => write!(f, "user request"),
            ShutdownReason::CriticalError => write!(f, "critical error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    Idle,
    ShuttingDown,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    /// Every task finished in time
    Clean,
    /// Some non-critical task failed or a background task had to be aborted
    Degraded,
    /// A critical task failed and the remaining tasks were skipped
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    pub completed: Vec<String>,
    pub failed: Vec<TaskFailure>,
    pub skipped: Vec<String>,
    /// Critical task that stopped the teardown
    pub aborted_by: Option<String>,
    /// Background tasks that outlived the grace period
    pub abandoned: Vec<String>,
    pub duration_ms: u64,
}

impl ShutdownReport {
    pub fn outcome(&self) -> ShutdownOutcome {
        if self.aborted_by.is_some() {
            ShutdownOutcome::Aborted
        } else if !self.failed.is_empty() || !self.abandoned.is_empty() {
            ShutdownOutcome::Degraded
        } else {
            ShutdownOutcome::Clean
        }
    }
}

type TaskAction = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct ShutdownTask {
    name: String,
    priority: u32,
    timeout: Duration,
    critical: bool,
    action: TaskAction,
}

struct State {
    phase: ShutdownPhase,
    tasks: Vec<ShutdownTask>,
    before: Vec<(String, TaskAction)>,
    after: Vec<(String, TaskAction)>,
    background: Vec<(String, JoinHandle<()>)>,
}

struct Inner {
    grace: Duration,
    token: CancellationToken,
    state: Mutex<State>,
    report: watch::Sender<Option<ShutdownReport>>,
}

/// Shared handle to the process-wide shutdown sequence
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    /// `grace` bounds how long background tasks may run after cancellation
    pub fn new(grace: Duration) -> Self {
        let (report, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                grace,
                token: CancellationToken::new(),
                state: Mutex::new(State {
                    phase: ShutdownPhase::Idle,
                    tasks: Vec::new(),
                    before: Vec::new(),
                    after: Vec::new(),
                    background: Vec::new(),
                }),
                report,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cancelled as soon as shutdown begins
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.state().phase
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.phase() != ShutdownPhase::Idle
    }

    /// Register a teardown step; lower priorities run first
    ///
    /// When a critical task fails or times out, the steps after it are skipped.
    pub fn register_task<F, Fut>(
        &self,
        name: impl Into<String>,
        priority: u32,
        timeout: Duration,
        critical: bool,
        action: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, priority, critical, "Registered shutdown task");
        self.state().tasks.push(ShutdownTask {
            name,
            priority,
            timeout,
            critical,
            action: Box::new(move || action().boxed()),
        });
    }

    pub fn before_shutdown<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.state().before.push((name.into(), Box::new(move || callback().boxed())));
    }

    pub fn after_shutdown<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.state().after.push((name.into(), Box::new(move || callback().boxed())));
    }

    /// Spawn a task that is cancelled when shutdown begins
    ///
    /// The future itself should also watch [`ShutdownCoordinator::token`] if it
    /// needs to clean up; otherwise it is simply dropped at cancellation.
    pub fn spawn_background<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = self.inner.token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!(task = %task_name, "Background task cancelled"),
                _ = future => debug!(task = %task_name, "Background task finished"),
            }
        });
        self.state().background.push((name, handle));
    }

    /// Run the teardown; only the first call does anything
    pub async fn shutdown(&self, reason: ShutdownReason) -> Option<ShutdownReport> {
        let started = Instant::now();

        let (mut tasks, before, after, background) = {
            let mut state = self.state();
            if state.phase != ShutdownPhase::Idle {
                debug!(%reason, "Shutdown already requested, ignoring");
                return None;
            }
            state.phase = ShutdownPhase::ShuttingDown;
            (
                std::mem::take(&mut state.tasks),
                std::mem::take(&mut state.before),
                std::mem::take(&mut state.after),
                std::mem::take(&mut state.background),
            )
        };

        info!(%reason, "Shutdown started");

        run_callbacks("before", before).await;
        self.inner.token.cancel();

        let mut report = ShutdownReport {
            reason,
            completed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            aborted_by: None,
            abandoned: Vec::new(),
            duration_ms: 0,
        };

        // Stable sort keeps registration order among equal priorities
        tasks.sort_by_key(|task| task.priority);
        let mut tasks = tasks.into_iter();

        while let Some(task) = tasks.next() {
            debug!(task = %task.name, priority = task.priority, "Running shutdown task");
            let call = AssertUnwindSafe((task.action)()).catch_unwind();

            let failure = match timeout(task.timeout, call).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(format!("{e:#}")),
                Ok(Err(_)) => Some("task panicked".to_string()),
                Err(_) => Some(format!("timed out after {:?}", task.timeout)),
            };

            match failure {
                None => {
                    info!(task = %task.name, "Shutdown task completed");
                    report.completed.push(task.name);
                }
                Some(error) if task.critical => {
                    error!(task = %task.name, %error, "Critical shutdown task failed, aborting teardown");
                    report.failed.push(TaskFailure { task: task.name.clone(), error });
                    report.aborted_by = Some(task.name);
                    report.skipped = tasks.by_ref().map(|t| t.name).collect();
                    break;
                }
                Some(error) => {
                    warn!(task = %task.name, %error, "Shutdown task failed, continuing");
                    report.failed.push(TaskFailure { task: task.name, error });
                }
            }
        }

        report.abandoned = self.drain_background(background).await;

        run_callbacks("after", after).await;

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.state().phase = ShutdownPhase::Completed;

        match report.outcome() {
            ShutdownOutcome::Clean => info!(duration_ms = report.duration_ms, "Shutdown completed cleanly"),
            outcome => warn!(?outcome, duration_ms = report.duration_ms, "Shutdown completed with problems"),
        }

        self.inner.report.send_replace(Some(report.clone()));
        Some(report)
    }

    async fn drain_background(&self, background: Vec<(String, JoinHandle<()>)>) -> Vec<String> {
        if background.is_empty() {
            return Vec::new();
        }

        let aborts: Vec<(String, AbortHandle)> =
            background.iter().map(|(name, handle)| (name.clone(), handle.abort_handle())).collect();
        let handles = background.into_iter().map(|(_, handle)| handle);

        if timeout(self.inner.grace, join_all(handles)).await.is_ok() {
            return Vec::new();
        }

        let mut abandoned = Vec::new();
        for (name, handle) in aborts {
            if !handle.is_finished() {
                warn!(task = %name, "Background task exceeded grace period, aborting");
                handle.abort();
                abandoned.push(name);
            }
        }
        abandoned
    }

    /// Wait until a shutdown has finished
    pub async fn wait(&self) -> Option<ShutdownReport> {
        let mut receiver = self.inner.report.subscribe();
        let report = receiver.wait_for(|report| report.is_some()).await.ok()?;
        report.clone()
    }

    /// Wait until a shutdown has finished, up to `limit`
    pub async fn wait_for_completion(&self, limit: Duration) -> Option<ShutdownReport> {
        let mut receiver = self.inner.report.subscribe();
        let finished = timeout(limit, receiver.wait_for(|report| report.is_some())).await;
        match finished {
            Ok(Ok(report)) => report.clone(),
            _ => None,
        }
    }
}

async fn run_callbacks(stage: &str, callbacks: Vec<(String, TaskAction)>) {
    for (name, callback) in callbacks {
        match AssertUnwindSafe(callback()).catch_unwind().await {
            Ok(Ok(())) => debug!(stage, callback = %name, "Shutdown callback ran"),
            Ok(Err(e)) => warn!(stage, callback = %name, error = %e, "Shutdown callback failed"),
            Err(_) => warn!(stage, callback = %name, "Shutdown callback panicked"),
        }
    }
}

/// Trigger `coordinator.shutdown` on SIGINT or SIGTERM
pub fn install_signal_handlers(coordinator: ShutdownCoordinator) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = wait_for_signal().await;
        info!(%reason, "Signal received");
        coordinator.shutdown(reason).await;
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownReason {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownReason::Interrupt,
            _ = terminate.recv() => ShutdownReason::Terminate,
        },
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, only SIGINT will stop the process");
            let _ = tokio::signal::ctrl_c().await;
            ShutdownReason::Interrupt
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownReason {
    let _ = tokio::signal::ctrl_c().await;
    ShutdownReason::Interrupt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ok() -> impl Future<Output = anyhow::Result<()>> {
        async { Ok(()) }
    }

    #[tokio::test]
    async fn test_tasks_run_in_priority_order() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("db", 30), ("http", 10), ("monitor", 20), ("http-2", 10)] {
            let order = order.clone();
            coordinator.register_task(name, priority, Duration::from_secs(1), false, move || async move {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }

        let report = coordinator.shutdown(ShutdownReason::UserRequest).await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["http", "http-2", "monitor", "db"]);
        assert_eq!(report.outcome(), ShutdownOutcome::Clean);
        assert_eq!(coordinator.phase(), ShutdownPhase::Completed);
    }

    #[tokio::test]
    async fn test_second_request_is_ignored() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.register_task("only", 0, Duration::from_secs(1), false, ok);

        assert!(coordinator.shutdown(ShutdownReason::Interrupt).await.is_some());
        assert!(coordinator.shutdown(ShutdownReason::Terminate).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_critical_timeout_continues() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let ran = Arc::new(AtomicBool::new(false));

        coordinator.register_task("slow", 1, Duration::from_secs(2), false, || async {
            std::future::pending::<()>().await;
            Ok(())
        });
        let flag = ran.clone();
        coordinator.register_task("after-slow", 2, Duration::from_secs(2), false, move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let report = coordinator.shutdown(ShutdownReason::Terminate).await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].task, "slow");
        assert_eq!(report.outcome(), ShutdownOutcome::Degraded);
    }

    #[tokio::test]
    async fn test_failing_callbacks_do_not_stop_teardown() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let after_ran = Arc::new(AtomicBool::new(false));

        coordinator.before_shutdown("broken", || async { Err::<(), _>(anyhow::anyhow!("nope")) });
        coordinator.register_task("work", 0, Duration::from_secs(1), true, ok);
        let flag = after_ran.clone();
        coordinator.after_shutdown("flag", move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let report = coordinator.shutdown(ShutdownReason::UserRequest).await.unwrap();
        assert_eq!(report.completed, vec!["work"]);
        assert!(after_ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_are_cancelled() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.spawn_background("ticker", async {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        let report = coordinator.shutdown(ShutdownReason::Interrupt).await.unwrap();
        assert!(report.abandoned.is_empty());
        assert!(coordinator.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_for_completion() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        assert!(coordinator.wait_for_completion(Duration::from_millis(10)).await.is_none());

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.wait_for_completion(Duration::from_secs(5)).await })
        };
        coordinator.shutdown(ShutdownReason::UserRequest).await;

        let report = waiter.await.unwrap().unwrap();
        assert_eq!(report.reason, ShutdownReason::UserRequest);
        assert!(coordinator.is_shutdown_requested());
    }
}
