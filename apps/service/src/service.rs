use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::bus::{EventBus, LogConsumer};
use crate::config::Config;
use crate::database::models::Target;
use crate::database::{DatabaseImpl, MemoryStore, SnapshotSink, TargetSource};
use crate::monitoring::checker::{NetworkProbe, Probe};
use crate::orchestrator::{Orchestrator, ReconcileSummary};
use crate::shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownReport};

/// Shutdown task priorities, lower runs first
pub mod priority {
    pub const HTTP_SERVER: u32 = 10;
    pub const MONITORING: u32 = 20;
    pub const EVENT_BUS: u32 = 90;
}

/// Backing store for targets and snapshots
#[derive(Clone)]
pub enum Store {
    Database(Arc<DatabaseImpl>),
    Memory(Arc<MemoryStore>),
}

impl Store {
    /// Open the configured store and add any seed targets it is missing
    pub async fn open(config: &Config) -> Result<Self> {
        let store = if config.database.enabled {
            let database = DatabaseImpl::open(&config.database.path)
                .await
                .with_context(|| format!("failed to open {}", config.database.path.display()))?;
            info!("Using database at {}", config.database.path.display());
            Store::Database(Arc::new(database))
        } else {
            info!("Persistence disabled, keeping targets and snapshots in memory");
            Store::Memory(Arc::new(MemoryStore::new()))
        };

        store.seed(&config.targets).await?;
        Ok(store)
    }

    pub async fn seed(&self, targets: &[Target]) -> Result<usize> {
        if targets.is_empty() {
            return Ok(0);
        }

        let inserted = match self {
            Store::Database(database) => database.seed_targets(targets).await?,
            Store::Memory(memory) => {
                let known: Vec<String> =
                    memory.list_targets().await?.into_iter().map(|t| t.key).collect();
                let fresh: Vec<&Target> = targets.iter().filter(|t| !known.contains(&t.key)).collect();
                for target in &fresh {
                    memory.put_target((*target).clone());
                }
                fresh.len()
            }
        };

        if inserted > 0 {
            info!("Seeded {} targets from configuration", inserted);
        }
        Ok(inserted)
    }

    fn source(&self) -> Arc<dyn TargetSource> {
        match self {
            Store::Database(database) => database.clone(),
            Store::Memory(memory) => memory.clone(),
        }
    }

    fn sink(&self) -> Arc<dyn SnapshotSink> {
        match self {
            Store::Database(database) => database.clone(),
            Store::Memory(memory) => memory.clone(),
        }
    }
}

/// The assembled engine: orchestrator, bus, store and shutdown sequence
///
/// Both binaries build one of these and drive it.
pub struct VigilService {
    config: RwLock<Config>,
    config_path: Option<PathBuf>,
    store: Store,
    orchestrator: Orchestrator,
    bus: EventBus,
    shutdown: ShutdownCoordinator,
}

impl VigilService {
    /// Open the configured store and wire everything up with the network probe
    pub async fn open(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let store = Store::open(&config).await?;
        let probe = Arc::new(NetworkProbe::new()?);
        Ok(Self::assemble(config, config_path, store, probe))
    }

    /// Wire the engine around an existing store and probe
    pub fn assemble(
        config: Config,
        config_path: Option<PathBuf>,
        store: Store,
        probe: Arc<dyn Probe>,
    ) -> Self {
        let bus = EventBus::new(config.bus.subscriber_capacity, config.bus.history_size);
        let orchestrator =
            Orchestrator::new(config.engine_settings(), store.source(), store.sink(), probe, bus.clone());
        let shutdown = ShutdownCoordinator::new(config.shutdown.grace());

        let log_consumer = bus.attach(Arc::new(LogConsumer), shutdown.token());
        shutdown.spawn_background("log-consumer", async move {
            if let Err(e) = log_consumer.await {
                warn!("Log consumer ended abnormally: {}", e);
            }
        });

        let task_timeout = config.shutdown.task_timeout();
        let monitoring = orchestrator.clone();
        shutdown.register_task("stop-monitoring", priority::MONITORING, task_timeout, true, move || async move {
            monitoring.shutdown().await;
            Ok(())
        });

        let closing_bus = bus.clone();
        shutdown.register_task("close-event-bus", priority::EVENT_BUS, task_timeout, false, move || async move {
            let disconnected = closing_bus.close();
            info!("Disconnected {} event subscribers", disconnected);
            Ok(())
        });

        Self { config: RwLock::new(config), config_path, store, orchestrator, bus, shutdown }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> Config {
        self.config.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub async fn start(&self) -> Result<()> {
        self.orchestrator.start().await?;
        Ok(())
    }

    /// Re-read the config file (if any) and the target list
    ///
    /// A config file that no longer parses is reported and the current
    /// settings stay in effect.
    pub async fn reload_configuration(&self) -> Result<ReconcileSummary> {
        if let Some(path) = &self.config_path {
            match Config::load(path) {
                Ok(config) => {
                    self.orchestrator.apply_settings(config.engine_settings());
                    self.store.seed(&config.targets).await?;
                    *self.config.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
                    info!("Configuration reloaded from {}", path.display());
                }
                Err(e) => warn!("Keeping current configuration: {}", e),
            }
        }

        Ok(self.orchestrator.reload_targets().await)
    }

    pub async fn shutdown(&self, reason: ShutdownReason) -> Option<ShutdownReport> {
        self.shutdown.shutdown(reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::checker::ProbeError;
    use crate::shutdown::ShutdownOutcome;
    use std::time::Duration;

    struct AlwaysUp;

    #[async_trait::async_trait]
    impl Probe for AlwaysUp {
        async fn probe(&self, _address: &str, _timeout: Duration) -> Result<Duration, ProbeError> {
            Ok(Duration::from_millis(1))
        }
    }

    fn memory_config() -> Config {
        let mut config = Config::default();
        config.database.enabled = false;
        config.targets = vec![Target::new("gate-1", "10.0.0.1"), Target::new("gate-2", "10.0.0.2")];
        config
    }

    #[tokio::test]
    async fn test_memory_store_seeding_is_idempotent() -> Result<()> {
        let config = memory_config();
        let store = Store::open(&config).await?;
        assert_eq!(store.seed(&config.targets).await?, 0);
        assert_eq!(store.source().list_targets().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_database_store_seeds_targets() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = memory_config();
        config.database.enabled = true;
        config.database.path = dir.path().join("data/vigil.db");

        let store = Store::open(&config).await?;
        assert!(matches!(store, Store::Database(_)));
        assert_eq!(store.source().list_targets().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_reload_applies_new_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vigil.toml");
        let mut config = memory_config();
        config.write_config(&path)?;

        let store = Store::open(&config).await?;
        let service = VigilService::assemble(config.clone(), Some(path.clone()), store, Arc::new(AlwaysUp));
        service.orchestrator().reload_targets().await;

        config.monitoring.cycle_interval_secs = 120;
        config.targets.push(Target::new("gate-3", "10.0.0.3"));
        config.write_config(&path)?;

        let summary = service.reload_configuration().await?;
        assert_eq!(summary.added, vec!["gate-3"]);
        assert_eq!(service.orchestrator().settings().monitoring.cycle_interval_secs, 120);

        std::fs::write(&path, "not [valid")?;
        let summary = service.reload_configuration().await?;
        assert!(summary.is_unchanged());
        assert_eq!(service.config().monitoring.cycle_interval_secs, 120);
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_stops_monitoring() -> Result<()> {
        let config = memory_config();
        let store = Store::open(&config).await?;
        let service = VigilService::assemble(config, None, store, Arc::new(AlwaysUp));
        service.start().await?;
        let mut events = service.bus().subscribe();

        let report = service.shutdown(ShutdownReason::UserRequest).await.expect("first shutdown");
        assert_eq!(report.outcome(), ShutdownOutcome::Clean);
        assert_eq!(report.completed, vec!["stop-monitoring", "close-event-bus"]);
        assert!(!service.orchestrator().is_running().await);

        // Stream ends after the remaining events drain
        while events.recv().await.is_some() {}
        Ok(())
    }
}
