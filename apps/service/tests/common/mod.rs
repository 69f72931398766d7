//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use vigil_service::config::Config;
use vigil_service::database::models::Target;
use vigil_service::database::MemoryStore;
use vigil_service::monitoring::checker::{Probe, ProbeError};
use vigil_service::monitoring::types::ProbeResult;
use vigil_service::{Store, VigilService};

/// Probe answering from a per-address script; unknown addresses are down
#[derive(Default)]
pub struct ScriptedProbe {
    outcomes: Mutex<HashMap<String, Result<Duration, ProbeError>>>,
}

impl ScriptedProbe {
    pub fn up(&self, address: &str) {
        self.outcomes.lock().unwrap().insert(address.to_string(), Ok(Duration::from_millis(5)));
    }

    pub fn down(&self, address: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(address.to_string(), Err(ProbeError::Unreachable("connection refused".into())));
    }
}

#[async_trait::async_trait]
impl Probe for ScriptedProbe {
    async fn probe(&self, address: &str, _timeout: Duration) -> Result<Duration, ProbeError> {
        self.outcomes
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or(Err(ProbeError::Unreachable("unscripted".into())))
    }
}

/// Config for an in-memory engine with fast, deterministic settings
pub fn test_config(targets: Vec<Target>) -> Config {
    let mut config = Config::default();
    config.database.enabled = false;
    config.probe.max_attempts = 1;
    config.probe.jitter = false;
    config.transitions.debounce_secs = 0;
    config.bus.subscriber_capacity = 256;
    config.targets = targets;
    config
}

pub struct Engine {
    pub service: VigilService,
    pub store: Arc<MemoryStore>,
    pub probe: Arc<ScriptedProbe>,
}

pub fn engine(targets: Vec<Target>) -> Engine {
    let store = Arc::new(MemoryStore::with_targets(targets.clone()));
    let probe = Arc::new(ScriptedProbe::default());
    let service =
        VigilService::assemble(test_config(targets), None, Store::Memory(store.clone()), probe.clone());
    Engine { service, store, probe }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn up(key: &str, secs: i64) -> ProbeResult {
    ProbeResult::reachable(key, Duration::from_millis(10), at(secs))
}

pub fn down(key: &str, secs: i64) -> ProbeResult {
    ProbeResult::failed(key, ProbeError::Unreachable("no route".into()), at(secs))
}
