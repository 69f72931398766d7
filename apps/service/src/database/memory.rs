use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::models::{Snapshot, Target};
use super::{SnapshotSink, TargetSource};

/// In-memory target source and snapshot sink
///
/// Used when persistence is turned off and throughout the tests. Failures
/// can be switched on to exercise the engine's degraded paths.
#[derive(Default)]
pub struct MemoryStore {
    targets: Mutex<BTreeMap<String, Target>>,
    snapshots: Mutex<BTreeMap<String, Snapshot>>,
    batch_count: AtomicU64,
    last_batch: Mutex<Option<Vec<Snapshot>>>,
    fail_source: AtomicBool,
    fail_sink: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targets(targets: impl IntoIterator<Item = Target>) -> Self {
        let store = Self::new();
        for target in targets {
            store.put_target(target);
        }
        store
    }

    pub fn put_target(&self, target: Target) {
        lock(&self.targets).insert(target.key.clone(), target);
    }

    pub fn remove_target(&self, key: &str) -> Option<Target> {
        lock(&self.targets).remove(key)
    }

    pub fn set_enabled(&self, key: &str, enabled: bool) -> bool {
        match lock(&self.targets).get_mut(key) {
            Some(target) => {
                target.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, key: &str) -> Option<Snapshot> {
        lock(&self.snapshots).get(key).cloned()
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        lock(&self.snapshots).values().cloned().collect()
    }

    /// Number of batches accepted by the sink
    pub fn batch_count(&self) -> u64 {
        self.batch_count.load(Ordering::SeqCst)
    }

    /// The most recent accepted batch; older ones are not retained
    pub fn last_batch(&self) -> Option<Vec<Snapshot>> {
        lock(&self.last_batch).clone()
    }

    pub fn fail_source(&self, fail: bool) {
        self.fail_source.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sink(&self, fail: bool) {
        self.fail_sink.store(fail, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl TargetSource for MemoryStore {
    async fn list_targets(&self) -> Result<Vec<Target>> {
        if self.fail_source.load(Ordering::SeqCst) {
            bail!("target source unavailable");
        }
        Ok(lock(&self.targets).values().cloned().collect())
    }
}

#[async_trait]
impl SnapshotSink for MemoryStore {
    async fn upsert_snapshots(&self, snapshots: &[Snapshot]) -> Result<()> {
        if self.fail_sink.load(Ordering::SeqCst) {
            bail!("snapshot sink unavailable");
        }

        let mut stored = lock(&self.snapshots);
        for snapshot in snapshots {
            stored.insert(snapshot.key.clone(), snapshot.clone());
        }
        *lock(&self.last_batch) = Some(snapshots.to_vec());
        self.batch_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
