use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::monitoring::types::TargetStatus;

/// How long a cached probe result stays fresh, by status
#[derive(Debug, Clone, PartialEq)]
pub struct CacheTtls {
    pub online: Duration,
    pub offline: Duration,
    pub error: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            online: Duration::from_secs(60),
            offline: Duration::from_secs(30),
            error: Duration::from_secs(15),
        }
    }
}

impl CacheTtls {
    pub fn ttl_for(&self, status: TargetStatus) -> Duration {
        match status {
            TargetStatus::Online => self.online,
            TargetStatus::Offline => self.offline,
            TargetStatus::Error | TargetStatus::Unknown => self.error,
        }
    }
}

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

/// Keyed cache where every entry carries its own TTL
///
/// Expired entries are never returned; they are dropped lazily on read and
/// in bulk by [`ResultCache::sweep`].
pub struct ResultCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V> Default for ResultCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }
}

impl<V: Clone> ResultCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries();

        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = CacheEntry { value, created_at: Instant::now(), ttl };
        self.entries().insert(key.into(), entry);
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Drop every expired entry; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            entries: self.len(),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }
}
