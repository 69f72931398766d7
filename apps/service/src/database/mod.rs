/// Database abstraction layer
///
/// The engine only sees two seams: a source of targets and a sink for
/// snapshots. LibSQL backs both in production, [`MemoryStore`] in tests
/// and when persistence is disabled.
pub mod memory;
pub mod migrations;
pub mod models;
pub mod repository;

pub use memory::MemoryStore;
pub use models::{Snapshot, Target};
pub use repository::DatabaseImpl;

use anyhow::Result;

/// Where the monitored targets come from
#[async_trait::async_trait]
pub trait TargetSource: Send + Sync {
    /// All configured targets, enabled or not
    async fn list_targets(&self) -> Result<Vec<Target>>;
}

/// Where probe snapshots are written
#[async_trait::async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Upsert a batch of snapshots keyed by target key, all or nothing
    async fn upsert_snapshots(&self, snapshots: &[Snapshot]) -> Result<()>;
}

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}
