use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, params};
use std::path::Path;

use super::models::{Snapshot, Target};
use super::{SnapshotSink, TargetSource};
use crate::pool::{LibsqlManager, LibsqlPool, open_pool};

const TARGET_COLUMNS: &str = "key, address, label, category, enabled";
const SNAPSHOT_COLUMNS: &str = "key, status, latency_ms, checked_at, error";

/// LibSQL database implementation
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

impl DatabaseImpl {
    /// Create a new database instance from a pool
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Open the database file, run migrations and return a ready instance
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_pool(path, 8).await?;
        let database = Self::new_from_pool(pool);

        let conn = database.get_conn().await?;
        super::initialize_database(&conn).await?;

        Ok(database)
    }

    /// Get a connection from the pool
    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }

    /// Get a target by key
    pub async fn get_target(&self, key: &str) -> Result<Option<Target>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {TARGET_COLUMNS} FROM targets WHERE key = ?"), params![key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(target_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Insert or update a target
    pub async fn upsert_target(&self, target: &Target) -> Result<()> {
        let conn = self.get_conn().await?;
        let now = Utc::now().timestamp();

        conn.execute(
            "INSERT INTO targets (key, address, label, category, enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                address = excluded.address,
                label = excluded.label,
                category = excluded.category,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
            params![
                target.key.clone(),
                target.address.clone(),
                target.label.clone(),
                target.category.clone(),
                target.enabled as i64,
                now,
                now
            ],
        )
        .await
        .with_context(|| format!("failed to save target {}", target.key))?;

        Ok(())
    }

    /// Insert targets that do not exist yet, leaving existing rows alone
    pub async fn seed_targets(&self, targets: &[Target]) -> Result<usize> {
        let conn = self.get_conn().await?;
        let now = Utc::now().timestamp();
        let mut inserted = 0;

        for target in targets {
            inserted += conn
                .execute(
                    "INSERT OR IGNORE INTO targets (key, address, label, category, enabled, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params![
                        target.key.clone(),
                        target.address.clone(),
                        target.label.clone(),
                        target.category.clone(),
                        target.enabled as i64,
                        now,
                        now
                    ],
                )
                .await? as usize;
        }

        Ok(inserted)
    }

    /// Enable or disable a target; returns false when the key is unknown
    pub async fn set_target_enabled(&self, key: &str, enabled: bool) -> Result<bool> {
        let conn = self.get_conn().await?;
        let changed = conn
            .execute(
                "UPDATE targets SET enabled = ?, updated_at = ? WHERE key = ?",
                params![enabled as i64, Utc::now().timestamp(), key],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Delete a target and its snapshot
    pub async fn delete_target(&self, key: &str) -> Result<bool> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        let deleted = tx.execute("DELETE FROM targets WHERE key = ?", params![key]).await?;
        tx.execute("DELETE FROM target_snapshots WHERE key = ?", params![key]).await?;
        tx.commit().await?;
        Ok(deleted > 0)
    }

    /// Latest snapshot for every target that has one
    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {SNAPSHOT_COLUMNS} FROM target_snapshots ORDER BY key"), ())
            .await?;

        let mut snapshots = Vec::new();
        while let Some(row) = rows.next().await? {
            snapshots.push(snapshot_from_row(&row)?);
        }
        Ok(snapshots)
    }

    /// Latest snapshot for one target
    pub async fn get_snapshot(&self, key: &str) -> Result<Option<Snapshot>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM target_snapshots WHERE key = ?"),
                params![key],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(snapshot_from_row(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TargetSource for DatabaseImpl {
    async fn list_targets(&self) -> Result<Vec<Target>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {TARGET_COLUMNS} FROM targets ORDER BY key"), ())
            .await?;

        let mut targets = Vec::new();
        while let Some(row) = rows.next().await? {
            targets.push(target_from_row(&row)?);
        }
        Ok(targets)
    }
}

#[async_trait]
impl SnapshotSink for DatabaseImpl {
    async fn upsert_snapshots(&self, snapshots: &[Snapshot]) -> Result<()> {
        if snapshots.is_empty() {
            return Ok(());
        }

        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        let now = Utc::now().timestamp();

        for snapshot in snapshots {
            tx.execute(
                "INSERT INTO target_snapshots (key, status, latency_ms, checked_at, error, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET
                    status = excluded.status,
                    latency_ms = excluded.latency_ms,
                    checked_at = excluded.checked_at,
                    error = excluded.error,
                    updated_at = excluded.updated_at",
                params![
                    snapshot.key.clone(),
                    snapshot.status.to_string(),
                    snapshot.latency_ms.map(|ms| ms as i64),
                    snapshot.checked_at.timestamp_millis(),
                    snapshot.error.clone(),
                    now
                ],
            )
            .await
            .with_context(|| format!("failed to write snapshot for {}", snapshot.key))?;
        }

        // Dropping the transaction without commit rolls the whole batch back
        tx.commit().await?;
        Ok(())
    }
}

fn target_from_row(row: &Row) -> Result<Target> {
    Ok(Target {
        key: row.get(0)?,
        address: row.get(1)?,
        label: row.get(2)?,
        category: row.get(3)?,
        enabled: row.get::<i64>(4)? != 0,
    })
}

fn snapshot_from_row(row: &Row) -> Result<Snapshot> {
    let status: String = row.get(1)?;
    let checked_at: i64 = row.get(3)?;

    Ok(Snapshot {
        key: row.get(0)?,
        status: status.parse().map_err(|e: String| anyhow!(e))?,
        latency_ms: row.get::<Option<i64>>(2)?.map(|ms| ms as u64),
        checked_at: DateTime::from_timestamp_millis(checked_at)
            .ok_or_else(|| anyhow!("invalid snapshot timestamp {checked_at}"))?,
        error: row.get(4)?,
    })
}
