pub mod lock;

pub use lock::{LockError, StateLock};

use chrono::{DateTime, Utc};
use formsync_core::{ReplayEntry, ReplayReason, RunCounters};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

pub const STATE_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Resume position of a run. `cursor` indexes the name-ordered entity list and always points at
/// the next entity that has not completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCheckpoint {
    pub cursor: usize,
    pub total_entities: usize,
    pub entity_fingerprint: String,
    pub counters: RunCounters,
    pub needs_continuation: bool,
    pub updated_at: DateTime<Utc>,
}

/// Standing record of an entity that finished with failed assets, or that could not be synced at
/// all, in which case `error` holds the last error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFailure {
    pub entity_id: String,
    pub entity_name: String,
    pub active: bool,
    pub container_path: String,
    pub assets_in_source: u64,
    pub assets_in_target: u64,
    pub assets_failed: u64,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > STATE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: STATE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_sync_state.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_entity_errors.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn save_checkpoint(&self, checkpoint: &RunCheckpoint) -> Result<(), StorageError> {
        let counters_json = serde_json::to_string(&checkpoint.counters)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        self.conn.execute(
            "
            INSERT INTO run_checkpoint (
                slot,
                cursor,
                total_entities,
                entity_fingerprint,
                counters_json,
                needs_continuation,
                updated_at
            ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(slot) DO UPDATE SET
                cursor=excluded.cursor,
                total_entities=excluded.total_entities,
                entity_fingerprint=excluded.entity_fingerprint,
                counters_json=excluded.counters_json,
                needs_continuation=excluded.needs_continuation,
                updated_at=excluded.updated_at
            ",
            params![
                checkpoint.cursor as i64,
                checkpoint.total_entities as i64,
                checkpoint.entity_fingerprint,
                counters_json,
                checkpoint.needs_continuation as i64,
                checkpoint.updated_at.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    pub fn load_checkpoint(&self) -> Result<Option<RunCheckpoint>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT cursor, total_entities, entity_fingerprint, counters_json,
                       needs_continuation, updated_at
                FROM run_checkpoint
                WHERE slot = 1
                ",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((cursor, total, fingerprint, counters_json, needs_continuation, updated_at)) = row
        else {
            return Ok(None);
        };

        let counters: RunCounters = serde_json::from_str(&counters_json)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        Ok(Some(RunCheckpoint {
            cursor: cursor.max(0) as usize,
            total_entities: total.max(0) as usize,
            entity_fingerprint: fingerprint,
            counters,
            needs_continuation: needs_continuation != 0,
            updated_at: parse_timestamp(updated_at)?,
        }))
    }

    /// Forgets the resume position together with the transferred-asset set it guards.
    pub fn clear_checkpoint(&self) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM run_checkpoint", [])?;
        tx.execute("DELETE FROM transferred_assets", [])?;
        tx.commit()?;
        Ok(())
    }

    /// Adds asset ids to the transferred set in one transaction. Returns how many were new.
    pub fn record_transferred(
        &self,
        asset_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        if asset_ids.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO transferred_assets (asset_id, recorded_at) VALUES (?1, ?2)",
            )?;
            let recorded_at = now.to_rfc3339();
            for asset_id in asset_ids {
                inserted += stmt.execute(params![asset_id, recorded_at])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn transferred_asset_ids(&self) -> Result<BTreeSet<String>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT asset_id FROM transferred_assets")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = BTreeSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }

    pub fn transferred_count(&self) -> Result<u64, StorageError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM transferred_assets", [], |row| {
                    row.get(0)
                })?;
        Ok(count.max(0) as u64)
    }

    /// Records an entity whose deletions await re-approval. A repeat entry for the same entity
    /// keeps its original position in the list.
    pub fn upsert_replay_entry(&self, entry: &ReplayEntry) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO deletion_replay (entity_name, reason, orphan_count, recorded_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(entity_name) DO UPDATE SET
                reason=excluded.reason,
                orphan_count=excluded.orphan_count,
                recorded_at=excluded.recorded_at
            ",
            params![
                entry.entity_name,
                entry.reason.as_str(),
                entry.orphan_count as i64,
                entry.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn remove_replay_entry(&self, entity_name: &str) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "DELETE FROM deletion_replay WHERE entity_name = ?1",
            [entity_name],
        )?;
        Ok(changes > 0)
    }

    pub fn replay_entries(&self) -> Result<Vec<ReplayEntry>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT entity_name, reason, orphan_count, recorded_at
            FROM deletion_replay
            ORDER BY position ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (entity_name, reason, orphan_count, recorded_at) = row?;
            let reason = reason
                .parse::<ReplayReason>()
                .map_err(StorageError::Serialization)?;
            entries.push(ReplayEntry {
                entity_name,
                reason,
                orphan_count: orphan_count.max(0) as usize,
                recorded_at: parse_timestamp(recorded_at)?,
            });
        }
        Ok(entries)
    }

    pub fn upsert_entity_failure(&self, failure: &EntityFailure) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO entity_failures (
                entity_id,
                entity_name,
                active,
                container_path,
                assets_in_source,
                assets_in_target,
                assets_failed,
                error,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(entity_id) DO UPDATE SET
                entity_name=excluded.entity_name,
                active=excluded.active,
                container_path=excluded.container_path,
                assets_in_source=excluded.assets_in_source,
                assets_in_target=excluded.assets_in_target,
                assets_failed=excluded.assets_failed,
                error=excluded.error,
                updated_at=excluded.updated_at
            ",
            params![
                failure.entity_id,
                failure.entity_name,
                failure.active as i64,
                failure.container_path,
                failure.assets_in_source as i64,
                failure.assets_in_target as i64,
                failure.assets_failed as i64,
                failure.error,
                failure.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn remove_entity_failure(&self, entity_id: &str) -> Result<bool, StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM entity_failures WHERE entity_id = ?1", [entity_id])?;
        Ok(changes > 0)
    }

    /// Failure reports: entities that could not be synced first, then worst first.
    pub fn entity_failures(&self) -> Result<Vec<EntityFailure>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT entity_id, entity_name, active, container_path,
                   assets_in_source, assets_in_target, assets_failed, error, updated_at
            FROM entity_failures
            ORDER BY error IS NULL, assets_failed DESC, entity_name ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut failures = Vec::new();
        for row in rows {
            let (entity_id, entity_name, active, container_path, source, target, failed, error, ts) =
                row?;
            failures.push(EntityFailure {
                entity_id,
                entity_name,
                active: active != 0,
                container_path,
                assets_in_source: source.max(0) as u64,
                assets_in_target: target.max(0) as u64,
                assets_failed: failed.max(0) as u64,
                error,
                updated_at: parse_timestamp(ts)?,
            });
        }
        Ok(failures)
    }

    pub fn clear_entity_failures(&self) -> Result<(), StorageError> {
        self.conn.execute("DELETE FROM entity_failures", [])?;
        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}
