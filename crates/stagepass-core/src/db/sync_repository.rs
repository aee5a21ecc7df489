//! Sync cursor, pass marker, result, and conflict storage

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for counts/LIMIT

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{
    ConflictDetail, EntitySyncStatus, MutationId, PendingConflict, ResolutionRecord, SyncResult,
    SyncTaskState,
};

/// Trait for sync bookkeeping storage
pub trait SyncStateRepository {
    /// Cursor record for one entity type
    fn get_status(&self, entity_type: &str) -> Result<Option<EntitySyncStatus>>;

    /// Upsert a cursor record
    fn put_status(&self, status: &EntitySyncStatus) -> Result<()>;

    /// All cursor records
    fn all_statuses(&self) -> Result<Vec<EntitySyncStatus>>;

    /// Persist a pass outcome; only the latest is ever read back
    fn record_result(&self, result: &SyncResult, now: i64) -> Result<()>;

    /// Most recent pass outcome, surviving restarts
    fn last_result(&self) -> Result<Option<SyncResult>>;

    /// Claim the durable pass marker. A marker younger than `stale_after_ms`
    /// belongs to a live pass and is an error; an older one is from a killed
    /// process and is reclaimed.
    fn begin_pass(&self, pass_id: &str, now: i64, stale_after_ms: i64) -> Result<()>;

    /// Release the durable pass marker
    fn end_pass(&self, pass_id: &str) -> Result<()>;

    /// True when a marker row exists (any age)
    fn pass_marker(&self) -> Result<Option<(String, i64)>>;

    /// Park a deferred conflict
    fn insert_pending_conflict(&self, conflict: &PendingConflict) -> Result<()>;

    /// All parked conflicts, oldest first
    fn list_pending_conflicts(&self) -> Result<Vec<PendingConflict>>;

    /// Fetch one parked conflict
    fn get_pending_conflict(&self, id: &MutationId) -> Result<Option<PendingConflict>>;

    /// Remove and return one parked conflict
    fn take_pending_conflict(&self, id: &MutationId) -> Result<Option<PendingConflict>>;

    /// Append an automatic-resolution journal row
    fn journal_resolution(
        &self,
        detail: &ConflictDetail,
        winner: &str,
        resolved_at: i64,
    ) -> Result<()>;

    /// Recent journal rows, newest first
    fn list_journal(&self, limit: usize) -> Result<Vec<ResolutionRecord>>;
}

/// `SQLite` implementation of `SyncStateRepository`
pub struct SqliteSyncRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteSyncRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_status(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntitySyncStatus> {
        let last_task_state: Option<String> = row.get(5)?;
        Ok(EntitySyncStatus {
            entity_type: row.get(0)?,
            is_connected: row.get::<_, i32>(1)? != 0,
            last_sync_at: row.get(2)?,
            pending_changes: u64::try_from(row.get::<_, i64>(3)?.max(0)).unwrap_or(0),
            last_error: row.get(4)?,
            last_task_state: last_task_state.and_then(|s| s.parse::<SyncTaskState>().ok()),
            resume_cursor: row.get(6)?,
        })
    }

    fn parse_pending(row: &rusqlite::Row<'_>) -> Result<PendingConflict> {
        let id: String = row.get(0)?;
        let detail: String = row.get(1)?;
        Ok(PendingConflict {
            mutation_id: id
                .parse()
                .map_err(|_| Error::Validation(format!("invalid mutation id: {id}")))?,
            detail: serde_json::from_str(&detail)?,
            created_at: row.get(2)?,
        })
    }

    const STATUS_COLUMNS: &'static str = "entity_type, is_connected, last_sync_at, \
         pending_changes, last_error, last_task_state, resume_cursor";
}

impl SyncStateRepository for SqliteSyncRepository<'_> {
    fn get_status(&self, entity_type: &str) -> Result<Option<EntitySyncStatus>> {
        let status = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM entity_sync_status WHERE entity_type = ?",
                    Self::STATUS_COLUMNS
                ),
                params![entity_type],
                Self::parse_status,
            )
            .optional()?;
        Ok(status)
    }

    fn put_status(&self, status: &EntitySyncStatus) -> Result<()> {
        self.conn.execute(
            "INSERT INTO entity_sync_status
                (entity_type, is_connected, last_sync_at, pending_changes, last_error,
                 last_task_state, resume_cursor)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(entity_type) DO UPDATE SET
                is_connected = excluded.is_connected,
                last_sync_at = excluded.last_sync_at,
                pending_changes = excluded.pending_changes,
                last_error = excluded.last_error,
                last_task_state = excluded.last_task_state,
                resume_cursor = excluded.resume_cursor",
            params![
                status.entity_type,
                i32::from(status.is_connected),
                status.last_sync_at,
                status.pending_changes as i64,
                status.last_error,
                status.last_task_state.map(SyncTaskState::as_str),
                status.resume_cursor,
            ],
        )?;
        Ok(())
    }

    fn all_statuses(&self) -> Result<Vec<EntitySyncStatus>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM entity_sync_status ORDER BY entity_type",
            Self::STATUS_COLUMNS
        ))?;
        let statuses = stmt
            .query_map([], Self::parse_status)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(statuses)
    }

    fn record_result(&self, result: &SyncResult, now: i64) -> Result<()> {
        let payload = serde_json::to_string(result)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO sync_results (payload, created_at) VALUES (?, ?)",
            params![payload, now],
        )?;
        // Keep the table bounded; only the latest result is the API surface
        tx.execute(
            "DELETE FROM sync_results
             WHERE id NOT IN (SELECT id FROM sync_results ORDER BY id DESC LIMIT 20)",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn last_result(&self) -> Result<Option<SyncResult>> {
        let payload: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM sync_results ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|p| serde_json::from_str(&p).map_err(Error::from))
            .transpose()
    }

    fn begin_pass(&self, pass_id: &str, now: i64, stale_after_ms: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        let existing: Option<(String, i64)> = tx
            .query_row(
                "SELECT pass_id, started_at FROM sync_pass WHERE slot = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((held_by, started_at)) = existing {
            if now - started_at < stale_after_ms {
                return Err(Error::PassActive(held_by));
            }
            tracing::warn!(
                pass_id = %held_by,
                started_at,
                "Reclaiming stale pass marker from a killed process"
            );
            tx.execute("DELETE FROM sync_pass WHERE slot = 1", [])?;
        }

        tx.execute(
            "INSERT INTO sync_pass (slot, pass_id, started_at) VALUES (1, ?, ?)",
            params![pass_id, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn end_pass(&self, pass_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM sync_pass WHERE slot = 1 AND pass_id = ?",
            params![pass_id],
        )?;
        Ok(())
    }

    fn pass_marker(&self) -> Result<Option<(String, i64)>> {
        let marker = self
            .conn
            .query_row(
                "SELECT pass_id, started_at FROM sync_pass WHERE slot = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(marker)
    }

    fn insert_pending_conflict(&self, conflict: &PendingConflict) -> Result<()> {
        let detail = serde_json::to_string(&conflict.detail)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO pending_conflicts (mutation_id, detail, created_at)
             VALUES (?, ?, ?)",
            params![
                conflict.mutation_id.as_str(),
                detail,
                conflict.created_at
            ],
        )?;
        Ok(())
    }

    fn list_pending_conflicts(&self) -> Result<Vec<PendingConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT mutation_id, detail, created_at FROM pending_conflicts
             ORDER BY created_at ASC",
        )?;

        let mut conflicts = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            conflicts.push(Self::parse_pending(row)?);
        }
        Ok(conflicts)
    }

    fn get_pending_conflict(&self, id: &MutationId) -> Result<Option<PendingConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT mutation_id, detail, created_at FROM pending_conflicts
             WHERE mutation_id = ?",
        )?;
        let mut rows = stmt.query(params![id.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::parse_pending(row)?)),
            None => Ok(None),
        }
    }

    fn take_pending_conflict(&self, id: &MutationId) -> Result<Option<PendingConflict>> {
        let conflict = self.get_pending_conflict(id)?;
        if conflict.is_some() {
            self.conn.execute(
                "DELETE FROM pending_conflicts WHERE mutation_id = ?",
                params![id.as_str()],
            )?;
        }
        Ok(conflict)
    }

    fn journal_resolution(
        &self,
        detail: &ConflictDetail,
        winner: &str,
        resolved_at: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO conflict_journal
                (entity_type, entity_id, strategy, winner, local_updated_at,
                 server_updated_at, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                detail.entity_type,
                detail.entity_id,
                detail.strategy.as_str(),
                winner,
                detail.local.updated_at,
                detail.server.updated_at,
                resolved_at,
            ],
        )?;
        Ok(())
    }

    fn list_journal(&self, limit: usize) -> Result<Vec<ResolutionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_type, entity_id, strategy, winner, local_updated_at,
                    server_updated_at, resolved_at
             FROM conflict_journal ORDER BY resolved_at DESC, id DESC LIMIT ?",
        )?;

        let records = stmt
            .query_map(params![limit as i64], |row| {
                Ok(ResolutionRecord {
                    id: row.get(0)?,
                    entity_type: row.get(1)?,
                    entity_id: row.get(2)?,
                    strategy: row.get(3)?,
                    winner: row.get(4)?,
                    local_updated_at: row.get(5)?,
                    server_updated_at: row.get(6)?,
                    resolved_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{ConflictStrategy, EntitySnapshot};
    use serde_json::json;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn detail() -> ConflictDetail {
        ConflictDetail {
            entity_type: "tickets".into(),
            entity_id: "t-1".into(),
            local: EntitySnapshot::from_payload("tickets", "t-1", Some(10), &json!({"s": 1})),
            server: EntitySnapshot::from_payload("tickets", "t-1", Some(20), &json!({"s": 2})),
            conflicting_fields: vec!["s".into()],
            strategy: ConflictStrategy::Manual,
            detected_at: 30,
        }
    }

    #[test]
    fn test_status_round_trip() {
        let db = setup();
        let repo = SqliteSyncRepository::new(db.connection());

        assert!(repo.get_status("tickets").unwrap().is_none());

        let mut status = EntitySyncStatus::new("tickets");
        status.last_sync_at = Some(1_000);
        status.pending_changes = 3;
        status.last_task_state = Some(SyncTaskState::Completed);
        repo.put_status(&status).unwrap();

        let loaded = repo.get_status("tickets").unwrap().unwrap();
        assert_eq!(loaded, status);

        status.last_sync_at = Some(2_000);
        repo.put_status(&status).unwrap();
        assert_eq!(
            repo.get_status("tickets").unwrap().unwrap().last_sync_at,
            Some(2_000)
        );
        assert_eq!(repo.all_statuses().unwrap().len(), 1);
    }

    #[test]
    fn test_last_result_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sync.db");

        let result = SyncResult {
            success: true,
            cancelled: false,
            pulled: 10,
            pushed: 2,
            errors: Vec::new(),
            started_at: 500,
            duration_ms: 80,
            reason: None,
        };

        {
            let db = Database::open(&path).unwrap();
            let repo = SqliteSyncRepository::new(db.connection());
            repo.record_result(&result, 600).unwrap();
        }

        let db = Database::open(&path).unwrap();
        let repo = SqliteSyncRepository::new(db.connection());
        assert_eq!(repo.last_result().unwrap().unwrap(), result);
    }

    #[test]
    fn test_pass_marker_excludes_concurrent_pass() {
        let db = setup();
        let repo = SqliteSyncRepository::new(db.connection());

        repo.begin_pass("pass-1", 1_000, 60_000).unwrap();
        let second = repo.begin_pass("pass-2", 2_000, 60_000);
        assert!(matches!(second, Err(Error::PassActive(id)) if id == "pass-1"));

        repo.end_pass("pass-1").unwrap();
        repo.begin_pass("pass-2", 3_000, 60_000).unwrap();
    }

    #[test]
    fn test_stale_pass_marker_reclaimed() {
        let db = setup();
        let repo = SqliteSyncRepository::new(db.connection());

        repo.begin_pass("dead-pass", 1_000, 60_000).unwrap();
        // Well past the lease: the marker belongs to a killed process
        repo.begin_pass("new-pass", 100_000, 60_000).unwrap();
        assert_eq!(repo.pass_marker().unwrap().unwrap().0, "new-pass");
    }

    #[test]
    fn test_end_pass_requires_matching_id() {
        let db = setup();
        let repo = SqliteSyncRepository::new(db.connection());

        repo.begin_pass("pass-1", 1_000, 60_000).unwrap();
        repo.end_pass("other").unwrap();
        assert!(repo.pass_marker().unwrap().is_some());
    }

    #[test]
    fn test_pending_conflict_round_trip() {
        let db = setup();
        let repo = SqliteSyncRepository::new(db.connection());

        let pending = PendingConflict {
            mutation_id: MutationId::new(),
            detail: detail(),
            created_at: 40,
        };
        repo.insert_pending_conflict(&pending).unwrap();

        assert_eq!(repo.list_pending_conflicts().unwrap(), vec![pending.clone()]);

        let taken = repo.take_pending_conflict(&pending.mutation_id).unwrap();
        assert_eq!(taken, Some(pending.clone()));
        assert!(repo.list_pending_conflicts().unwrap().is_empty());
        assert!(repo
            .take_pending_conflict(&pending.mutation_id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_journal() {
        let db = setup();
        let repo = SqliteSyncRepository::new(db.connection());

        repo.journal_resolution(&detail(), "server", 100).unwrap();
        repo.journal_resolution(&detail(), "local", 200).unwrap();

        let rows = repo.list_journal(10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].winner, "local");
        assert_eq!(rows[1].winner, "server");
    }
}
