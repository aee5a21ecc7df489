//! Database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|v| v != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: mutation queue
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        -- seq doubles as the monotonic enqueue sequence; AUTOINCREMENT
        -- guarantees it is never reused after deletes
        CREATE TABLE IF NOT EXISTS queue_items (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            priority INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            next_attempt_at INTEGER,
            permanently_failed INTEGER NOT NULL DEFAULT 0,
            completed_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_queue_claim
            ON queue_items(status, priority DESC, seq ASC);
        CREATE INDEX IF NOT EXISTS idx_queue_entity
            ON queue_items(entity_type, entity_id);
        CREATE TABLE IF NOT EXISTS queue_counters (
            status TEXT PRIMARY KEY,
            count INTEGER NOT NULL DEFAULT 0
        );
        INSERT OR IGNORE INTO queue_counters (status, count) VALUES
            ('pending', 0), ('processing', 0), ('completed', 0), ('failed', 0);
        INSERT INTO schema_version (version) VALUES (1);
        COMMIT;",
    )?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: per-entity cursors, pass marker, last results
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS entity_sync_status (
            entity_type TEXT PRIMARY KEY,
            is_connected INTEGER NOT NULL DEFAULT 0,
            last_sync_at INTEGER,
            pending_changes INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_task_state TEXT,
            resume_cursor TEXT
        );
        CREATE TABLE IF NOT EXISTS sync_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        -- single-row table: a live row means a pass is active
        CREATE TABLE IF NOT EXISTS sync_pass (
            slot INTEGER PRIMARY KEY CHECK (slot = 1),
            pass_id TEXT NOT NULL,
            started_at INTEGER NOT NULL
        );
        INSERT INTO schema_version (version) VALUES (2);
        COMMIT;",
    )?;

    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: pending conflicts and the resolution journal
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS pending_conflicts (
            mutation_id TEXT PRIMARY KEY,
            detail TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS conflict_journal (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            strategy TEXT NOT NULL,
            winner TEXT NOT NULL,
            local_updated_at INTEGER,
            server_updated_at INTEGER,
            resolved_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conflict_journal_entity
            ON conflict_journal(entity_type, entity_id);
        CREATE INDEX IF NOT EXISTS idx_conflict_journal_resolved
            ON conflict_journal(resolved_at DESC);
        INSERT INTO schema_version (version) VALUES (3);
        COMMIT;",
    )?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
