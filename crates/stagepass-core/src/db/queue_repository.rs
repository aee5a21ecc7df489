//! Durable mutation queue storage

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT/OFFSET

use rusqlite::types::Type;
use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::models::{
    MutationId, Operation, Priority, QueueItem, QueueItemStatus, QueueStats,
};

/// Trait for queue item storage operations
pub trait QueueRepository {
    /// Append a new pending item; the assigned `seq` is monotonic
    fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: serde_json::Value,
        priority: Priority,
        now: i64,
    ) -> Result<QueueItem>;

    /// Atomically claim up to `max_items` ready items as `processing`,
    /// ordered by (priority desc, seq asc). Items parked behind a pending
    /// conflict are never claimed.
    fn dequeue_batch(&self, max_items: usize, now: i64) -> Result<Vec<QueueItem>>;

    /// Claim one specific pending item (pull-phase conflict parking)
    fn claim_item(&self, id: &MutationId) -> Result<()>;

    /// Transition a claimed item to `completed`
    fn mark_completed(&self, id: &MutationId, now: i64) -> Result<()>;

    /// Transition a claimed item to `failed`; `next_attempt_at` is the
    /// backoff window end, `permanent` blocks automatic re-arming
    fn mark_failed(
        &self,
        id: &MutationId,
        error: &str,
        next_attempt_at: Option<i64>,
        permanent: bool,
    ) -> Result<()>;

    /// Re-arm all non-permanent failed items whose window elapsed
    fn retry_failed(&self, now: i64) -> Result<usize>;

    /// Explicitly re-arm one failed item, ignoring window and permanence
    fn retry_item(&self, id: &MutationId) -> Result<()>;

    /// Destroy a pending or failed item; claimed items are rejected
    fn cancel(&self, id: &MutationId) -> Result<()>;

    /// Get an item by ID
    fn get(&self, id: &MutationId) -> Result<Option<QueueItem>>;

    /// List items, optionally filtered by status, oldest first
    fn list(&self, status: Option<QueueItemStatus>, limit: usize) -> Result<Vec<QueueItem>>;

    /// O(1) counters
    fn stats(&self) -> Result<QueueStats>;

    /// Unresolved (pending/processing/failed) items for one entity type
    fn unresolved_for_entity(&self, entity_type: &str) -> Result<Vec<QueueItem>>;

    /// Count of unresolved items for one entity type
    fn unresolved_count_for_entity(&self, entity_type: &str) -> Result<u64>;

    /// Replace an item's payload (merged rewrite before push)
    fn update_payload(&self, id: &MutationId, payload: &serde_json::Value) -> Result<()>;

    /// Delete completed items finished before `before`; returns count
    fn prune_completed(&self, before: i64) -> Result<usize>;

    /// Re-arm items stranded in `processing` by a killed process, except
    /// those parked behind a pending conflict
    fn requeue_stranded(&self) -> Result<usize>;
}

/// `SQLite` implementation of `QueueRepository`
pub struct SqliteQueueRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteQueueRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn bump_counter(conn: &Connection, status: QueueItemStatus, delta: i64) -> Result<()> {
        conn.execute(
            "UPDATE queue_counters SET count = count + ? WHERE status = ?",
            params![delta, status.as_str()],
        )?;
        Ok(())
    }

    /// Parse a queue item from a database row
    fn parse_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItem> {
        let id: String = row.get(1)?;
        let operation: String = row.get(4)?;
        let status: String = row.get(6)?;

        Ok(QueueItem {
            seq: row.get(0)?,
            id: id.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
            })?,
            entity_type: row.get(2)?,
            entity_id: row.get(3)?,
            operation: operation.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
            })?,
            payload: row.get(5)?,
            status: status.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e))
            })?,
            priority: Priority::from_i64(row.get(7)?),
            created_at: row.get(8)?,
            attempt_count: row.get(9)?,
            last_error: row.get(10)?,
            next_attempt_at: row.get(11)?,
            permanently_failed: row.get::<_, i32>(12)? != 0,
        })
    }

    const SELECT_COLUMNS: &'static str = "seq, id, entity_type, entity_id, operation, payload, \
         status, priority, created_at, attempt_count, last_error, next_attempt_at, \
         permanently_failed";

    fn get_required(&self, id: &MutationId) -> Result<QueueItem> {
        self.get(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }
}

impl QueueRepository for SqliteQueueRepository<'_> {
    fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: serde_json::Value,
        priority: Priority,
        now: i64,
    ) -> Result<QueueItem> {
        let id = MutationId::new();
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO queue_items
                (id, entity_type, entity_id, operation, payload, status, priority, created_at)
             VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)",
            params![
                id.as_str(),
                entity_type,
                entity_id,
                operation.as_str(),
                payload,
                priority.as_i64(),
                now
            ],
        )?;
        let seq = tx.last_insert_rowid();
        Self::bump_counter(&tx, QueueItemStatus::Pending, 1)?;
        tx.commit()?;

        Ok(QueueItem {
            id,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            operation,
            payload,
            status: QueueItemStatus::Pending,
            priority,
            seq,
            created_at: now,
            attempt_count: 0,
            last_error: None,
            next_attempt_at: None,
            permanently_failed: false,
        })
    }

    fn dequeue_batch(&self, max_items: usize, now: i64) -> Result<Vec<QueueItem>> {
        let tx = self.conn.unchecked_transaction()?;

        let mut items = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM queue_items
                 WHERE status = 'pending'
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
                   AND id NOT IN (SELECT mutation_id FROM pending_conflicts)
                 ORDER BY priority DESC, seq ASC
                 LIMIT ?",
                Self::SELECT_COLUMNS
            ))?;

            let x = stmt.query_map(params![now, max_items as i64], Self::parse_item)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            x
        };

        for item in &mut items {
            let changed = tx.execute(
                "UPDATE queue_items SET status = 'processing'
                 WHERE id = ? AND status = 'pending'",
                params![item.id.as_str()],
            )?;
            // The lock on the connection means nobody raced us, but the
            // guard keeps the claim correct even without it
            if changed == 1 {
                item.status = QueueItemStatus::Processing;
            }
        }
        items.retain(|item| item.status == QueueItemStatus::Processing);

        let claimed = items.len() as i64;
        if claimed > 0 {
            Self::bump_counter(&tx, QueueItemStatus::Pending, -claimed)?;
            Self::bump_counter(&tx, QueueItemStatus::Processing, claimed)?;
        }
        tx.commit()?;

        Ok(items)
    }

    fn claim_item(&self, id: &MutationId) -> Result<()> {
        let item = self.get_required(id)?;
        if !item.status.can_transition(QueueItemStatus::Processing) {
            return Err(Error::InvalidTransition {
                from: item.status.as_str(),
                to: QueueItemStatus::Processing.as_str(),
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE queue_items SET status = 'processing' WHERE id = ? AND status = 'pending'",
            params![id.as_str()],
        )?;
        Self::bump_counter(&tx, QueueItemStatus::Pending, -1)?;
        Self::bump_counter(&tx, QueueItemStatus::Processing, 1)?;
        tx.commit()?;
        Ok(())
    }

    fn mark_completed(&self, id: &MutationId, now: i64) -> Result<()> {
        let item = self.get_required(id)?;
        if !item.status.can_transition(QueueItemStatus::Completed) {
            return Err(Error::InvalidTransition {
                from: item.status.as_str(),
                to: QueueItemStatus::Completed.as_str(),
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE queue_items
             SET status = 'completed', completed_at = ?, last_error = NULL
             WHERE id = ?",
            params![now, id.as_str()],
        )?;
        Self::bump_counter(&tx, item.status, -1)?;
        Self::bump_counter(&tx, QueueItemStatus::Completed, 1)?;
        tx.commit()?;
        Ok(())
    }

    fn mark_failed(
        &self,
        id: &MutationId,
        error: &str,
        next_attempt_at: Option<i64>,
        permanent: bool,
    ) -> Result<()> {
        let item = self.get_required(id)?;
        if !item.status.can_transition(QueueItemStatus::Failed) {
            return Err(Error::InvalidTransition {
                from: item.status.as_str(),
                to: QueueItemStatus::Failed.as_str(),
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE queue_items
             SET status = 'failed',
                 attempt_count = attempt_count + 1,
                 last_error = ?,
                 next_attempt_at = ?,
                 permanently_failed = ?
             WHERE id = ?",
            params![error, next_attempt_at, i32::from(permanent), id.as_str()],
        )?;
        Self::bump_counter(&tx, item.status, -1)?;
        Self::bump_counter(&tx, QueueItemStatus::Failed, 1)?;
        tx.commit()?;
        Ok(())
    }

    fn retry_failed(&self, now: i64) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let rearmed = tx.execute(
            "UPDATE queue_items
             SET status = 'pending', next_attempt_at = NULL
             WHERE status = 'failed'
               AND permanently_failed = 0
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?)",
            params![now],
        )?;
        if rearmed > 0 {
            Self::bump_counter(&tx, QueueItemStatus::Failed, -(rearmed as i64))?;
            Self::bump_counter(&tx, QueueItemStatus::Pending, rearmed as i64)?;
        }
        tx.commit()?;
        Ok(rearmed)
    }

    fn retry_item(&self, id: &MutationId) -> Result<()> {
        let item = self.get_required(id)?;
        if !item.status.can_transition(QueueItemStatus::Pending) {
            return Err(Error::InvalidTransition {
                from: item.status.as_str(),
                to: QueueItemStatus::Pending.as_str(),
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE queue_items
             SET status = 'pending', next_attempt_at = NULL, permanently_failed = 0
             WHERE id = ?",
            params![id.as_str()],
        )?;
        Self::bump_counter(&tx, QueueItemStatus::Failed, -1)?;
        Self::bump_counter(&tx, QueueItemStatus::Pending, 1)?;
        tx.commit()?;
        Ok(())
    }

    fn cancel(&self, id: &MutationId) -> Result<()> {
        let item = self.get_required(id)?;
        match item.status {
            QueueItemStatus::Processing => Err(Error::ItemProcessing(id.to_string())),
            QueueItemStatus::Completed => Err(Error::Validation(format!(
                "mutation {id} already completed"
            ))),
            status @ (QueueItemStatus::Pending | QueueItemStatus::Failed) => {
                let tx = self.conn.unchecked_transaction()?;
                tx.execute("DELETE FROM queue_items WHERE id = ?", params![id.as_str()])?;
                Self::bump_counter(&tx, status, -1)?;
                tx.commit()?;
                Ok(())
            }
        }
    }

    fn get(&self, id: &MutationId) -> Result<Option<QueueItem>> {
        let result = self.conn.query_row(
            &format!(
                "SELECT {} FROM queue_items WHERE id = ?",
                Self::SELECT_COLUMNS
            ),
            params![id.as_str()],
            Self::parse_item,
        );

        match result {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, status: Option<QueueItemStatus>, limit: usize) -> Result<Vec<QueueItem>> {
        let items = match status {
            Some(status) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM queue_items WHERE status = ? ORDER BY seq ASC LIMIT ?",
                    Self::SELECT_COLUMNS
                ))?;
                let x = stmt.query_map(params![status.as_str(), limit as i64], Self::parse_item)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                x
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {} FROM queue_items ORDER BY seq ASC LIMIT ?",
                    Self::SELECT_COLUMNS
                ))?;
                let x = stmt.query_map(params![limit as i64], Self::parse_item)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                x
            }
        };
        Ok(items)
    }

    fn stats(&self) -> Result<QueueStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, count FROM queue_counters")?;
        let mut stats = QueueStats::default();

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            let count = u64::try_from(count.max(0)).unwrap_or(0);
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    fn unresolved_for_entity(&self, entity_type: &str) -> Result<Vec<QueueItem>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM queue_items
             WHERE entity_type = ? AND status IN ('pending', 'processing', 'failed')
             ORDER BY seq ASC",
            Self::SELECT_COLUMNS
        ))?;

        let items = stmt
            .query_map(params![entity_type], Self::parse_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn unresolved_count_for_entity(&self, entity_type: &str) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM queue_items
             WHERE entity_type = ? AND status IN ('pending', 'processing', 'failed')",
            params![entity_type],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count.max(0)).unwrap_or(0))
    }

    fn update_payload(&self, id: &MutationId, payload: &serde_json::Value) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE queue_items SET payload = ? WHERE id = ?",
            params![payload, id.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn prune_completed(&self, before: i64) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let pruned = tx.execute(
            "DELETE FROM queue_items
             WHERE status = 'completed' AND completed_at IS NOT NULL AND completed_at < ?",
            params![before],
        )?;
        if pruned > 0 {
            Self::bump_counter(&tx, QueueItemStatus::Completed, -(pruned as i64))?;
        }
        tx.commit()?;
        Ok(pruned)
    }

    fn requeue_stranded(&self) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let rearmed = tx.execute(
            "UPDATE queue_items
             SET status = 'pending'
             WHERE status = 'processing'
               AND id NOT IN (SELECT mutation_id FROM pending_conflicts)",
            [],
        )?;
        if rearmed > 0 {
            Self::bump_counter(&tx, QueueItemStatus::Processing, -(rearmed as i64))?;
            Self::bump_counter(&tx, QueueItemStatus::Pending, rearmed as i64)?;
        }
        tx.commit()?;
        Ok(rearmed)
    }
}
