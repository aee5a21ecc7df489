//! Durable mutation queue service
//!
//! Thin async facade over [`SqliteQueueRepository`]: serializes storage
//! access behind the shared database lock, owns the backoff policy, and
//! emits [`QueueEvent`]s so observers never poll.

use std::sync::Arc;

use rand::Rng;
use tokio::sync::Mutex;

use crate::config::BackoffConfig;
use crate::db::{Database, QueueRepository, SqliteQueueRepository};
use crate::error::Result;
use crate::events::{EventBus, QueueEvent};
use crate::models::{MutationId, Operation, Priority, QueueItem, QueueItemStatus, QueueStats};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Durable, ordered store of pending local writes
pub struct MutationQueue {
    db: Arc<Mutex<Database>>,
    backoff: BackoffConfig,
    events: EventBus<QueueEvent>,
}

impl MutationQueue {
    pub fn new(db: Arc<Mutex<Database>>, backoff: BackoffConfig) -> Self {
        Self {
            db,
            backoff,
            events: EventBus::new(),
        }
    }

    /// Subscribe to queue events; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Append a pending write; durable before this returns
    pub async fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<QueueItem> {
        let item = {
            let db = self.db.lock().await;
            SqliteQueueRepository::new(db.connection()).enqueue(
                entity_type,
                entity_id,
                operation,
                payload,
                priority,
                now_ms(),
            )?
        };

        tracing::debug!(id = %item.id, entity_type, operation = operation.as_str(), "Enqueued mutation");
        self.events.emit(QueueEvent::Added { item: item.clone() });
        Ok(item)
    }

    /// Atomically claim up to `max_items` ready items as `processing`
    pub async fn dequeue_batch(&self, max_items: usize) -> Result<Vec<QueueItem>> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).dequeue_batch(max_items, now_ms())
    }

    /// Claim one specific pending item
    pub async fn claim_item(&self, id: &MutationId) -> Result<()> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).claim_item(id)
    }

    /// Complete a claimed item
    pub async fn mark_completed(&self, id: &MutationId) -> Result<()> {
        {
            let db = self.db.lock().await;
            SqliteQueueRepository::new(db.connection()).mark_completed(id, now_ms())?;
        }
        self.events.emit(QueueEvent::Completed { id: *id });
        Ok(())
    }

    /// Fail a claimed item; schedules the next retry unless `permanent`
    ///
    /// The attempt cap also flips the item permanent so a poisoned payload
    /// cannot loop forever.
    pub async fn mark_failed(&self, id: &MutationId, error: &str, permanent: bool) -> Result<()> {
        let permanent = {
            let db = self.db.lock().await;
            let repo = SqliteQueueRepository::new(db.connection());

            let attempts_so_far = repo
                .get(id)?
                .map(|item| item.attempt_count)
                .unwrap_or_default();
            let exhausted = attempts_so_far + 1 >= self.backoff.max_attempts;
            let permanent = permanent || exhausted;

            let next_attempt_at = if permanent {
                None
            } else {
                Some(now_ms() + self.backoff_delay_ms(attempts_so_far + 1))
            };
            repo.mark_failed(id, error, next_attempt_at, permanent)?;
            permanent
        };

        tracing::debug!(id = %id, error, permanent, "Mutation failed");
        self.events.emit(QueueEvent::Failed {
            id: *id,
            error: error.to_string(),
            permanent,
        });
        Ok(())
    }

    /// Re-arm all failed items whose backoff window elapsed
    pub async fn retry_failed(&self) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).retry_failed(now_ms())
    }

    /// Explicitly re-arm one failed item
    pub async fn retry_item(&self, id: &MutationId) -> Result<()> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).retry_item(id)
    }

    /// Destroy a pending or failed item
    pub async fn cancel(&self, id: &MutationId) -> Result<()> {
        {
            let db = self.db.lock().await;
            SqliteQueueRepository::new(db.connection()).cancel(id)?;
        }
        self.events.emit(QueueEvent::Cleared);
        Ok(())
    }

    pub async fn get(&self, id: &MutationId) -> Result<Option<QueueItem>> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).get(id)
    }

    pub async fn list(
        &self,
        status: Option<QueueItemStatus>,
        limit: usize,
    ) -> Result<Vec<QueueItem>> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).list(status, limit)
    }

    /// O(1) counters
    pub async fn stats(&self) -> Result<QueueStats> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).stats()
    }

    pub async fn unresolved_for_entity(&self, entity_type: &str) -> Result<Vec<QueueItem>> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).unresolved_for_entity(entity_type)
    }

    pub async fn unresolved_count_for_entity(&self, entity_type: &str) -> Result<u64> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).unresolved_count_for_entity(entity_type)
    }

    /// Replace an item's payload with merged data
    pub async fn update_payload(
        &self,
        id: &MutationId,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let db = self.db.lock().await;
        SqliteQueueRepository::new(db.connection()).update_payload(id, payload)
    }

    /// Drop completed items older than `retention_ms`
    pub async fn prune_completed(&self, retention_ms: i64) -> Result<usize> {
        let pruned = {
            let db = self.db.lock().await;
            SqliteQueueRepository::new(db.connection()).prune_completed(now_ms() - retention_ms)?
        };
        if pruned > 0 {
            tracing::info!(pruned, "Pruned completed queue items");
            self.events.emit(QueueEvent::Cleared);
        }
        Ok(pruned)
    }

    /// Re-arm items stranded in `processing` by a killed process
    pub async fn requeue_stranded(&self) -> Result<usize> {
        let rearmed = {
            let db = self.db.lock().await;
            SqliteQueueRepository::new(db.connection()).requeue_stranded()?
        };
        if rearmed > 0 {
            tracing::warn!(rearmed, "Re-armed mutations stranded by a previous process");
        }
        Ok(rearmed)
    }

    /// Exponential backoff with full jitter: a uniform draw from
    /// [0, min(cap, base * 2^(attempt-1))].
    fn backoff_delay_ms(&self, attempt: u32) -> i64 {
        let exponent = attempt.saturating_sub(1).min(31);
        let uncapped = self
            .backoff
            .base_delay_ms
            .saturating_mul(1_u64 << exponent);
        let ceiling = uncapped.min(self.backoff.max_delay_ms).max(1);
        let jittered = rand::thread_rng().gen_range(0..=ceiling);
        i64::try_from(jittered).unwrap_or(i64::MAX)
    }
}
