//! Mutation wrapper around queue items

use serde::{Deserialize, Serialize};

use crate::models::{ConflictDetail, MutationId, Operation, Priority, QueueItem, QueueItemStatus};

/// Mutation status as surfaced to user-facing code
///
/// Extends the durable queue status with `Conflict`: the underlying item
/// stays claimed (`processing`) while a pending conflict row exists, so a
/// replay can never pick it up again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Conflict,
}

impl MutationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
        }
    }
}

/// The handler's view of one recorded local write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: MutationId,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub status: MutationStatus,
    pub priority: Priority,
    pub created_at: i64,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Present iff status is `Conflict`
    pub conflict: Option<ConflictDetail>,
}

impl Mutation {
    /// Project a durable queue item, overlaying conflict state when a
    /// pending conflict exists for it.
    pub fn from_item(item: QueueItem, conflict: Option<ConflictDetail>) -> Self {
        let status = if conflict.is_some() {
            MutationStatus::Conflict
        } else {
            match item.status {
                QueueItemStatus::Pending => MutationStatus::Pending,
                QueueItemStatus::Processing => MutationStatus::Processing,
                QueueItemStatus::Completed => MutationStatus::Completed,
                QueueItemStatus::Failed => MutationStatus::Failed,
            }
        };

        Self {
            id: item.id,
            entity_type: item.entity_type,
            entity_id: item.entity_id,
            operation: item.operation,
            payload: item.payload,
            status,
            priority: item.priority,
            created_at: item.created_at,
            attempt_count: item.attempt_count,
            last_error: item.last_error,
            conflict,
        }
    }
}

/// Outcome of one queue drain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayResult {
    /// Items claimed and attempted this run
    pub attempted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Items parked as pending conflicts
    pub conflicts: u64,
    /// Run start (Unix ms)
    pub started_at: i64,
    pub duration_ms: u64,
}

impl ReplayResult {
    /// True when every attempted item reached `completed`
    pub const fn is_clean(&self) -> bool {
        self.failed == 0 && self.conflicts == 0
    }
}
