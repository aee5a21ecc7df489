//! Sync pass state types

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::Error;

/// Phases of one sync pass, in strict order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Preparing,
    Authenticating,
    Pulling,
    ResolvingConflicts,
    Pushing,
    Finalizing,
    Completed,
    Failed,
}

impl SyncPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Authenticating => "authenticating",
            Self::Pulling => "pulling",
            Self::ResolvingConflicts => "resolving_conflicts",
            Self::Pushing => "pushing",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal phases end a pass
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Per-task state inside a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SyncTaskState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SyncTaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Validation(format!("unknown task state: {other}"))),
        }
    }
}

/// One unit of work in a pass, scoped to a single entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTask {
    pub entity_type: String,
    pub state: SyncTaskState,
    pub pulled: u64,
    pub pushed: u64,
    pub error: Option<String>,
    /// Batch cursor for resuming a failed task
    pub cursor: Option<String>,
}

impl SyncTask {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            state: SyncTaskState::Pending,
            pulled: 0,
            pushed: 0,
            error: None,
            cursor: None,
        }
    }
}

/// Fine-grained progress emitted during pulling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub entity_type: Option<String>,
    pub total_items: Option<u64>,
    pub processed_items: u64,
    pub current_batch: u32,
    pub total_batches: Option<u32>,
    /// From a moving average of per-batch duration
    pub estimated_remaining_ms: Option<u64>,
}

/// A per-entity error accumulated during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgressError {
    pub entity_type: String,
    pub phase: SyncPhase,
    pub message: String,
}

/// Immutable outcome record of one pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    /// Set when the pass ended via `cancel_sync`
    pub cancelled: bool,
    pub pulled: u64,
    pub pushed: u64,
    pub errors: Vec<SyncProgressError>,
    /// Pass start (Unix ms)
    pub started_at: i64,
    pub duration_ms: u64,
    /// Reason for failure or cancellation, when not successful
    pub reason: Option<String>,
}

impl SyncResult {
    pub fn failed(started_at: i64, duration_ms: u64, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            cancelled: false,
            pulled: 0,
            pushed: 0,
            errors: Vec::new(),
            started_at,
            duration_ms,
            reason: Some(reason.into()),
        }
    }
}

/// Per-entity-type sync cursor, mutated only at task/phase boundaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySyncStatus {
    pub entity_type: String,
    pub is_connected: bool,
    /// Delta cursor for the next pull (Unix ms)
    pub last_sync_at: Option<i64>,
    pub pending_changes: u64,
    pub last_error: Option<String>,
    /// Outcome of the most recent task touching this entity
    pub last_task_state: Option<SyncTaskState>,
    /// Saved batch cursor, reused by `retry_failed_sync`
    pub resume_cursor: Option<String>,
}

impl EntitySyncStatus {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            is_connected: false,
            last_sync_at: None,
            pending_changes: 0,
            last_error: None,
            last_task_state: None,
            resume_cursor: None,
        }
    }
}
