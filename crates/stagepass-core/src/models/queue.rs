//! Mutation queue records

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// A unique identifier for a queued mutation, using UUID v7 (time-sortable)
///
/// Doubles as the idempotency key carried on every push, so a retried
/// network call after a timeout has effect at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId(Uuid);

impl MutationId {
    /// Create a new unique mutation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MutationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The kind of write a mutation records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Stable text form used in the durable store
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::Validation(format!("unknown operation: {other}"))),
        }
    }
}

/// Replay priority class; FIFO order applies within a class
///
/// Ticket scans and cashless payments must reach the server before
/// favorites, so user-money operations default to `High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Numeric form stored in the queue table; higher replays first
    pub const fn as_i64(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    /// Parse the stored numeric form
    pub const fn from_i64(value: i64) -> Self {
        match value {
            0 => Self::Low,
            2 => Self::High,
            _ => Self::Normal,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Durable queue item status; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueItemStatus {
    /// Stable text form used in the durable store
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether moving to `to` is a legal forward transition.
    ///
    /// `Failed -> Pending` is the explicit re-arm path; nothing else may
    /// move backwards.
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed | Self::Failed)
                | (Self::Failed, Self::Pending)
        )
    }
}

impl FromStr for QueueItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Validation(format!("unknown queue status: {other}"))),
        }
    }
}

/// One durable record of a pending local write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique identifier, also the push idempotency key
    pub id: MutationId,
    /// Entity type the write targets (e.g. "tickets")
    pub entity_type: String,
    /// Local or server entity id
    pub entity_id: String,
    /// Write kind
    pub operation: Operation,
    /// Opaque field snapshot sent to the server
    pub payload: serde_json::Value,
    /// Current durable status
    pub status: QueueItemStatus,
    /// Replay priority class
    pub priority: Priority,
    /// Monotonic enqueue sequence, FIFO tie-break within a priority
    pub seq: i64,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Number of replay attempts so far
    pub attempt_count: u32,
    /// Message from the most recent failure
    pub last_error: Option<String>,
    /// Earliest retry time (Unix ms) computed by backoff; None = ready
    pub next_attempt_at: Option<i64>,
    /// Set when automatic retry must never re-arm this item
    pub permanently_failed: bool,
}

impl QueueItem {
    /// Whether the backoff window has elapsed at `now` (Unix ms)
    pub fn retry_window_elapsed(&self, now: i64) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// O(1) queue counters maintained alongside every status transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Items still awaiting a terminal outcome
    pub const fn unresolved(&self) -> u64 {
        self.pending + self.processing + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_id_unique() {
        let id1 = MutationId::new();
        let id2 = MutationId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_mutation_id_parse() {
        let id = MutationId::new();
        let parsed: MutationId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_operation_round_trip() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::from_i64(2), Priority::High);
        assert_eq!(Priority::from_i64(7), Priority::Normal);
    }

    #[test]
    fn test_forward_transitions() {
        use QueueItemStatus::{Completed, Failed, Pending, Processing};

        assert!(Pending.can_transition(Processing));
        assert!(Processing.can_transition(Completed));
        assert!(Processing.can_transition(Failed));
        assert!(Failed.can_transition(Pending));

        assert!(!Completed.can_transition(Pending));
        assert!(!Completed.can_transition(Processing));
        assert!(!Pending.can_transition(Completed));
        assert!(!Failed.can_transition(Processing));
    }

    #[test]
    fn test_retry_window() {
        let mut item = QueueItem {
            id: MutationId::new(),
            entity_type: "tickets".into(),
            entity_id: "t-1".into(),
            operation: Operation::Update,
            payload: serde_json::json!({"status": "used"}),
            status: QueueItemStatus::Failed,
            priority: Priority::High,
            seq: 1,
            created_at: 1_000,
            attempt_count: 1,
            last_error: Some("timeout".into()),
            next_attempt_at: Some(5_000),
            permanently_failed: false,
        };

        assert!(!item.retry_window_elapsed(4_999));
        assert!(item.retry_window_elapsed(5_000));

        item.next_attempt_at = None;
        assert!(item.retry_window_elapsed(0));
    }
}
