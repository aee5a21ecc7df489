//! Conflict detection and resolution types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::Error;
use crate::models::MutationId;

/// A point-in-time view of one entity's fields
///
/// `BTreeMap` keeps field iteration deterministic, which keeps diffs and
/// merge output deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_type: String,
    pub entity_id: String,
    /// Last modification timestamp (Unix ms); None for never-synced records
    #[serde(default)]
    pub updated_at: Option<i64>,
    /// Soft-delete marker
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl EntitySnapshot {
    /// Build a snapshot from an opaque JSON payload.
    ///
    /// Non-object payloads become a single `value` field so scalar writes
    /// (e.g. a favorite toggle) still diff cleanly.
    pub fn from_payload(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        updated_at: Option<i64>,
        payload: &serde_json::Value,
    ) -> Self {
        let fields = match payload {
            serde_json::Value::Object(map) => {
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            other => {
                let mut map = BTreeMap::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            updated_at,
            deleted: false,
            fields,
        }
    }

    /// Field names present on either side whose values differ
    pub fn differing_fields(&self, other: &Self) -> Vec<String> {
        let mut names: Vec<&String> = self.fields.keys().chain(other.fields.keys()).collect();
        names.sort();
        names.dedup();

        names
            .into_iter()
            .filter(|name| self.fields.get(*name) != other.fields.get(*name))
            .cloned()
            .collect()
    }

    /// Whether this snapshot was modified strictly after `checkpoint_at`
    pub fn changed_since(&self, checkpoint_at: Option<i64>) -> bool {
        match (self.updated_at, checkpoint_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(at), Some(checkpoint)) => at > checkpoint,
        }
    }

    /// Render the fields back to a JSON payload
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// Per-entity-type conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LastWriteWins,
    ServerWins,
    ClientWins,
    FieldMerge,
    Manual,
}

impl ConflictStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LastWriteWins => "last_write_wins",
            Self::ServerWins => "server_wins",
            Self::ClientWins => "client_wins",
            Self::FieldMerge => "field_merge",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_write_wins" => Ok(Self::LastWriteWins),
            "server_wins" => Ok(Self::ServerWins),
            "client_wins" => Ok(Self::ClientWins),
            "field_merge" => Ok(Self::FieldMerge),
            "manual" => Ok(Self::Manual),
            other => Err(Error::Validation(format!("unknown strategy: {other}"))),
        }
    }
}

/// Which side a merge rule keeps for its field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeSide {
    Local,
    Server,
    /// Keep whichever side diverged from the checkpoint; defers when both did
    ChangedSide,
}

/// One declarative field-merge rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRule {
    pub field: String,
    pub side: MergeSide,
}

/// Conflict handling configuration for one entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConflictConfig {
    pub strategy: ConflictStrategy,
    #[serde(default)]
    pub merge_rules: Vec<MergeRule>,
    /// Timestamp differences at or under this are treated as simultaneous
    #[serde(default = "default_clock_skew_ms")]
    pub clock_skew_ms: i64,
}

const fn default_clock_skew_ms() -> i64 {
    2_000
}

impl EntityConflictConfig {
    pub const fn new(strategy: ConflictStrategy) -> Self {
        Self {
            strategy,
            merge_rules: Vec::new(),
            clock_skew_ms: default_clock_skew_ms(),
        }
    }

    #[must_use]
    pub fn with_rules(mut self, rules: Vec<MergeRule>) -> Self {
        self.merge_rules = rules;
        self
    }
}

impl Default for EntityConflictConfig {
    fn default() -> Self {
        Self::new(ConflictStrategy::LastWriteWins)
    }
}

/// Full diff of a detected conflict, persisted while resolution is pending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDetail {
    pub entity_type: String,
    pub entity_id: String,
    pub local: EntitySnapshot,
    pub server: EntitySnapshot,
    pub conflicting_fields: Vec<String>,
    pub strategy: ConflictStrategy,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
}

/// A deferred conflict awaiting user resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub mutation_id: MutationId,
    pub detail: ConflictDetail,
    pub created_at: i64,
}

/// User-chosen outcome for a pending conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Force the local value onto the server
    KeepLocal,
    /// Discard the local change
    KeepServer,
    /// Persist and push caller-supplied merged data
    Merge,
}

/// The side that won an automatic resolution, recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Local,
    Server,
    FieldMerge,
}

impl Winner {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Server => "server",
            Self::FieldMerge => "field_merge",
        }
    }
}

/// Outcome of one resolver invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// Neither side diverged from the checkpoint
    UpToDate,
    /// Only the local side changed; apply it directly, no conflict
    ApplyLocal(EntitySnapshot),
    /// Only the server side changed; apply it directly, no conflict
    ApplyServer(EntitySnapshot),
    /// Conflict auto-resolved into a snapshot ready to persist
    Resolved {
        snapshot: EntitySnapshot,
        winner: Winner,
    },
    /// Conflict requires user resolution
    Deferred(Box<ConflictDetail>),
    /// Both sides deleted the entity; nothing to reconcile
    AlreadyDeleted,
}

/// A journal row recorded for every automatic resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub strategy: String,
    pub winner: String,
    pub local_updated_at: Option<i64>,
    pub server_updated_at: Option<i64>,
    /// Resolution timestamp (Unix ms)
    pub resolved_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(updated_at: i64, fields: serde_json::Value) -> EntitySnapshot {
        EntitySnapshot::from_payload("tickets", "t-1", Some(updated_at), &fields)
    }

    #[test]
    fn test_from_scalar_payload() {
        let snap = EntitySnapshot::from_payload("favorites", "f-1", None, &json!(true));
        assert_eq!(snap.fields.get("value"), Some(&json!(true)));
    }

    #[test]
    fn test_differing_fields() {
        let a = snapshot(10, json!({"status": "used", "gate": "A"}));
        let b = snapshot(20, json!({"status": "refunded", "gate": "A"}));
        assert_eq!(a.differing_fields(&b), vec!["status".to_string()]);
    }

    #[test]
    fn test_differing_fields_missing_on_one_side() {
        let a = snapshot(10, json!({"status": "used"}));
        let b = snapshot(20, json!({"status": "used", "gate": "B"}));
        assert_eq!(a.differing_fields(&b), vec!["gate".to_string()]);
    }

    #[test]
    fn test_changed_since() {
        let snap = snapshot(100, json!({}));
        assert!(snap.changed_since(Some(99)));
        assert!(!snap.changed_since(Some(100)));
        assert!(snap.changed_since(None));

        let never = EntitySnapshot::from_payload("tickets", "t-1", None, &json!({}));
        assert!(!never.changed_since(Some(0)));
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = json!({"status": "used", "gate": "A"});
        let snap = snapshot(1, payload.clone());
        assert_eq!(snap.to_payload(), payload);
    }

    #[test]
    fn test_strategy_round_trip() {
        for s in [
            ConflictStrategy::LastWriteWins,
            ConflictStrategy::ServerWins,
            ConflictStrategy::ClientWins,
            ConflictStrategy::FieldMerge,
            ConflictStrategy::Manual,
        ] {
            assert_eq!(s.as_str().parse::<ConflictStrategy>().unwrap(), s);
        }
    }
}
