//! Stateless conflict detection and resolution
//!
//! A conflict exists iff both the local and server snapshots changed after
//! the last common sync checkpoint AND at least one overlapping field
//! differs. One-sided changes are applied directly; double deletes are a
//! no-op. Everything else is decided by the entity's configured strategy.

use crate::models::{
    ConflictDetail, ConflictOutcome, ConflictStrategy, EntityConflictConfig, EntitySnapshot,
    MergeRule, MergeSide, Winner,
};

/// The last common sync point both sides agreed on
///
/// `base` is the checkpoint snapshot when the store retains one; with it,
/// "changed" means content actually diverged, so a side that rewrote a
/// record back to its checkpoint value is not treated as changed.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    /// Checkpoint timestamp (Unix ms); None = never synced
    pub at: Option<i64>,
    pub base: Option<EntitySnapshot>,
}

impl Checkpoint {
    pub const fn at(at: Option<i64>) -> Self {
        Self { at, base: None }
    }
}

/// Stateless merge decision function; owns no data
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Decide how local and server versions of one entity reconcile.
    pub fn resolve(
        local: &EntitySnapshot,
        server: &EntitySnapshot,
        checkpoint: &Checkpoint,
        config: &EntityConflictConfig,
    ) -> ConflictOutcome {
        if local.deleted && server.deleted {
            return ConflictOutcome::AlreadyDeleted;
        }

        let local_changed = Self::side_changed(local, checkpoint);
        let server_changed = Self::side_changed(server, checkpoint);

        match (local_changed, server_changed) {
            (false, false) => ConflictOutcome::UpToDate,
            (true, false) => ConflictOutcome::ApplyLocal(local.clone()),
            (false, true) => ConflictOutcome::ApplyServer(server.clone()),
            (true, true) => Self::resolve_divergence(local, server, checkpoint, config),
        }
    }

    /// Whether one side diverged from the checkpoint.
    fn side_changed(side: &EntitySnapshot, checkpoint: &Checkpoint) -> bool {
        if let Some(base) = &checkpoint.base {
            return side.deleted != base.deleted || !side.differing_fields(base).is_empty();
        }
        side.changed_since(checkpoint.at) || side.deleted
    }

    fn resolve_divergence(
        local: &EntitySnapshot,
        server: &EntitySnapshot,
        checkpoint: &Checkpoint,
        config: &EntityConflictConfig,
    ) -> ConflictOutcome {
        let conflicting_fields = local.differing_fields(server);
        let deletion_mismatch = local.deleted != server.deleted;

        // Convergent edits: both sides changed, but to identical content
        if conflicting_fields.is_empty() && !deletion_mismatch {
            return ConflictOutcome::ApplyServer(server.clone());
        }

        match config.strategy {
            ConflictStrategy::ServerWins => ConflictOutcome::Resolved {
                snapshot: server.clone(),
                winner: Winner::Server,
            },
            ConflictStrategy::ClientWins => ConflictOutcome::Resolved {
                snapshot: local.clone(),
                winner: Winner::Local,
            },
            ConflictStrategy::LastWriteWins => {
                Self::last_write_wins(local, server, config.clock_skew_ms)
            }
            ConflictStrategy::FieldMerge => {
                if deletion_mismatch {
                    // A field list cannot merge a delete-vs-edit split
                    return Self::defer(local, server, &conflicting_fields, config);
                }
                Self::field_merge(local, server, checkpoint, &conflicting_fields, config)
            }
            ConflictStrategy::Manual => Self::defer(local, server, &conflicting_fields, config),
        }
    }

    /// Later `updated_at` wins. Differences at or under the skew tolerance
    /// are treated as simultaneous and the server wins, which also covers
    /// the exact-tie case.
    fn last_write_wins(
        local: &EntitySnapshot,
        server: &EntitySnapshot,
        clock_skew_ms: i64,
    ) -> ConflictOutcome {
        let local_at = local.updated_at.unwrap_or(0);
        let server_at = server.updated_at.unwrap_or(0);

        if (local_at - server_at).abs() <= clock_skew_ms || local_at < server_at {
            ConflictOutcome::Resolved {
                snapshot: server.clone(),
                winner: Winner::Server,
            }
        } else {
            ConflictOutcome::Resolved {
                snapshot: local.clone(),
                winner: Winner::Local,
            }
        }
    }

    /// Apply declarative merge rules field by field. Any conflicting field
    /// without a decisive rule defers the whole record; a partial merge
    /// would silently drop one side's data.
    fn field_merge(
        local: &EntitySnapshot,
        server: &EntitySnapshot,
        checkpoint: &Checkpoint,
        conflicting_fields: &[String],
        config: &EntityConflictConfig,
    ) -> ConflictOutcome {
        let mut merged = server.clone();

        for field in conflicting_fields {
            let rule = config.merge_rules.iter().find(|r| &r.field == field);
            let keep_local = match rule {
                Some(MergeRule {
                    side: MergeSide::Local,
                    ..
                }) => true,
                Some(MergeRule {
                    side: MergeSide::Server,
                    ..
                }) => false,
                Some(MergeRule {
                    side: MergeSide::ChangedSide,
                    ..
                }) => {
                    match Self::changed_side(local, server, checkpoint, field) {
                        Some(side) => side,
                        // Both changed this field, or no base to compare
                        None => return Self::defer(local, server, conflicting_fields, config),
                    }
                }
                None => return Self::defer(local, server, conflicting_fields, config),
            };

            if keep_local {
                match local.fields.get(field) {
                    Some(value) => {
                        merged.fields.insert(field.clone(), value.clone());
                    }
                    None => {
                        merged.fields.remove(field);
                    }
                }
            }
        }

        merged.updated_at = local.updated_at.max(server.updated_at);
        ConflictOutcome::Resolved {
            snapshot: merged,
            winner: Winner::FieldMerge,
        }
    }

    /// Which side changed `field` relative to the checkpoint snapshot.
    /// Some(true) = local only, Some(false) = server only, None = both or
    /// undecidable.
    fn changed_side(
        local: &EntitySnapshot,
        server: &EntitySnapshot,
        checkpoint: &Checkpoint,
        field: &str,
    ) -> Option<bool> {
        let base = checkpoint.base.as_ref()?;
        let base_value = base.fields.get(field);
        let local_changed = local.fields.get(field) != base_value;
        let server_changed = server.fields.get(field) != base_value;

        match (local_changed, server_changed) {
            (true, false) => Some(true),
            (false, true) => Some(false),
            _ => None,
        }
    }

    fn defer(
        local: &EntitySnapshot,
        server: &EntitySnapshot,
        conflicting_fields: &[String],
        config: &EntityConflictConfig,
    ) -> ConflictOutcome {
        ConflictOutcome::Deferred(Box::new(ConflictDetail {
            entity_type: local.entity_type.clone(),
            entity_id: local.entity_id.clone(),
            local: local.clone(),
            server: server.clone(),
            conflicting_fields: conflicting_fields.to_vec(),
            strategy: config.strategy,
            detected_at: chrono::Utc::now().timestamp_millis(),
        }))
    }
}
