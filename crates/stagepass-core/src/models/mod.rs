//! Data models for the sync engine

mod conflict;
mod mutation;
mod queue;
mod sync;

pub use conflict::{
    ConflictDetail, ConflictOutcome, ConflictResolution, ConflictStrategy, EntityConflictConfig,
    EntitySnapshot, MergeRule, MergeSide, PendingConflict, ResolutionRecord, Winner,
};
pub use mutation::{Mutation, MutationStatus, ReplayResult};
pub use queue::{MutationId, Operation, Priority, QueueItem, QueueItemStatus, QueueStats};
pub use sync::{
    EntitySyncStatus, SyncPhase, SyncProgress, SyncProgressError, SyncResult, SyncTask,
    SyncTaskState,
};
