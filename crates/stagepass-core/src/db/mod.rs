//! Database layer for the sync engine

mod connection;
mod migrations;
mod queue_repository;
mod sync_repository;

pub use connection::Database;
pub use queue_repository::{QueueRepository, SqliteQueueRepository};
pub use sync_repository::{SqliteSyncRepository, SyncStateRepository};
