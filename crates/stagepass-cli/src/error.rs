use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] stagepass_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Mutation ID cannot be empty")]
    EmptyMutationId,
    #[error("Invalid mutation ID: {0}")]
    InvalidMutationId(String),
    #[error("Invalid resolution '{0}': expected local, server, or merge")]
    InvalidResolution(String),
    #[error("Merge resolution requires --data with the merged JSON payload")]
    MergeDataRequired,
    #[error(
        "Sync is not configured. Set STAGEPASS_API_URL and STAGEPASS_API_TOKEN to enable `stagepass sync`."
    )]
    SyncNotConfigured,
}
