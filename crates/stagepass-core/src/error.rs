//! Error types for stagepass-core

use thiserror::Error;

/// Result type alias using stagepass-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// How an error affects retry and pass handling.
///
/// Fatal errors abort a whole sync pass. Transient errors are retried via
/// the queue's backoff. Validation errors are permanent for the offending
/// mutation and must not be retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Fatal,
    Transient,
    Validation,
}

/// Errors that can occur in stagepass-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed sync/entity configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Authentication failed or credentials could not be refreshed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Transport-level failure (timeout, 5xx, connection reset)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Payload rejected by the server or by local validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Queue item or mutation not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Item is claimed by an in-flight replay and cannot be cancelled yet
    #[error("Mutation {0} is processing; wait for its outcome")]
    ItemProcessing(String),

    /// Illegal queue item status transition
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A durable pass marker is held by another live process
    #[error("A sync pass is already active (pass {0})")]
    PassActive(String),
}

impl Error {
    /// Classify per the retry taxonomy.
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) | Self::Auth(_) | Self::PassActive(_) => ErrorClass::Fatal,
            Self::Database(_) | Self::Io(_) | Self::Transport(_) => ErrorClass::Transient,
            Self::Serialization(_)
            | Self::Validation(_)
            | Self::NotFound(_)
            | Self::ItemProcessing(_)
            | Self::InvalidTransition { .. } => ErrorClass::Validation,
        }
    }

    /// True when retrying later could succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// True when the error must abort the whole sync pass.
    pub const fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Fatal)
    }
}
