//! External collaborator seams
//!
//! The engine never speaks a wire format. It requires idempotency-by-id on
//! push and a monotonic `since` cursor on pull; the application injects the
//! actual REST/JSON client, the entity store the UI reads from, and the
//! device connectivity source.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{EntitySnapshot, MutationId, Operation};

/// One push to the server; `idempotency_key` makes retries safe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub idempotency_key: MutationId,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: serde_json::Value,
    /// Server version the client last saw; the server rejects on mismatch
    pub base_version: Option<i64>,
}

/// Server response to a push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushOutcome {
    /// Accepted; the server's canonical identity and timestamp
    Applied {
        server_id: Option<String>,
        server_updated_at: Option<i64>,
    },
    /// Version mismatch; the server's current snapshot for reconciliation
    Conflict { server: EntitySnapshot },
}

/// One pull of deltas for an entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub entity_type: String,
    /// Records changed strictly after this (Unix ms); None = full pull
    pub since: Option<i64>,
    /// Opaque continuation from the previous page
    pub cursor: Option<String>,
    pub limit: usize,
}

/// One page of pulled deltas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullPage {
    pub records: Vec<EntitySnapshot>,
    /// Present while more pages remain
    #[serde(default)]
    pub next_cursor: Option<String>,
    /// Total delta count when the server knows it (drives ETA)
    #[serde(default)]
    pub total: Option<u64>,
}

/// Injected async REST/JSON client
#[async_trait]
pub trait EntityTransport: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<PushOutcome>;

    async fn pull(&self, request: &PullRequest) -> Result<PullPage>;
}

/// Verified credential scope for a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub subject: String,
    /// Token expiry (Unix ms), when the provider knows it
    pub expires_at: Option<i64>,
}

/// Injected credential verifier/refresher
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Verify or refresh credentials; `Err` aborts the pass as fatal
    async fn ensure_authenticated(&self) -> Result<AuthSession>;
}

/// The application-owned record store the UI reads from
///
/// The engine writes reconciled snapshots here; it never renders them.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, entity_type: &str, entity_id: &str) -> Result<Option<EntitySnapshot>>;

    async fn apply(&self, snapshot: &EntitySnapshot) -> Result<()>;

    async fn remove(&self, entity_type: &str, entity_id: &str) -> Result<()>;
}

/// Device connectivity and power state, fed to the background service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub online: bool,
    pub wifi: bool,
    pub charging: bool,
}

impl ConnectivityState {
    pub const OFFLINE: Self = Self {
        online: false,
        wifi: false,
        charging: false,
    };

    pub const fn online() -> Self {
        Self {
            online: true,
            wifi: false,
            charging: false,
        }
    }
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self::OFFLINE
    }
}
