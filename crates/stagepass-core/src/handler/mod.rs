//! Offline mutation recording and queue replay
//!
//! The single entry point user-facing code calls for an offline-capable
//! write, and the driver that drains the queue against the server. At most
//! one replay runs at a time; a reentrant call waits for the in-flight run
//! and returns its result.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::db::{Database, SqliteSyncRepository, SyncStateRepository};
use crate::error::{Error, ErrorClass, Result};
use crate::events::{EventBus, MutationEvent};
use crate::models::{
    ConflictOutcome, ConflictResolution, EntityConflictConfig, EntitySnapshot, Mutation,
    MutationId, Operation, PendingConflict, Priority, QueueItem, ReplayResult, Winner,
};
use crate::queue::MutationQueue;
use crate::resolver::{Checkpoint, ConflictResolver};
use crate::transport::{EntityStore, EntityTransport, PushOutcome, PushRequest};

/// Items claimed per drain iteration
const REPLAY_BATCH_SIZE: usize = 50;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Per-item replay outcome, tallied into [`ReplayResult`]
enum ItemOutcome {
    Completed,
    Failed,
    Conflict,
}

/// Records user actions as mutations and drives queue replay
pub struct OfflineMutationHandler {
    db: Arc<Mutex<Database>>,
    queue: Arc<MutationQueue>,
    store: Arc<dyn EntityStore>,
    transport: Arc<dyn EntityTransport>,
    config: SyncConfig,
    events: EventBus<MutationEvent>,
    replay_gate: Mutex<()>,
    last_replay: parking_lot::Mutex<Option<ReplayResult>>,
}

impl OfflineMutationHandler {
    pub fn new(
        db: Arc<Mutex<Database>>,
        queue: Arc<MutationQueue>,
        store: Arc<dyn EntityStore>,
        transport: Arc<dyn EntityTransport>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            queue,
            store,
            transport,
            config,
            events: EventBus::new(),
            replay_gate: Mutex::new(()),
            last_replay: parking_lot::Mutex::new(None),
        }
    }

    /// Subscribe to mutation events; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MutationEvent> {
        self.events.subscribe()
    }

    /// Record an offline-capable write at normal priority.
    ///
    /// Durability, not network success, is the completion signal: this
    /// returns as soon as the queue item is on disk.
    pub async fn record(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: serde_json::Value,
    ) -> Result<Mutation> {
        self.record_prioritized(entity_type, entity_id, operation, payload, Priority::Normal)
            .await
    }

    /// Record a write with an explicit priority class
    pub async fn record_prioritized(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<Mutation> {
        let item = self
            .queue
            .enqueue(entity_type, entity_id, operation, payload, priority)
            .await?;

        let mutation = Mutation::from_item(item, None);
        self.events.emit(MutationEvent::Added(mutation.clone()));
        Ok(mutation)
    }

    /// Drain the queue against the server.
    ///
    /// A call while a replay is in flight does not start a second one; it
    /// waits for the running drain and returns that run's result.
    pub async fn replay_mutations(&self) -> Result<ReplayResult> {
        let Ok(_guard) = self.replay_gate.try_lock() else {
            let _wait = self.replay_gate.lock().await;
            return Ok(self.last_replay.lock().clone().unwrap_or_default());
        };

        self.events.emit(MutationEvent::ReplayStarted);
        let started_at = now_ms();
        let mut result = ReplayResult {
            started_at,
            ..Default::default()
        };

        loop {
            let batch = self.queue.dequeue_batch(REPLAY_BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }

            for item in batch {
                result.attempted += 1;
                match self.process_item(&item).await? {
                    ItemOutcome::Completed => result.completed += 1,
                    ItemOutcome::Failed => result.failed += 1,
                    ItemOutcome::Conflict => result.conflicts += 1,
                }
            }
        }

        result.duration_ms = u64::try_from(now_ms() - started_at).unwrap_or(0);
        tracing::info!(
            attempted = result.attempted,
            completed = result.completed,
            failed = result.failed,
            conflicts = result.conflicts,
            "Replay finished"
        );

        *self.last_replay.lock() = Some(result.clone());
        self.events
            .emit(MutationEvent::ReplayCompleted(result.clone()));
        Ok(result)
    }

    /// Send one claimed item to the server and settle its outcome.
    ///
    /// Only storage failures bubble up; transport failures settle the item
    /// so the drain always continues.
    async fn process_item(&self, item: &QueueItem) -> Result<ItemOutcome> {
        let request = PushRequest {
            idempotency_key: item.id,
            entity_type: item.entity_type.clone(),
            entity_id: item.entity_id.clone(),
            operation: item.operation,
            payload: item.payload.clone(),
            base_version: self.checkpoint_at(&item.entity_type).await?,
        };

        match self.transport.push(&request).await {
            Ok(PushOutcome::Applied { .. }) => {
                self.queue.mark_completed(&item.id).await?;
                self.events.emit(MutationEvent::Completed { id: item.id });
                Ok(ItemOutcome::Completed)
            }
            Ok(PushOutcome::Conflict { server }) => {
                self.settle_push_conflict(item, server).await
            }
            Err(error) => {
                let permanent = matches!(error.class(), ErrorClass::Validation);
                let message = error.to_string();
                self.queue
                    .mark_failed(&item.id, &message, permanent)
                    .await?;
                self.events.emit(MutationEvent::Failed {
                    id: item.id,
                    error: message,
                });
                Ok(ItemOutcome::Failed)
            }
        }
    }

    /// Reconcile a version conflict reported by the server.
    async fn settle_push_conflict(
        &self,
        item: &QueueItem,
        server: EntitySnapshot,
    ) -> Result<ItemOutcome> {
        let mut local = EntitySnapshot::from_payload(
            &item.entity_type,
            &item.entity_id,
            Some(item.created_at),
            &item.payload,
        );
        local.deleted = item.operation == Operation::Delete;

        let checkpoint = Checkpoint::at(self.checkpoint_at(&item.entity_type).await?);
        let config = self.conflict_config(&item.entity_type);
        let outcome = ConflictResolver::resolve(&local, &server, &checkpoint, &config);

        match outcome {
            ConflictOutcome::UpToDate | ConflictOutcome::AlreadyDeleted => {
                self.queue.mark_completed(&item.id).await?;
                self.events.emit(MutationEvent::Completed { id: item.id });
                Ok(ItemOutcome::Completed)
            }
            ConflictOutcome::ApplyServer(snapshot) => {
                self.store.apply(&snapshot).await?;
                self.queue.mark_completed(&item.id).await?;
                self.events.emit(MutationEvent::Completed { id: item.id });
                Ok(ItemOutcome::Completed)
            }
            ConflictOutcome::ApplyLocal(snapshot) => {
                self.push_reconciled(item, &snapshot, server.updated_at).await
            }
            ConflictOutcome::Resolved { snapshot, winner } => match winner {
                Winner::Server => {
                    // Local change loses; persist the server's truth
                    self.journal(&local, &server, &config, winner).await?;
                    self.store.apply(&snapshot).await?;
                    self.queue.mark_completed(&item.id).await?;
                    self.events.emit(MutationEvent::Completed { id: item.id });
                    Ok(ItemOutcome::Completed)
                }
                Winner::Local | Winner::FieldMerge => {
                    self.store.apply(&snapshot).await?;
                    let outcome = self
                        .push_reconciled(item, &snapshot, server.updated_at)
                        .await?;
                    if matches!(outcome, ItemOutcome::Completed) {
                        self.journal(&local, &server, &config, winner).await?;
                    }
                    Ok(outcome)
                }
            },
            ConflictOutcome::Deferred(detail) => {
                let pending = PendingConflict {
                    mutation_id: item.id,
                    detail: *detail.clone(),
                    created_at: now_ms(),
                };
                {
                    let db = self.db.lock().await;
                    SqliteSyncRepository::new(db.connection()).insert_pending_conflict(&pending)?;
                }
                // The item stays claimed; no replay can pick it up until
                // the user resolves it
                self.events.emit(MutationEvent::Conflict {
                    id: item.id,
                    detail,
                });
                Ok(ItemOutcome::Conflict)
            }
        }
    }

    /// Push a reconciled snapshot on top of the server version we just saw.
    async fn push_reconciled(
        &self,
        item: &QueueItem,
        snapshot: &EntitySnapshot,
        base_version: Option<i64>,
    ) -> Result<ItemOutcome> {
        let request = PushRequest {
            idempotency_key: item.id,
            entity_type: item.entity_type.clone(),
            entity_id: item.entity_id.clone(),
            operation: item.operation,
            payload: snapshot.to_payload(),
            base_version,
        };

        match self.transport.push(&request).await {
            Ok(PushOutcome::Applied { .. }) => {
                self.queue.mark_completed(&item.id).await?;
                self.events.emit(MutationEvent::Completed { id: item.id });
                Ok(ItemOutcome::Completed)
            }
            Ok(PushOutcome::Conflict { .. }) => {
                // The server moved again under us; back off and retry later
                let message = "server version changed during reconciliation";
                self.queue.mark_failed(&item.id, message, false).await?;
                self.events.emit(MutationEvent::Failed {
                    id: item.id,
                    error: message.to_string(),
                });
                Ok(ItemOutcome::Failed)
            }
            Err(error) => {
                let permanent = matches!(error.class(), ErrorClass::Validation);
                let message = error.to_string();
                self.queue
                    .mark_failed(&item.id, &message, permanent)
                    .await?;
                self.events.emit(MutationEvent::Failed {
                    id: item.id,
                    error: message,
                });
                Ok(ItemOutcome::Failed)
            }
        }
    }

    /// Explicitly re-arm one failed mutation
    pub async fn retry_mutation(&self, id: &MutationId) -> Result<()> {
        self.queue.retry_item(id).await
    }

    /// Destroy a pending or failed mutation; claimed and conflicted ones
    /// must settle first
    pub async fn cancel_mutation(&self, id: &MutationId) -> Result<()> {
        self.queue.cancel(id).await
    }

    /// Apply a user's decision for a parked conflict.
    ///
    /// `Merge` requires `merged_data`; the others ignore it.
    pub async fn resolve_conflict(
        &self,
        id: &MutationId,
        resolution: ConflictResolution,
        merged_data: Option<serde_json::Value>,
    ) -> Result<Mutation> {
        if resolution == ConflictResolution::Merge && merged_data.is_none() {
            return Err(Error::Validation(
                "merge resolution requires merged data".into(),
            ));
        }

        let pending = {
            let db = self.db.lock().await;
            SqliteSyncRepository::new(db.connection()).take_pending_conflict(id)?
        }
        .ok_or_else(|| Error::NotFound(format!("no pending conflict for mutation {id}")))?;

        let item = self
            .queue
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let detail = &pending.detail;
        let config = self.conflict_config(&detail.entity_type);

        let outcome = match resolution {
            ConflictResolution::KeepServer => {
                self.store.apply(&detail.server).await?;
                self.journal(&detail.local, &detail.server, &config, Winner::Server)
                    .await?;
                self.queue.mark_completed(id).await?;
                self.events.emit(MutationEvent::Completed { id: *id });
                ItemOutcome::Completed
            }
            ConflictResolution::KeepLocal => {
                let forced = self
                    .push_reconciled(&item, &detail.local, detail.server.updated_at)
                    .await?;
                if matches!(forced, ItemOutcome::Completed) {
                    self.store.apply(&detail.local).await?;
                    self.journal(&detail.local, &detail.server, &config, Winner::Local)
                        .await?;
                }
                forced
            }
            ConflictResolution::Merge => {
                let merged_data = merged_data.ok_or_else(|| {
                    Error::Validation("merge resolution requires merged data".into())
                })?;
                let mut merged = EntitySnapshot::from_payload(
                    &detail.entity_type,
                    &detail.entity_id,
                    Some(now_ms()),
                    &merged_data,
                );
                merged.deleted = detail.local.deleted && detail.server.deleted;

                let forced = self
                    .push_reconciled(&item, &merged, detail.server.updated_at)
                    .await?;
                if matches!(forced, ItemOutcome::Completed) {
                    self.store.apply(&merged).await?;
                    self.journal(&detail.local, &detail.server, &config, Winner::FieldMerge)
                        .await?;
                }
                forced
            }
        };

        if !matches!(outcome, ItemOutcome::Completed) {
            // The push failed; park the conflict again so the decision
            // surface survives and the user can retry
            let db = self.db.lock().await;
            SqliteSyncRepository::new(db.connection()).insert_pending_conflict(&pending)?;
        }

        self.mutation(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Project one mutation, overlaying pending-conflict state
    pub async fn mutation(&self, id: &MutationId) -> Result<Option<Mutation>> {
        let item = self.queue.get(id).await?;
        let Some(item) = item else { return Ok(None) };

        let conflict = {
            let db = self.db.lock().await;
            SqliteSyncRepository::new(db.connection()).get_pending_conflict(id)?
        };
        Ok(Some(Mutation::from_item(
            item,
            conflict.map(|c| c.detail),
        )))
    }

    /// All conflicts awaiting user resolution
    pub async fn pending_conflicts(&self) -> Result<Vec<PendingConflict>> {
        let db = self.db.lock().await;
        SqliteSyncRepository::new(db.connection()).list_pending_conflicts()
    }

    /// The most recent replay outcome, if any ran this session
    pub fn last_replay(&self) -> Option<ReplayResult> {
        self.last_replay.lock().clone()
    }

    fn conflict_config(&self, entity_type: &str) -> EntityConflictConfig {
        self.config
            .conflict_config(entity_type)
            .cloned()
            .unwrap_or_default()
    }

    async fn checkpoint_at(&self, entity_type: &str) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        Ok(SqliteSyncRepository::new(db.connection())
            .get_status(entity_type)?
            .and_then(|status| status.last_sync_at))
    }

    async fn journal(
        &self,
        local: &EntitySnapshot,
        server: &EntitySnapshot,
        config: &EntityConflictConfig,
        winner: Winner,
    ) -> Result<()> {
        let detail = crate::models::ConflictDetail {
            entity_type: local.entity_type.clone(),
            entity_id: local.entity_id.clone(),
            local: local.clone(),
            server: server.clone(),
            conflicting_fields: local.differing_fields(server),
            strategy: config.strategy,
            detected_at: now_ms(),
        };
        let db = self.db.lock().await;
        SqliteSyncRepository::new(db.connection()).journal_resolution(
            &detail,
            winner.as_str(),
            now_ms(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, EntityRegistration, SyncConfig};
    use crate::db::QueueRepository;
    use crate::models::{ConflictStrategy, MutationStatus, QueueItemStatus};
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    /// Transport double: consumes scripted outcomes in push order, then
    /// defaults to Applied
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: parking_lot::Mutex<VecDeque<Script>>,
        log: parking_lot::Mutex<Vec<PushRequest>>,
        delay: Option<Duration>,
    }

    enum Script {
        Applied,
        Conflict(EntitySnapshot),
        Transient(String),
        Invalid(String),
    }

    #[async_trait::async_trait]
    impl EntityTransport for ScriptedTransport {
        async fn push(&self, request: &PushRequest) -> Result<PushOutcome> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.log.lock().push(request.clone());
            match self.scripts.lock().pop_front() {
                None | Some(Script::Applied) => Ok(PushOutcome::Applied {
                    server_id: Some(request.entity_id.clone()),
                    server_updated_at: Some(now_ms()),
                }),
                Some(Script::Conflict(server)) => Ok(PushOutcome::Conflict { server }),
                Some(Script::Transient(message)) => Err(Error::Transport(message)),
                Some(Script::Invalid(message)) => Err(Error::Validation(message)),
            }
        }

        async fn pull(
            &self,
            _request: &crate::transport::PullRequest,
        ) -> Result<crate::transport::PullPage> {
            Ok(crate::transport::PullPage {
                records: Vec::new(),
                next_cursor: None,
                total: Some(0),
            })
        }
    }

    /// In-memory entity store double
    #[derive(Default)]
    struct MemoryStore {
        records: parking_lot::Mutex<HashMap<(String, String), EntitySnapshot>>,
    }

    impl MemoryStore {
        fn get_sync(&self, entity_type: &str, entity_id: &str) -> Option<EntitySnapshot> {
            self.records
                .lock()
                .get(&(entity_type.to_string(), entity_id.to_string()))
                .cloned()
        }
    }

    #[async_trait::async_trait]
    impl EntityStore for MemoryStore {
        async fn get(
            &self,
            entity_type: &str,
            entity_id: &str,
        ) -> Result<Option<EntitySnapshot>> {
            Ok(self.get_sync(entity_type, entity_id))
        }

        async fn apply(&self, snapshot: &EntitySnapshot) -> Result<()> {
            self.records.lock().insert(
                (snapshot.entity_type.clone(), snapshot.entity_id.clone()),
                snapshot.clone(),
            );
            Ok(())
        }

        async fn remove(&self, entity_type: &str, entity_id: &str) -> Result<()> {
            self.records
                .lock()
                .remove(&(entity_type.to_string(), entity_id.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        handler: Arc<OfflineMutationHandler>,
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryStore>,
        db: Arc<Mutex<Database>>,
    }

    fn config(strategy: ConflictStrategy) -> SyncConfig {
        SyncConfig {
            festival_id: "fest-2026".into(),
            device_id: "gate-7".into(),
            entities: vec![EntityRegistration::new("tickets")
                .with_conflict(EntityConflictConfig::new(strategy))],
            batch: crate::config::BatchConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }

    fn fixture_with(transport: ScriptedTransport, strategy: ConflictStrategy) -> Fixture {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let queue = Arc::new(MutationQueue::new(Arc::clone(&db), BackoffConfig::default()));
        let transport = Arc::new(transport);
        let store = Arc::new(MemoryStore::default());

        let handler = Arc::new(OfflineMutationHandler::new(
            Arc::clone(&db),
            queue,
            Arc::clone(&store) as Arc<dyn EntityStore>,
            Arc::clone(&transport) as Arc<dyn EntityTransport>,
            config(strategy),
        ));

        Fixture {
            handler,
            transport,
            store,
            db,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ScriptedTransport::default(), ConflictStrategy::LastWriteWins)
    }

    fn server_snapshot(updated_at: i64, fields: serde_json::Value) -> EntitySnapshot {
        EntitySnapshot::from_payload("tickets", "t-1", Some(updated_at), &fields)
    }

    async fn record_ticket(handler: &OfflineMutationHandler) -> Mutation {
        handler
            .record("tickets", "t-1", Operation::Update, json!({"status": "used"}))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_record_returns_pending_mutation() {
        let fx = fixture();
        let mutation = record_ticket(&fx.handler).await;
        assert_eq!(mutation.status, MutationStatus::Pending);
        assert!(fx.transport.log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_replay_pushes_with_idempotency_key() {
        let fx = fixture();
        let mutation = record_ticket(&fx.handler).await;

        let result = fx.handler.replay_mutations().await.unwrap();
        assert_eq!(result.attempted, 1);
        assert_eq!(result.completed, 1);
        assert!(result.is_clean());

        let log = fx.transport.log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].idempotency_key, mutation.id);

        let settled = fx.handler.mutation(&mutation.id).await.unwrap().unwrap();
        assert_eq!(settled.status, MutationStatus::Completed);
    }

    #[tokio::test]
    async fn test_transient_failure_does_not_halt_replay() {
        let transport = ScriptedTransport {
            scripts: parking_lot::Mutex::new(VecDeque::from([Script::Transient(
                "gateway timeout".into(),
            )])),
            ..Default::default()
        };
        let fx = fixture_with(transport, ConflictStrategy::LastWriteWins);

        let first = record_ticket(&fx.handler).await;
        let second = fx
            .handler
            .record("tickets", "t-2", Operation::Create, json!({"status": "valid"}))
            .await
            .unwrap();

        let result = fx.handler.replay_mutations().await.unwrap();
        assert_eq!(result.attempted, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(result.completed, 1);

        let failed = fx.handler.mutation(&first.id).await.unwrap().unwrap();
        assert_eq!(failed.status, MutationStatus::Failed);
        assert!(!failed.last_error.as_deref().unwrap_or("").is_empty());

        let ok = fx.handler.mutation(&second.id).await.unwrap().unwrap();
        assert_eq!(ok.status, MutationStatus::Completed);
    }

    #[tokio::test]
    async fn test_validation_failure_is_permanent() {
        let transport = ScriptedTransport {
            scripts: parking_lot::Mutex::new(VecDeque::from([Script::Invalid(
                "unknown ticket code".into(),
            )])),
            ..Default::default()
        };
        let fx = fixture_with(transport, ConflictStrategy::LastWriteWins);
        let mutation = record_ticket(&fx.handler).await;

        fx.handler.replay_mutations().await.unwrap();

        let db = fx.db.lock().await;
        let item = crate::db::SqliteQueueRepository::new(db.connection())
            .get(&mutation.id)
            .unwrap()
            .unwrap();
        assert_eq!(item.status, QueueItemStatus::Failed);
        assert!(item.permanently_failed);
    }

    #[tokio::test]
    async fn test_lww_conflict_discards_older_local_change() {
        // Server independently refunded the ticket with a later timestamp
        let server = server_snapshot(now_ms() + 60_000, json!({"status": "refunded"}));
        let transport = ScriptedTransport {
            scripts: parking_lot::Mutex::new(VecDeque::from([Script::Conflict(server.clone())])),
            ..Default::default()
        };
        let fx = fixture_with(transport, ConflictStrategy::LastWriteWins);
        let mutation = record_ticket(&fx.handler).await;

        let result = fx.handler.replay_mutations().await.unwrap();
        assert_eq!(result.completed, 1);
        assert_eq!(result.conflicts, 0);

        // Local change discarded, server value persisted, ends completed
        let settled = fx.handler.mutation(&mutation.id).await.unwrap().unwrap();
        assert_eq!(settled.status, MutationStatus::Completed);
        let stored = fx.store.get_sync("tickets", "t-1").unwrap();
        assert_eq!(stored.fields.get("status"), Some(&json!("refunded")));

        // Auto-resolution is journaled
        let db = fx.db.lock().await;
        let journal = SqliteSyncRepository::new(db.connection())
            .list_journal(10)
            .unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].winner, "server");
    }

    #[tokio::test]
    async fn test_manual_strategy_parks_conflict() {
        let server = server_snapshot(now_ms() + 60_000, json!({"status": "refunded"}));
        let transport = ScriptedTransport {
            scripts: parking_lot::Mutex::new(VecDeque::from([Script::Conflict(server)])),
            ..Default::default()
        };
        let fx = fixture_with(transport, ConflictStrategy::Manual);
        let mutation = record_ticket(&fx.handler).await;

        let result = fx.handler.replay_mutations().await.unwrap();
        assert_eq!(result.conflicts, 1);

        let parked = fx.handler.mutation(&mutation.id).await.unwrap().unwrap();
        assert_eq!(parked.status, MutationStatus::Conflict);
        assert_eq!(fx.handler.pending_conflicts().await.unwrap().len(), 1);

        // A second replay must not re-claim the parked item
        let again = fx.handler.replay_mutations().await.unwrap();
        assert_eq!(again.attempted, 0);
    }

    #[tokio::test]
    async fn test_resolve_conflict_keep_local_forces_local_value() {
        let server = server_snapshot(now_ms() + 60_000, json!({"status": "refunded"}));
        let transport = ScriptedTransport {
            scripts: parking_lot::Mutex::new(VecDeque::from([Script::Conflict(server)])),
            ..Default::default()
        };
        let fx = fixture_with(transport, ConflictStrategy::Manual);
        let mutation = record_ticket(&fx.handler).await;
        fx.handler.replay_mutations().await.unwrap();

        let resolved = fx
            .handler
            .resolve_conflict(&mutation.id, ConflictResolution::KeepLocal, None)
            .await
            .unwrap();
        assert_eq!(resolved.status, MutationStatus::Completed);

        // Forced push carried the local payload
        let log = fx.transport.log.lock();
        let forced = log.last().unwrap();
        assert_eq!(forced.payload["status"], json!("used"));
        assert_eq!(forced.idempotency_key, mutation.id);

        let stored = fx.store.get_sync("tickets", "t-1").unwrap();
        assert_eq!(stored.fields.get("status"), Some(&json!("used")));
        assert!(fx.handler.pending_conflicts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_conflict_keep_server_discards_local() {
        let server = server_snapshot(now_ms() + 60_000, json!({"status": "refunded"}));
        let transport = ScriptedTransport {
            scripts: parking_lot::Mutex::new(VecDeque::from([Script::Conflict(server)])),
            ..Default::default()
        };
        let fx = fixture_with(transport, ConflictStrategy::Manual);
        let mutation = record_ticket(&fx.handler).await;
        fx.handler.replay_mutations().await.unwrap();
        let pushes_before = fx.transport.log.lock().len();

        let resolved = fx
            .handler
            .resolve_conflict(&mutation.id, ConflictResolution::KeepServer, None)
            .await
            .unwrap();
        assert_eq!(resolved.status, MutationStatus::Completed);

        // Nothing new went to the server
        assert_eq!(fx.transport.log.lock().len(), pushes_before);
        let stored = fx.store.get_sync("tickets", "t-1").unwrap();
        assert_eq!(stored.fields.get("status"), Some(&json!("refunded")));
    }

    #[tokio::test]
    async fn test_resolve_conflict_merge_requires_data() {
        let server = server_snapshot(now_ms() + 60_000, json!({"status": "refunded"}));
        let transport = ScriptedTransport {
            scripts: parking_lot::Mutex::new(VecDeque::from([Script::Conflict(server)])),
            ..Default::default()
        };
        let fx = fixture_with(transport, ConflictStrategy::Manual);
        let mutation = record_ticket(&fx.handler).await;
        fx.handler.replay_mutations().await.unwrap();

        let missing = fx
            .handler
            .resolve_conflict(&mutation.id, ConflictResolution::Merge, None)
            .await;
        assert!(matches!(missing, Err(Error::Validation(_))));
        // The conflict survives a rejected resolution attempt
        assert_eq!(fx.handler.pending_conflicts().await.unwrap().len(), 1);

        let merged = fx
            .handler
            .resolve_conflict(
                &mutation.id,
                ConflictResolution::Merge,
                Some(json!({"status": "used", "note": "gate override"})),
            )
            .await
            .unwrap();
        assert_eq!(merged.status, MutationStatus::Completed);
        let stored = fx.store.get_sync("tickets", "t-1").unwrap();
        assert_eq!(stored.fields.get("note"), Some(&json!("gate override")));
    }

    #[tokio::test]
    async fn test_cancel_rejected_while_conflicted() {
        let server = server_snapshot(now_ms() + 60_000, json!({"status": "refunded"}));
        let transport = ScriptedTransport {
            scripts: parking_lot::Mutex::new(VecDeque::from([Script::Conflict(server)])),
            ..Default::default()
        };
        let fx = fixture_with(transport, ConflictStrategy::Manual);
        let mutation = record_ticket(&fx.handler).await;
        fx.handler.replay_mutations().await.unwrap();

        // Conflicted mutations stay claimed; they must be resolved, not
        // cancelled out from under the diff
        let cancel = fx.handler.cancel_mutation(&mutation.id).await;
        assert!(matches!(cancel, Err(Error::ItemProcessing(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reentrant_replay_is_single_flight() {
        let transport = ScriptedTransport {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let fx = fixture_with(transport, ConflictStrategy::LastWriteWins);
        record_ticket(&fx.handler).await;

        let first = Arc::clone(&fx.handler);
        let second = Arc::clone(&fx.handler);
        let (a, b) = tokio::join!(
            tokio::spawn(async move { first.replay_mutations().await.unwrap() }),
            tokio::spawn(async move { second.replay_mutations().await.unwrap() }),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        // The single queued item was pushed exactly once, no matter how
        // the two calls interleaved
        assert_eq!(fx.transport.log.lock().len(), 1);
        assert_eq!(a.completed.max(b.completed), 1);
    }

    #[tokio::test]
    async fn test_recorded_mutations_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sync.db");

        {
            let db = Arc::new(Mutex::new(Database::open(&path).unwrap()));
            let queue = Arc::new(MutationQueue::new(Arc::clone(&db), BackoffConfig::default()));
            let handler = OfflineMutationHandler::new(
                Arc::clone(&db),
                queue,
                Arc::new(MemoryStore::default()),
                Arc::new(ScriptedTransport::default()),
                config(ConflictStrategy::LastWriteWins),
            );
            for n in 0..3 {
                handler
                    .record(
                        "favorites",
                        &format!("f-{n}"),
                        Operation::Create,
                        json!({"artist": n}),
                    )
                    .await
                    .unwrap();
            }
        }

        let db = Arc::new(Mutex::new(Database::open(&path).unwrap()));
        let queue = MutationQueue::new(db, BackoffConfig::default());
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 3);
    }
}
