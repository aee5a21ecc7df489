//! Bidirectional sync pass orchestration
//!
//! One pass walks the phase machine
//! `preparing -> authenticating -> pulling -> resolving_conflicts ->
//! pushing -> finalizing` and settles as completed or failed. Per-entity
//! errors accumulate and never abort the pass; only preparing and
//! authenticating failures are fatal. At most one pass runs system-wide:
//! an in-process gate covers this process, a durable marker covers a
//! process killed mid-pass.

#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::db::{Database, SqliteSyncRepository, SyncStateRepository};
use crate::error::{Error, Result};
use crate::events::{EventBus, SyncEvent};
use crate::handler::OfflineMutationHandler;
use crate::models::{
    ConflictOutcome, EntitySnapshot, EntitySyncStatus, PendingConflict, QueueItem, SyncPhase,
    SyncProgress, SyncProgressError, SyncResult, SyncTask, SyncTaskState, Winner,
};
use crate::queue::MutationQueue;
use crate::resolver::{Checkpoint, ConflictResolver};
use crate::transport::{AuthProvider, EntityStore, EntityTransport, PullRequest};

/// A marker older than this belongs to a killed process and is reclaimed
const PASS_MARKER_STALE_MS: i64 = 10 * 60 * 1_000;

/// Smoothing factor for the per-batch duration moving average
const BATCH_EMA_ALPHA: f64 = 0.3;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A pulled record whose local counterpart is dirty, deferred to the
/// resolving phase
struct DeferredRecord {
    item: QueueItem,
    server: EntitySnapshot,
    /// Cursor the entity had before this pass started pulling
    checkpoint_at: Option<i64>,
}

/// How a single entity's pull ended
enum PullEnd {
    Completed,
    Failed(String),
    Cancelled,
}

/// Orchestrates full bidirectional sync passes
pub struct SyncManager {
    db: Arc<Mutex<Database>>,
    queue: Arc<MutationQueue>,
    handler: Arc<OfflineMutationHandler>,
    store: Arc<dyn EntityStore>,
    transport: Arc<dyn EntityTransport>,
    auth: Arc<dyn AuthProvider>,
    config: SyncConfig,
    events: EventBus<SyncEvent>,
    phase: parking_lot::Mutex<SyncPhase>,
    cancel_requested: AtomicBool,
    pass_gate: Mutex<()>,
    last_result: parking_lot::Mutex<Option<SyncResult>>,
}

impl SyncManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Mutex<Database>>,
        queue: Arc<MutationQueue>,
        handler: Arc<OfflineMutationHandler>,
        store: Arc<dyn EntityStore>,
        transport: Arc<dyn EntityTransport>,
        auth: Arc<dyn AuthProvider>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            queue,
            handler,
            store,
            transport,
            auth,
            config,
            events: EventBus::new(),
            phase: parking_lot::Mutex::new(SyncPhase::Idle),
            cancel_requested: AtomicBool::new(false),
            pass_gate: Mutex::new(()),
            last_result: parking_lot::Mutex::new(None),
        }
    }

    /// Subscribe to sync events; drop the receiver to unsubscribe
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Run a full pass across all registered entities.
    ///
    /// If a pass is already active in this process, a non-forced call waits
    /// for it and returns its result. `force` additionally reclaims a
    /// durable pass marker regardless of its age (recovery lever when a
    /// previous process died without releasing it).
    pub async fn start_sync(&self, force: bool) -> Result<SyncResult> {
        self.sync_internal(force, None).await
    }

    /// Re-run only the entities whose last task failed, from their saved
    /// batch cursors.
    pub async fn retry_failed_sync(&self) -> Result<SyncResult> {
        let failed: Vec<String> = {
            let db = self.db.lock().await;
            SqliteSyncRepository::new(db.connection())
                .all_statuses()?
                .into_iter()
                .filter(|s| s.last_task_state == Some(SyncTaskState::Failed))
                .map(|s| s.entity_type)
                .collect()
        };

        if failed.is_empty() {
            if let Some(last) = self.last_result() {
                return Ok(last);
            }
            return self.sync_internal(false, None).await;
        }
        self.sync_internal(false, Some(failed)).await
    }

    /// Request cooperative cancellation; checked between batches and tasks
    pub fn cancel_sync(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        tracing::info!("Sync cancellation requested");
    }

    /// Phase of the active (or most recent) pass
    pub fn current_phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    pub fn is_syncing(&self) -> bool {
        !matches!(
            self.current_phase(),
            SyncPhase::Idle | SyncPhase::Completed | SyncPhase::Failed
        )
    }

    /// The most recent pass outcome held in memory
    pub fn last_result(&self) -> Option<SyncResult> {
        self.last_result.lock().clone()
    }

    /// The most recent pass outcome, surviving restarts
    pub async fn persisted_last_result(&self) -> Result<Option<SyncResult>> {
        let db = self.db.lock().await;
        SqliteSyncRepository::new(db.connection()).last_result()
    }

    /// Cursor records for every entity ever synced
    pub async fn entity_statuses(&self) -> Result<Vec<EntitySyncStatus>> {
        let db = self.db.lock().await;
        SqliteSyncRepository::new(db.connection()).all_statuses()
    }

    async fn sync_internal(
        &self,
        force: bool,
        only_entities: Option<Vec<String>>,
    ) -> Result<SyncResult> {
        let Ok(_guard) = self.pass_gate.try_lock() else {
            if force {
                tracing::warn!("Forced sync requested while a pass is active; joining it");
            }
            let _wait = self.pass_gate.lock().await;
            return Ok(self
                .last_result()
                .unwrap_or_else(|| SyncResult::failed(now_ms(), 0, "no pass result recorded")));
        };

        self.cancel_requested.store(false, Ordering::SeqCst);
        let result = self.run_pass(force, only_entities).await?;
        *self.last_result.lock() = Some(result.clone());
        Ok(result)
    }

    async fn run_pass(
        &self,
        force: bool,
        only_entities: Option<Vec<String>>,
    ) -> Result<SyncResult> {
        let started_at = now_ms();
        let pass_id = Uuid::now_v7().to_string();
        tracing::info!(pass_id = %pass_id, "Starting sync pass");

        // -- preparing ----------------------------------------------------
        self.set_phase(SyncPhase::Preparing);

        if let Err(error) = self.config.validate() {
            return self.settle_fatal(None, started_at, error.to_string()).await;
        }

        let ordered = self.config.ordered_entities()?;
        let selected: Vec<String> = ordered
            .iter()
            .map(|e| e.name.clone())
            .filter(|name| {
                only_entities
                    .as_ref()
                    .is_none_or(|only| only.contains(name))
            })
            .collect();

        let stale_after = if force { 0 } else { PASS_MARKER_STALE_MS };
        let claim = {
            let db = self.db.lock().await;
            SqliteSyncRepository::new(db.connection()).begin_pass(
                &pass_id,
                started_at,
                stale_after,
            )
        };
        match claim {
            Err(error @ Error::PassActive(_)) => {
                return self
                    .settle_fatal(None, started_at, error.to_string())
                    .await;
            }
            other => other?,
        }

        // A marker we just reclaimed may have left claimed items behind
        self.queue.requeue_stranded().await?;

        // -- authenticating ----------------------------------------------
        self.set_phase(SyncPhase::Authenticating);
        if let Err(error) = self.auth.ensure_authenticated().await {
            tracing::warn!(error = %error, "Authentication failed; aborting pass");
            return self
                .settle_fatal(Some(&pass_id), started_at, format!("authentication: {error}"))
                .await;
        }

        // -- pulling ------------------------------------------------------
        self.set_phase(SyncPhase::Pulling);
        let mut tasks: Vec<SyncTask> = selected.iter().cloned().map(SyncTask::new).collect();
        let mut errors: Vec<SyncProgressError> = Vec::new();
        let mut deferred: Vec<DeferredRecord> = Vec::new();
        let mut cancelled = false;

        for task in &mut tasks {
            if self.cancel_requested.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }

            task.state = SyncTaskState::Running;
            self.events.emit(SyncEvent::TaskStarted {
                entity_type: task.entity_type.clone(),
            });

            match self.pull_entity(task, &mut deferred).await? {
                PullEnd::Completed => {
                    task.state = SyncTaskState::Completed;
                    self.events.emit(SyncEvent::TaskCompleted {
                        entity_type: task.entity_type.clone(),
                        pulled: task.pulled,
                        pushed: 0,
                    });
                }
                PullEnd::Failed(message) => {
                    task.state = SyncTaskState::Failed;
                    task.error = Some(message.clone());
                    errors.push(SyncProgressError {
                        entity_type: task.entity_type.clone(),
                        phase: SyncPhase::Pulling,
                        message: message.clone(),
                    });
                    self.events.emit(SyncEvent::TaskFailed {
                        entity_type: task.entity_type.clone(),
                        error: message,
                    });
                }
                PullEnd::Cancelled => {
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            return self
                .settle_cancelled(&pass_id, started_at, &tasks, errors)
                .await;
        }

        // -- resolving_conflicts ------------------------------------------
        self.set_phase(SyncPhase::ResolvingConflicts);
        for record in deferred {
            self.resolve_pulled(record).await?;
        }

        // -- pushing ------------------------------------------------------
        self.set_phase(SyncPhase::Pushing);
        let pushed = if self.cancel_requested.load(Ordering::SeqCst) {
            cancelled = true;
            0
        } else {
            let replay = self.handler.replay_mutations().await?;
            if replay.failed > 0 {
                errors.push(SyncProgressError {
                    entity_type: "mutations".into(),
                    phase: SyncPhase::Pushing,
                    message: format!("{} mutation(s) failed to push", replay.failed),
                });
            }
            replay.completed
        };

        if cancelled {
            return self
                .settle_cancelled(&pass_id, started_at, &tasks, errors)
                .await;
        }

        // -- finalizing ---------------------------------------------------
        self.set_phase(SyncPhase::Finalizing);
        self.refresh_pending_counts(&tasks).await?;

        let result = SyncResult {
            success: true,
            cancelled: false,
            pulled: tasks.iter().map(|t| t.pulled).sum(),
            pushed,
            errors,
            started_at,
            duration_ms: u64::try_from(now_ms() - started_at).unwrap_or(0),
            reason: None,
        };

        {
            let db = self.db.lock().await;
            let repo = SqliteSyncRepository::new(db.connection());
            repo.record_result(&result, now_ms())?;
            repo.end_pass(&pass_id)?;
        }

        self.set_phase(SyncPhase::Completed);
        self.events.emit(SyncEvent::Completed(result.clone()));
        tracing::info!(
            pulled = result.pulled,
            pushed = result.pushed,
            errors = result.errors.len(),
            "Sync pass completed"
        );
        Ok(result)
    }

    /// Pull all delta batches for one entity. Applies clean records to the
    /// store immediately; records with a dirty local counterpart are
    /// deferred to the resolving phase. The entity's cursor advances only
    /// when its pull completes.
    async fn pull_entity(
        &self,
        task: &mut SyncTask,
        deferred: &mut Vec<DeferredRecord>,
    ) -> Result<PullEnd> {
        let entity_type = task.entity_type.clone();
        let pull_started_at = now_ms();

        let previous = self.entity_status(&entity_type).await?;
        let checkpoint_at = previous.as_ref().and_then(|s| s.last_sync_at);
        // A failed task resumes from where it stopped
        let mut cursor = previous.as_ref().and_then(|s| {
            (s.last_task_state == Some(SyncTaskState::Failed))
                .then(|| s.resume_cursor.clone())
                .flatten()
        });

        let dirty: HashMap<String, QueueItem> = self
            .queue
            .unresolved_for_entity(&entity_type)
            .await?
            .into_iter()
            .map(|item| (item.entity_id.clone(), item))
            .collect();

        let mut current_batch: u32 = 0;
        let mut processed: u64 = 0;
        let mut total: Option<u64> = None;
        let mut batch_ema_ms: Option<f64> = None;

        loop {
            // Cooperative cancellation point; an in-flight batch always
            // finishes, this task's cursor simply does not advance
            if self.cancel_requested.load(Ordering::SeqCst) {
                return Ok(PullEnd::Cancelled);
            }

            let batch_started = std::time::Instant::now();
            let page = match self
                .transport
                .pull(&PullRequest {
                    entity_type: entity_type.clone(),
                    since: checkpoint_at,
                    cursor: cursor.clone(),
                    limit: self.config.batch.batch_size,
                })
                .await
            {
                Ok(page) => page,
                Err(error) => {
                    let message = error.to_string();
                    self.save_task_failure(&entity_type, checkpoint_at, cursor, message.clone())
                        .await?;
                    return Ok(PullEnd::Failed(message));
                }
            };

            current_batch += 1;
            total = total.or(page.total);

            for record in page.records {
                processed += 1;
                task.pulled += 1;
                if let Some(item) = dirty.get(&record.entity_id) {
                    deferred.push(DeferredRecord {
                        item: item.clone(),
                        server: record,
                        checkpoint_at,
                    });
                } else if record.deleted {
                    self.store
                        .remove(&record.entity_type, &record.entity_id)
                        .await?;
                } else {
                    self.store.apply(&record).await?;
                }
            }

            // Moving average of batch duration drives the ETA
            let elapsed = batch_started.elapsed().as_millis() as f64;
            batch_ema_ms = Some(batch_ema_ms.map_or(elapsed, |ema| {
                BATCH_EMA_ALPHA.mul_add(elapsed, (1.0 - BATCH_EMA_ALPHA) * ema)
            }));

            let total_batches = total.map(|t| {
                u32::try_from(t.div_ceil(self.config.batch.batch_size as u64)).unwrap_or(u32::MAX)
            });
            let remaining_batches =
                total_batches.map(|tb| tb.saturating_sub(current_batch));
            self.events.emit(SyncEvent::Progress(SyncProgress {
                phase: SyncPhase::Pulling,
                entity_type: Some(entity_type.clone()),
                total_items: total,
                processed_items: processed,
                current_batch,
                total_batches,
                estimated_remaining_ms: remaining_batches.and_then(|rb| {
                    batch_ema_ms.map(|ema| (ema * f64::from(rb)).max(0.0) as u64)
                }),
            }));

            cursor = page.next_cursor;
            task.cursor = cursor.clone();
            if cursor.is_none() {
                break;
            }
        }

        // Records changed while we pulled are picked up next pass
        let pending = self
            .queue
            .unresolved_count_for_entity(&entity_type)
            .await?;
        self.put_entity_status(EntitySyncStatus {
            entity_type,
            is_connected: true,
            last_sync_at: Some(pull_started_at),
            pending_changes: pending,
            last_error: None,
            last_task_state: Some(SyncTaskState::Completed),
            resume_cursor: None,
        })
        .await?;

        Ok(PullEnd::Completed)
    }

    /// Reconcile one pulled record against its dirty local counterpart.
    async fn resolve_pulled(&self, record: DeferredRecord) -> Result<()> {
        let DeferredRecord {
            item,
            server,
            checkpoint_at,
        } = record;

        let mut local = EntitySnapshot::from_payload(
            &item.entity_type,
            &item.entity_id,
            Some(item.created_at),
            &item.payload,
        );
        local.deleted = item.operation == crate::models::Operation::Delete;

        let config = self
            .config
            .conflict_config(&item.entity_type)
            .cloned()
            .unwrap_or_default();
        let outcome = ConflictResolver::resolve(
            &local,
            &server,
            &Checkpoint::at(checkpoint_at),
            &config,
        );

        match outcome {
            // The queued mutation will carry the local side at push time
            ConflictOutcome::UpToDate | ConflictOutcome::ApplyLocal(_) => Ok(()),
            ConflictOutcome::AlreadyDeleted => {
                self.complete_superseded(&item).await
            }
            ConflictOutcome::ApplyServer(snapshot) => {
                self.store.apply(&snapshot).await?;
                Ok(())
            }
            ConflictOutcome::Resolved { snapshot, winner } => {
                let db = self.db.lock().await;
                SqliteSyncRepository::new(db.connection()).journal_resolution(
                    &crate::models::ConflictDetail {
                        entity_type: local.entity_type.clone(),
                        entity_id: local.entity_id.clone(),
                        conflicting_fields: local.differing_fields(&server),
                        strategy: config.strategy,
                        detected_at: now_ms(),
                        local: local.clone(),
                        server: server.clone(),
                    },
                    winner.as_str(),
                    now_ms(),
                )?;
                drop(db);

                self.store.apply(&snapshot).await?;
                match winner {
                    // The local mutation is superseded by the server value
                    Winner::Server => self.complete_superseded(&item).await,
                    // Push will send the reconciled payload instead
                    Winner::Local | Winner::FieldMerge => {
                        self.queue
                            .update_payload(&item.id, &snapshot.to_payload())
                            .await
                    }
                }
            }
            ConflictOutcome::Deferred(detail) => {
                // Park the mutation: claim it so no replay touches it, then
                // persist the diff for the user. A failed item needs no
                // claim; the conflict row alone keeps it out of dequeues.
                if item.status == crate::models::QueueItemStatus::Pending {
                    self.queue.claim_item(&item.id).await?;
                }
                let db = self.db.lock().await;
                SqliteSyncRepository::new(db.connection()).insert_pending_conflict(
                    &PendingConflict {
                        mutation_id: item.id,
                        detail: *detail,
                        created_at: now_ms(),
                    },
                )?;
                Ok(())
            }
        }
    }

    /// Discard a queued mutation whose entity the server already settled.
    async fn complete_superseded(&self, item: &QueueItem) -> Result<()> {
        match item.status {
            crate::models::QueueItemStatus::Pending => {
                self.queue.claim_item(&item.id).await?;
            }
            crate::models::QueueItemStatus::Failed => {
                self.queue.retry_item(&item.id).await?;
                self.queue.claim_item(&item.id).await?;
            }
            crate::models::QueueItemStatus::Processing => {}
            crate::models::QueueItemStatus::Completed => return Ok(()),
        }
        self.queue.mark_completed(&item.id).await
    }

    async fn refresh_pending_counts(&self, tasks: &[SyncTask]) -> Result<()> {
        for task in tasks {
            if task.state != SyncTaskState::Completed {
                continue;
            }
            if let Some(mut status) = self.entity_status(&task.entity_type).await? {
                status.pending_changes = self
                    .queue
                    .unresolved_count_for_entity(&task.entity_type)
                    .await?;
                self.put_entity_status(status).await?;
            }
        }
        Ok(())
    }

    /// Persist a failed task's position so `retry_failed_sync` can resume
    /// from its saved batch cursor.
    async fn save_task_failure(
        &self,
        entity_type: &str,
        checkpoint_at: Option<i64>,
        resume_cursor: Option<String>,
        error: String,
    ) -> Result<()> {
        let pending = self.queue.unresolved_count_for_entity(entity_type).await?;
        self.put_entity_status(EntitySyncStatus {
            entity_type: entity_type.to_string(),
            is_connected: false,
            // The cursor does not advance on an interrupted pull
            last_sync_at: checkpoint_at,
            pending_changes: pending,
            last_error: Some(error),
            last_task_state: Some(SyncTaskState::Failed),
            resume_cursor,
        })
        .await
    }

    async fn settle_fatal(
        &self,
        pass_id: Option<&str>,
        started_at: i64,
        reason: String,
    ) -> Result<SyncResult> {
        let result = SyncResult::failed(
            started_at,
            u64::try_from(now_ms() - started_at).unwrap_or(0),
            reason.clone(),
        );

        {
            let db = self.db.lock().await;
            let repo = SqliteSyncRepository::new(db.connection());
            repo.record_result(&result, now_ms())?;
            if let Some(pass_id) = pass_id {
                repo.end_pass(pass_id)?;
            }
        }

        self.set_phase(SyncPhase::Failed);
        self.events.emit(SyncEvent::Failed { reason });
        Ok(result)
    }

    async fn settle_cancelled(
        &self,
        pass_id: &str,
        started_at: i64,
        tasks: &[SyncTask],
        errors: Vec<SyncProgressError>,
    ) -> Result<SyncResult> {
        let result = SyncResult {
            success: false,
            cancelled: true,
            pulled: tasks.iter().map(|t| t.pulled).sum(),
            pushed: 0,
            errors,
            started_at,
            duration_ms: u64::try_from(now_ms() - started_at).unwrap_or(0),
            reason: Some("cancelled by caller".into()),
        };

        {
            let db = self.db.lock().await;
            let repo = SqliteSyncRepository::new(db.connection());
            repo.record_result(&result, now_ms())?;
            repo.end_pass(pass_id)?;
        }

        self.set_phase(SyncPhase::Failed);
        self.events.emit(SyncEvent::Failed {
            reason: "cancelled by caller".into(),
        });
        tracing::info!("Sync pass cancelled");
        Ok(result)
    }

    fn set_phase(&self, to: SyncPhase) {
        let from = {
            let mut phase = self.phase.lock();
            let from = *phase;
            *phase = to;
            from
        };
        tracing::debug!(from = from.as_str(), to = to.as_str(), "Sync phase change");
        self.events.emit(SyncEvent::PhaseChanged { from, to });
    }

    async fn entity_status(&self, entity_type: &str) -> Result<Option<EntitySyncStatus>> {
        let db = self.db.lock().await;
        SqliteSyncRepository::new(db.connection()).get_status(entity_type)
    }

    async fn put_entity_status(&self, status: EntitySyncStatus) -> Result<()> {
        let db = self.db.lock().await;
        SqliteSyncRepository::new(db.connection()).put_status(&status)
    }
}
