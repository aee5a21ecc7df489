//! Background sync scheduling
//!
//! Triggers the [`SyncManager`] outside explicit user action: a recurring
//! timer with a minimum interval floor, plus an immediate attempt when
//! connectivity comes back after the floor has elapsed. Every trigger goes
//! through the same manager, so the one-pass-at-a-time guarantee holds for
//! background and foreground passes alike.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::BackgroundSyncConfig;
use crate::error::Result;
use crate::models::SyncResult;
use crate::sync::SyncManager;
use crate::transport::ConnectivityState;

/// Why a background trigger did not run a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Offline,
    RequiresWifi,
    RequiresCharging,
    /// The minimum interval since the last attempt has not elapsed
    TooSoon,
}

/// Outcome of one background trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundSyncResult {
    pub ran: bool,
    pub skipped: Option<SkipReason>,
    pub result: Option<SyncResult>,
}

impl BackgroundSyncResult {
    const fn skipped(reason: SkipReason) -> Self {
        Self {
            ran: false,
            skipped: Some(reason),
            result: None,
        }
    }
}

#[derive(Default)]
struct Schedule {
    config: Option<BackgroundSyncConfig>,
    next_sync_at: Option<Instant>,
    last_attempt_at: Option<Instant>,
}

/// Schedules periodic and connectivity-driven sync passes
pub struct BackgroundSyncService {
    manager: Arc<SyncManager>,
    connectivity: watch::Receiver<ConnectivityState>,
    schedule: Arc<parking_lot::Mutex<Schedule>>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundSyncService {
    pub fn new(
        manager: Arc<SyncManager>,
        connectivity: watch::Receiver<ConnectivityState>,
    ) -> Self {
        Self {
            manager,
            connectivity,
            schedule: Arc::new(parking_lot::Mutex::new(Schedule::default())),
            worker: parking_lot::Mutex::new(None),
        }
    }

    /// Register the recurring trigger. Re-enabling replaces the previous
    /// schedule.
    pub fn enable(&self, config: BackgroundSyncConfig) {
        self.disable();

        let interval = config.effective_interval();
        {
            let mut schedule = self.schedule.lock();
            schedule.config = Some(config);
            schedule.next_sync_at = Some(Instant::now() + interval);
        }
        tracing::info!(interval_secs = interval.as_secs(), "Background sync enabled");

        let manager = Arc::clone(&self.manager);
        let schedule = Arc::clone(&self.schedule);
        let mut connectivity = self.connectivity.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Some(next_at) = schedule.lock().next_sync_at else {
                    break;
                };

                tokio::select! {
                    () = tokio::time::sleep_until(next_at) => {
                        let state = *connectivity.borrow();
                        Self::attempt(&manager, &schedule, state).await;
                    }
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *connectivity.borrow();
                        if state.online && Self::floor_elapsed(&schedule) {
                            tracing::debug!("Connectivity regained; syncing immediately");
                            Self::attempt(&manager, &schedule, state).await;
                        }
                        // Otherwise wait for the already-scheduled tick
                    }
                }
            }
        });

        *self.worker.lock() = Some(handle);
    }

    /// Deregister the recurring trigger
    pub fn disable(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
        let mut schedule = self.schedule.lock();
        schedule.config = None;
        schedule.next_sync_at = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.schedule.lock().config.is_some()
    }

    /// Remaining wait before the next scheduled pass, when enabled
    pub fn time_until_next_sync(&self) -> Option<Duration> {
        self.schedule
            .lock()
            .next_sync_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Manual one-shot trigger through the shared sync manager.
    ///
    /// Applies the connectivity/wifi/charging policy but not the interval
    /// floor: an explicit tap always counts.
    pub async fn trigger_sync(&self) -> Result<BackgroundSyncResult> {
        let state = *self.connectivity.borrow();
        let config = self.schedule.lock().config;

        if let Some(reason) = Self::policy_skip(config.as_ref(), state) {
            // TooSoon never applies to a manual trigger
            if reason != SkipReason::TooSoon {
                return Ok(BackgroundSyncResult::skipped(reason));
            }
        }

        let result = self.manager.start_sync(false).await?;
        self.note_attempt();
        Ok(BackgroundSyncResult {
            ran: true,
            skipped: None,
            result: Some(result),
        })
    }

    /// One scheduled attempt: apply policy, run, reschedule.
    async fn attempt(
        manager: &Arc<SyncManager>,
        schedule: &Arc<parking_lot::Mutex<Schedule>>,
        state: ConnectivityState,
    ) {
        let config = {
            let schedule = schedule.lock();
            schedule.config
        };
        let Some(config) = config else { return };

        let mut ran = false;
        if let Some(reason) = Self::policy_skip(Some(&config), state) {
            tracing::debug!(?reason, "Background sync tick skipped");
        } else {
            ran = true;
            if let Err(error) = manager.start_sync(false).await {
                tracing::warn!(error = %error, "Background sync pass failed");
            }
        }

        let mut schedule = schedule.lock();
        let now = Instant::now();
        // A skipped tick does not count against the interval floor, so a
        // reconnect right after it can still fire immediately
        if ran {
            schedule.last_attempt_at = Some(now);
        }
        schedule.next_sync_at = Some(now + config.effective_interval());
    }

    /// Policy gate shared by timer ticks and manual triggers
    fn policy_skip(
        config: Option<&BackgroundSyncConfig>,
        state: ConnectivityState,
    ) -> Option<SkipReason> {
        if !state.online {
            return Some(SkipReason::Offline);
        }
        let config = config?;
        if config.requires_wifi && !state.wifi {
            return Some(SkipReason::RequiresWifi);
        }
        if config.requires_charging && !state.charging {
            return Some(SkipReason::RequiresCharging);
        }
        None
    }

    fn floor_elapsed(schedule: &Arc<parking_lot::Mutex<Schedule>>) -> bool {
        let schedule = schedule.lock();
        let Some(config) = schedule.config else {
            return false;
        };
        schedule
            .last_attempt_at
            .is_none_or(|last| last.elapsed() >= config.effective_interval())
    }

    fn note_attempt(&self) {
        let mut schedule = self.schedule.lock();
        let now = Instant::now();
        schedule.last_attempt_at = Some(now);
        if let Some(config) = schedule.config {
            schedule.next_sync_at = Some(now + config.effective_interval());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BackoffConfig, BatchConfig, EntityRegistration, SyncConfig, MIN_SYNC_INTERVAL,
    };
    use crate::db::Database;
    use crate::handler::OfflineMutationHandler;
    use crate::models::EntitySnapshot;
    use crate::queue::MutationQueue;
    use crate::transport::{
        AuthProvider, AuthSession, EntityStore, EntityTransport, PullPage, PullRequest,
        PushOutcome, PushRequest,
    };
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CountingTransport {
        pulls: parking_lot::Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl EntityTransport for CountingTransport {
        async fn push(&self, request: &PushRequest) -> crate::error::Result<PushOutcome> {
            Ok(PushOutcome::Applied {
                server_id: Some(request.entity_id.clone()),
                server_updated_at: None,
            })
        }

        async fn pull(&self, _request: &PullRequest) -> crate::error::Result<PullPage> {
            *self.pulls.lock() += 1;
            Ok(PullPage {
                records: Vec::new(),
                next_cursor: None,
                total: Some(0),
            })
        }
    }

    struct OkAuth;

    #[async_trait::async_trait]
    impl AuthProvider for OkAuth {
        async fn ensure_authenticated(&self) -> crate::error::Result<AuthSession> {
            Ok(AuthSession {
                subject: "device:gate-7".into(),
                expires_at: None,
            })
        }
    }

    struct NullStore;

    #[async_trait::async_trait]
    impl EntityStore for NullStore {
        async fn get(
            &self,
            _entity_type: &str,
            _entity_id: &str,
        ) -> crate::error::Result<Option<EntitySnapshot>> {
            Ok(None)
        }

        async fn apply(&self, _snapshot: &EntitySnapshot) -> crate::error::Result<()> {
            Ok(())
        }

        async fn remove(
            &self,
            _entity_type: &str,
            _entity_id: &str,
        ) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        service: BackgroundSyncService,
        transport: Arc<CountingTransport>,
        connectivity_tx: watch::Sender<ConnectivityState>,
    }

    fn fixture(initial: ConnectivityState) -> Fixture {
        let config = SyncConfig {
            festival_id: "fest-2026".into(),
            device_id: "gate-7".into(),
            entities: vec![EntityRegistration::new("favorites")],
            batch: BatchConfig::default(),
            backoff: BackoffConfig::default(),
        };

        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let queue = Arc::new(MutationQueue::new(Arc::clone(&db), BackoffConfig::default()));
        let transport = Arc::new(CountingTransport::default());
        let store = Arc::new(NullStore);

        let handler = Arc::new(OfflineMutationHandler::new(
            Arc::clone(&db),
            Arc::clone(&queue),
            Arc::clone(&store) as Arc<dyn EntityStore>,
            Arc::clone(&transport) as Arc<dyn EntityTransport>,
            config.clone(),
        ));
        let manager = Arc::new(SyncManager::new(
            db,
            queue,
            handler,
            store,
            Arc::clone(&transport) as Arc<dyn EntityTransport>,
            Arc::new(OkAuth),
            config,
        ));

        let (connectivity_tx, connectivity_rx) = watch::channel(initial);
        Fixture {
            service: BackgroundSyncService::new(manager, connectivity_rx),
            transport,
            connectivity_tx,
        }
    }

    #[tokio::test]
    async fn test_trigger_skips_while_offline() {
        let fx = fixture(ConnectivityState::OFFLINE);

        let outcome = fx.service.trigger_sync().await.unwrap();
        assert!(!outcome.ran);
        assert_eq!(outcome.skipped, Some(SkipReason::Offline));
        assert_eq!(*fx.transport.pulls.lock(), 0);
    }

    #[tokio::test]
    async fn test_trigger_runs_when_online() {
        let fx = fixture(ConnectivityState::online());

        let outcome = fx.service.trigger_sync().await.unwrap();
        assert!(outcome.ran);
        assert!(outcome.result.unwrap().success);
        assert_eq!(*fx.transport.pulls.lock(), 1);
    }

    #[tokio::test]
    async fn test_trigger_honors_wifi_policy() {
        let fx = fixture(ConnectivityState::online());
        fx.service.enable(BackgroundSyncConfig {
            requires_wifi: true,
            ..Default::default()
        });

        let outcome = fx.service.trigger_sync().await.unwrap();
        assert_eq!(outcome.skipped, Some(SkipReason::RequiresWifi));

        fx.connectivity_tx
            .send(ConnectivityState {
                online: true,
                wifi: true,
                charging: false,
            })
            .unwrap();
        let outcome = fx.service.trigger_sync().await.unwrap();
        assert!(outcome.ran);
    }

    #[tokio::test]
    async fn test_enable_reports_time_until_next_sync() {
        let fx = fixture(ConnectivityState::online());
        assert!(fx.service.time_until_next_sync().is_none());

        fx.service.enable(BackgroundSyncConfig {
            min_interval: Duration::from_secs(300),
            ..Default::default()
        });

        let wait = fx.service.time_until_next_sync().unwrap();
        assert!(wait <= Duration::from_secs(300));
        assert!(wait > Duration::from_secs(290));

        fx.service.disable();
        assert!(fx.service.time_until_next_sync().is_none());
        assert!(!fx.service.is_enabled());
    }

    #[tokio::test]
    async fn test_interval_floor_applied() {
        let fx = fixture(ConnectivityState::online());
        fx.service.enable(BackgroundSyncConfig {
            min_interval: Duration::from_secs(1),
            ..Default::default()
        });

        // A 1s request is clamped to the floor
        let wait = fx.service.time_until_next_sync().unwrap();
        assert!(wait > Duration::from_secs(1));
        assert!(wait <= MIN_SYNC_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_tick_runs_pass() {
        let fx = fixture(ConnectivityState::online());
        fx.service.enable(BackgroundSyncConfig {
            min_interval: Duration::from_secs(60),
            ..Default::default()
        });

        tokio::time::advance(Duration::from_secs(61)).await;
        // Let the worker run its tick
        tokio::task::yield_now().await;
        for _ in 0..50 {
            if *fx.transport.pulls.lock() > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(*fx.transport.pulls.lock(), 1);
        // Rescheduled for the next interval
        assert!(fx.service.time_until_next_sync().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_tick_skips_then_reconnect_fires() {
        let fx = fixture(ConnectivityState::OFFLINE);
        fx.service.enable(BackgroundSyncConfig {
            min_interval: Duration::from_secs(60),
            ..Default::default()
        });

        // First tick while offline: policy skips the pass
        tokio::time::advance(Duration::from_secs(61)).await;
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*fx.transport.pulls.lock(), 0);

        // Connectivity regained with no pass ever run: fires immediately
        fx.connectivity_tx
            .send(ConnectivityState::online())
            .unwrap();
        for _ in 0..50 {
            if *fx.transport.pulls.lock() > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*fx.transport.pulls.lock(), 1);
    }
}
