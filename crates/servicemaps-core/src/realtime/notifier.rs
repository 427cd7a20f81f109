//! Background listener for pushed changes
//!
//! Runs while the app is in the foreground and signed in. Each event
//! refreshes just the entity it names. The connection is re-established
//! with exponential backoff, and a watchdog asks for a full sync whenever
//! the last complete one is older than the freshness window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{ChangeEvent, ChangeOperation, FullSyncTrigger, RealtimeChannel, RealtimeScope};
use crate::config::Config;
use crate::error::SyncError;
use crate::reconcile::{EntityOutcome, Reconciler};
use crate::remote::RemoteApi;
use crate::storage::{LocalStore, StorageError};

/// Listener state, observable by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not running (signed out or never started)
    Stopped,
    /// App in the background; resumes on foreground
    Paused,
    Connecting,
    Connected,
    /// Waiting to reconnect
    Disconnected,
}

/// Timing knobs
#[derive(Debug, Clone)]
pub struct NotifierSettings {
    pub watchdog_interval: Duration,
    pub freshness_window: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl From<&Config> for NotifierSettings {
    fn from(config: &Config) -> Self {
        Self {
            watchdog_interval: config.watchdog_interval(),
            freshness_window: config.freshness_window(),
            reconnect_initial_delay: config.reconnect_initial_delay(),
            reconnect_max_delay: config.reconnect_max_delay(),
        }
    }
}

enum NotifierCommand {
    Shutdown,
}

struct Running {
    scope: RealtimeScope,
    command_tx: mpsc::Sender<NotifierCommand>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    running: Option<Running>,
    /// Scope to resume with after a pause
    scope: Option<RealtimeScope>,
}

/// Everything the listening task needs
struct Listener {
    channel: Arc<dyn RealtimeChannel>,
    remote: Arc<dyn RemoteApi>,
    reconciler: Reconciler,
    store: LocalStore,
    trigger: Arc<dyn FullSyncTrigger>,
    settings: NotifierSettings,
}

impl Listener {
    async fn handle_event(&self, event: ChangeEvent) {
        let kind = event.entity_kind;
        if !event.entity_id.fits(kind) {
            warn!("Ignoring {} event with malformed key '{}'", kind, event.entity_id);
            return;
        }

        let result: Result<EntityOutcome, SyncError> = match event.operation {
            ChangeOperation::Delete => self
                .reconciler
                .apply_entity(kind, &event.entity_id, None)
                .map_err(SyncError::from),
            ChangeOperation::Insert | ChangeOperation::Update => {
                let embedded = event.embedded_record().unwrap_or_else(|e| {
                    debug!("Unreadable payload in {} event: {}", kind, e);
                    None
                });
                match embedded {
                    Some(record) => {
                        let key = record.key();
                        self.reconciler
                            .apply_entity(kind, &key, Some(record))
                            .map_err(SyncError::from)
                    }
                    None => match self.remote.fetch_entity(kind, &event.entity_id).await {
                        Ok(record) => self
                            .reconciler
                            .apply_entity(kind, &event.entity_id, record)
                            .map_err(SyncError::from),
                        Err(e) => Err(e.into()),
                    },
                }
            }
        };

        match result {
            Ok(outcome) => debug!("{} '{}' refreshed: {:?}", kind, event.entity_id, outcome),
            Err(SyncError::Storage(StorageError::MissingParent { .. })) => {
                info!(
                    "{} '{}' belongs to data not cached yet; requesting full sync",
                    kind, event.entity_id
                );
                self.trigger.request_full_sync().await;
            }
            Err(e) => warn!("Could not refresh {} '{}': {}", kind, event.entity_id, e),
        }
    }

    async fn check_freshness(&self) {
        match self.store.last_full_sync() {
            Ok(Some(at)) => {
                let age = (Utc::now() - at).to_std().unwrap_or_default();
                if age < self.settings.freshness_window {
                    return;
                }
                info!("Last full sync is {}s old; requesting full sync", age.as_secs());
            }
            Ok(None) => info!("No full sync recorded; requesting one"),
            Err(e) => {
                warn!("Could not read last sync time: {}", e);
                return;
            }
        }
        self.trigger.request_full_sync().await;
    }
}

/// Main listening loop with reconnection
async fn listen_loop(
    listener: Arc<Listener>,
    scope: RealtimeScope,
    mut command_rx: mpsc::Receiver<NotifierCommand>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let settings = &listener.settings;
    let mut reconnect_delay = settings.reconnect_initial_delay;
    let mut watchdog = tokio::time::interval(settings.watchdog_interval);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let _ = status_tx.send(ConnectionStatus::Connecting);

        let subscribed = tokio::select! {
            result = listener.channel.subscribe(&scope) => result,
            cmd = command_rx.recv() => match cmd {
                Some(NotifierCommand::Shutdown) | None => return,
            },
        };

        match subscribed {
            Ok(mut events) => {
                let _ = status_tx.send(ConnectionStatus::Connected);
                info!("Realtime connected for congregation {}", scope.congregation);
                reconnect_delay = settings.reconnect_initial_delay;
                // Anything sent while disconnected was missed
                watchdog.reset();
                listener.check_freshness().await;

                loop {
                    tokio::select! {
                        cmd = command_rx.recv() => match cmd {
                            Some(NotifierCommand::Shutdown) | None => return,
                        },
                        _ = watchdog.tick() => listener.check_freshness().await,
                        event = events.next() => match event {
                            Some(Ok(event)) => listener.handle_event(event).await,
                            Some(Err(e)) => {
                                warn!("Realtime stream failed: {}", e);
                                break;
                            }
                            None => {
                                debug!("Realtime stream ended");
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => warn!("Realtime subscribe failed: {}", e),
        }

        let _ = status_tx.send(ConnectionStatus::Disconnected);

        // Wait before reconnecting, keeping the watchdog and shutdown live
        let backoff = tokio::time::sleep(reconnect_delay);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                _ = &mut backoff => break,
                _ = watchdog.tick() => listener.check_freshness().await,
                cmd = command_rx.recv() => match cmd {
                    Some(NotifierCommand::Shutdown) | None => return,
                },
            }
        }
        reconnect_delay = (reconnect_delay * 2).min(settings.reconnect_max_delay);
    }
}

/// Owns the realtime listening task
pub struct RealtimeNotifier {
    listener: Arc<Listener>,
    lifecycle: Mutex<Lifecycle>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl RealtimeNotifier {
    pub fn new(
        channel: Arc<dyn RealtimeChannel>,
        remote: Arc<dyn RemoteApi>,
        store: LocalStore,
        trigger: Arc<dyn FullSyncTrigger>,
        settings: NotifierSettings,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Stopped);
        Self {
            listener: Arc::new(Listener {
                channel,
                remote,
                reconciler: Reconciler::new(store.clone()),
                store,
                trigger,
                settings,
            }),
            lifecycle: Mutex::new(Lifecycle::default()),
            status_tx,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        let lifecycle = self.lifecycle.lock().await;
        lifecycle
            .running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Start listening for `scope`
    ///
    /// A no-op if already listening for the same scope.
    pub async fn start(&self, scope: RealtimeScope) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(running) = &lifecycle.running {
            if running.scope == scope && !running.task.is_finished() {
                return;
            }
        }
        Self::shutdown(&mut lifecycle).await;

        let (command_tx, command_rx) = mpsc::channel(4);
        let task = tokio::spawn(listen_loop(
            self.listener.clone(),
            scope.clone(),
            command_rx,
            self.status_tx.clone(),
        ));
        debug!("Realtime listener started for congregation {}", scope.congregation);

        lifecycle.scope = Some(scope.clone());
        lifecycle.running = Some(Running {
            scope,
            command_tx,
            task,
        });
    }

    /// Record a new authorization scope, resubscribing if listening
    pub async fn set_scope(&self, scope: RealtimeScope) {
        let listening = {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.running.is_none() {
                lifecycle.scope = Some(scope.clone());
                false
            } else {
                true
            }
        };
        if listening {
            self.start(scope).await;
        }
    }

    /// Tear the connection down but remember the scope
    pub async fn pause(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if Self::shutdown(&mut lifecycle).await {
            let _ = self.status_tx.send(ConnectionStatus::Paused);
        }
    }

    /// Reconnect with the remembered scope after a pause
    pub async fn resume(&self) {
        let scope = {
            let lifecycle = self.lifecycle.lock().await;
            if lifecycle.running.is_some() {
                return;
            }
            lifecycle.scope.clone()
        };
        if let Some(scope) = scope {
            self.start(scope).await;
        }
    }

    /// Tear down and forget the scope
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        Self::shutdown(&mut lifecycle).await;
        lifecycle.scope = None;
        let _ = self.status_tx.send(ConnectionStatus::Stopped);
    }

    /// Stop the task and wait for it; returns whether one was running
    async fn shutdown(lifecycle: &mut Lifecycle) -> bool {
        let Some(running) = lifecycle.running.take() else {
            return false;
        };
        let _ = running.command_tx.send(NotifierCommand::Shutdown).await;
        if let Err(e) = running.task.await {
            warn!("Realtime listener ended abnormally: {}", e);
        }
        debug!("Realtime listener stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityKind, RecordKey, Territory, Visit, VisitSymbol};
    use crate::reconcile::{FullSnapshot, TerritorySnapshot};
    use crate::testing::{address, house, territory, FakeChannel, FakeRemote, FakeTrigger};

    struct Harness {
        store: LocalStore,
        remote: Arc<FakeRemote>,
        channel: Arc<FakeChannel>,
        trigger: Arc<FakeTrigger>,
        notifier: RealtimeNotifier,
    }

    fn settings() -> NotifierSettings {
        NotifierSettings {
            watchdog_interval: Duration::from_secs(3600),
            freshness_window: Duration::from_secs(3600),
            reconnect_initial_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(50),
        }
    }

    fn harness() -> Harness {
        let store = LocalStore::open_in_memory().unwrap();
        store.set_last_full_sync(Utc::now()).unwrap();
        let remote = Arc::new(FakeRemote::new());
        let channel = Arc::new(FakeChannel::new());
        let trigger = Arc::new(FakeTrigger::new());
        let notifier = RealtimeNotifier::new(
            channel.clone(),
            remote.clone(),
            store.clone(),
            trigger.clone(),
            settings(),
        );
        Harness {
            store,
            remote,
            channel,
            trigger,
            notifier,
        }
    }

    fn scope(congregation: &str) -> RealtimeScope {
        RealtimeScope {
            congregation: congregation.into(),
            user: Some("ann@example.com".into()),
            admin: false,
        }
    }

    fn event(kind: EntityKind, id: &str, operation: ChangeOperation) -> ChangeEvent {
        ChangeEvent {
            entity_kind: kind,
            entity_id: RecordKey::id(id),
            operation,
            data: None,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn seed(store: &LocalStore) {
        Reconciler::new(store.clone())
            .reconcile(&FullSnapshot {
                territories: Some(TerritorySnapshot {
                    territories: vec![territory("t1")],
                    addresses: vec![address("a1", "t1")],
                    houses: vec![house("h1", "a1")],
                    visits: vec![],
                }),
                ..Default::default()
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_event_fetches_and_applies_entity() {
        let h = harness();
        let mut updated = territory("t1");
        updated.description = "Renamed".into();
        h.remote.put_entity(updated.into());

        h.notifier.start(scope("c1")).await;
        eventually(|| h.channel.subscriptions() == 1).await;
        h.channel
            .send(event(EntityKind::Territory, "t1", ChangeOperation::Update));

        let store = h.store.clone();
        eventually(move || {
            store
                .get::<Territory>(&RecordKey::id("t1"))
                .unwrap()
                .is_some_and(|t| t.description == "Renamed")
        })
        .await;
        h.notifier.stop().await;
    }

    #[tokio::test]
    async fn test_delete_event_removes_row() {
        let h = harness();
        seed(&h.store);

        h.notifier.start(scope("c1")).await;
        eventually(|| h.channel.subscriptions() == 1).await;
        h.channel
            .send(event(EntityKind::TerritoryAddress, "a1", ChangeOperation::Delete));

        let store = h.store.clone();
        eventually(move || store.count(EntityKind::House).unwrap() == 0).await;
        assert_eq!(h.remote.entity_fetches(), 0);
        h.notifier.stop().await;
    }

    #[tokio::test]
    async fn test_embedded_visit_applied_without_fetch() {
        let h = harness();
        seed(&h.store);
        let visit = Visit::new("h1", 42, VisitSymbol::NT, "", "bob");

        h.notifier.start(scope("c1")).await;
        eventually(|| h.channel.subscriptions() == 1).await;
        h.channel.send(ChangeEvent {
            entity_kind: EntityKind::Visit,
            entity_id: RecordKey::id("server-id"),
            operation: ChangeOperation::Insert,
            data: Some(serde_json::to_value(&visit).unwrap()),
        });

        let store = h.store.clone();
        eventually(move || store.count(EntityKind::Visit).unwrap() == 1).await;
        assert_eq!(h.remote.entity_fetches(), 0);
        h.notifier.stop().await;
    }

    #[tokio::test]
    async fn test_orphan_event_requests_full_sync() {
        let h = harness();
        h.remote.put_entity(house("h9", "unknown-address").into());

        h.notifier.start(scope("c1")).await;
        eventually(|| h.channel.subscriptions() == 1).await;
        h.channel
            .send(event(EntityKind::House, "h9", ChangeOperation::Insert));

        eventually(|| h.trigger.requests() == 1).await;
        h.notifier.stop().await;
    }

    #[tokio::test]
    async fn test_same_scope_does_not_resubscribe() {
        let h = harness();
        h.notifier.start(scope("c1")).await;
        eventually(|| h.channel.subscriptions() == 1).await;

        h.notifier.set_scope(scope("c1")).await;
        h.notifier.start(scope("c1")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.channel.subscriptions(), 1);

        h.notifier.set_scope(scope("c2")).await;
        eventually(|| h.channel.subscriptions() == 2).await;
        assert_eq!(h.channel.scopes().last().unwrap().congregation, "c2");
        h.notifier.stop().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_stream_ends() {
        let h = harness();
        h.notifier.start(scope("c1")).await;
        eventually(|| h.channel.subscriptions() == 1).await;

        h.channel.disconnect();
        eventually(|| h.channel.subscriptions() == 2).await;
        h.notifier.stop().await;
    }

    #[tokio::test]
    async fn test_stale_cache_triggers_full_sync() {
        let h = harness();
        h.store.clear().unwrap();

        h.notifier.start(scope("c1")).await;
        eventually(|| h.trigger.requests() >= 1).await;
        h.notifier.stop().await;
    }

    #[tokio::test]
    async fn test_pause_resume_and_stop() {
        let h = harness();
        h.notifier.start(scope("c1")).await;
        eventually(|| h.channel.subscriptions() == 1).await;

        h.notifier.pause().await;
        assert_eq!(h.notifier.status(), ConnectionStatus::Paused);
        assert!(!h.notifier.is_running().await);

        h.notifier.resume().await;
        eventually(|| h.channel.subscriptions() == 2).await;
        assert_eq!(h.channel.scopes()[1], scope("c1"));

        h.notifier.stop().await;
        assert_eq!(h.notifier.status(), ConnectionStatus::Stopped);
        h.notifier.resume().await;
        assert!(!h.notifier.is_running().await);
    }
}
