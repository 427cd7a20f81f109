//! Synchronization manager
//!
//! Owns the startup state machine and runs full sync passes:
//!
//! 1. Upload pending changes
//! 2. Fetch every snapshot concurrently
//! 3. Reconcile them into the cache
//! 4. Re-evaluate the startup state from local data and credentials
//!
//! Only one pass runs at a time. A request that arrives while one is in
//! flight is dropped; the running pass updates the state for both.
//!
//! Signing out bumps a session generation. A pass started under an older
//! generation stops before touching the cache and never sets the state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use super::credentials::{CredentialCheck, CredentialProvider, SessionSnapshot};
use super::state::StartupState;
use crate::error::{SyncError, SyncResult};
use crate::models::{EntityKind, RecordKey};
use crate::pending::PendingQueue;
use crate::realtime::FullSyncTrigger;
use crate::reconcile::{FullSnapshot, Reconciler};
use crate::remote::{RemoteApi, RemoteError, RemoteResult};
use crate::storage::{LocalStore, StorageResult};
use crate::upload::Uploader;

/// Progress notifications for the UI
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(StartupState),
    SyncStarted,
    SyncCompleted(SyncSummary),
    /// The pass failed; cached data was kept
    SyncFailed(String),
    /// The server refused a queued change, which has been dropped
    ChangeRejected {
        kind: EntityKind,
        target: RecordKey,
        message: String,
    },
    /// Admin or phone credentials appeared or went away during a pass
    SessionChanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub uploaded: usize,
    /// Changes left queued for the next pass
    pub retained: usize,
    pub rejected: usize,
    /// Rows inserted, updated or deleted by reconciliation
    pub changed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncSummary),
    /// Another pass was already running
    Coalesced,
    /// Not signed in, or sync disabled
    Skipped,
}

struct Inner {
    store: LocalStore,
    queue: PendingQueue,
    reconciler: Reconciler,
    uploader: Uploader,
    remote: Arc<dyn RemoteApi>,
    credentials: Arc<dyn CredentialProvider>,
    state_tx: watch::Sender<StartupState>,
    events: broadcast::Sender<SyncEvent>,
    sync_lock: Mutex<()>,
    generation: AtomicU64,
    sync_enabled: bool,
}

/// Cloneable handle to the synchronization manager
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteApi>,
        credentials: Arc<dyn CredentialProvider>,
        upload_concurrency: usize,
        sync_enabled: bool,
    ) -> Self {
        let queue = PendingQueue::new(store.clone());
        let (state_tx, _) = watch::channel(StartupState::Unknown);
        let (events, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(Inner {
                reconciler: Reconciler::new(store.clone()),
                uploader: Uploader::new(queue.clone(), remote.clone(), upload_concurrency),
                store,
                queue,
                remote,
                credentials,
                state_tx,
                events,
                sync_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
                sync_enabled,
            }),
        }
    }

    pub fn state(&self) -> StartupState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StartupState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn pending_count(&self) -> StorageResult<i64> {
        self.inner.queue.count()
    }

    pub fn last_full_sync(&self) -> StorageResult<Option<DateTime<Utc>>> {
        self.inner.store.last_full_sync()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.sync_lock.try_lock().is_err()
    }

    fn emit(&self, event: SyncEvent) {
        // No listeners is fine
        let _ = self.inner.events.send(event);
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: StartupState) {
        self.set_state_for(None, next);
    }

    /// Set the state unless the session `generation` has ended
    fn set_state_for(&self, generation: Option<u64>, next: StartupState) {
        let changed = self.inner.state_tx.send_if_modified(|state| {
            if generation.is_some_and(|g| g != self.generation()) || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("Startup state -> {}", next);
            self.emit(SyncEvent::StateChanged(next));
        }
    }

    /// Back to the signed-out state
    pub fn reset(&self) {
        self.set_state(StartupState::Welcome);
    }

    /// End the session: cancel a running pass, wait for it, then clear the
    /// cache and the queue
    pub async fn sign_out(&self) -> StorageResult<()> {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let _guard = self.inner.sync_lock.lock().await;
        self.inner.store.clear()?;
        self.reset();
        Ok(())
    }

    /// Decide what to present, optionally after a full sync
    ///
    /// With `synchronizing` false no network call is made. A failed sync
    /// never pushes the state below what the cached data supports.
    pub async fn startup_process(&self, synchronizing: bool) -> StartupState {
        let generation = self.generation();
        let mut unauthorized = false;
        if synchronizing {
            match self.synchronize().await {
                Ok(SyncOutcome::Coalesced) | Err(SyncError::Cancelled) => return self.state(),
                Ok(_) => {}
                Err(SyncError::Unauthorized) => unauthorized = true,
                Err(e) => debug!("Continuing with cached data: {}", e),
            }
        }
        self.refresh_state(generation, unauthorized).await
    }

    async fn refresh_state(&self, generation: u64, unauthorized: bool) -> StartupState {
        let session = self.inner.credentials.session();
        let evaluated = match self.evaluate(&session) {
            Ok(state) => state,
            Err(e) => {
                warn!("Could not evaluate startup state: {}", e);
                return self.state();
            }
        };

        let next = if !evaluated.is_stable() {
            evaluated
        } else if unauthorized {
            login_state(&session)
        } else {
            self.verify(&session, evaluated).await
        };
        self.set_state_for(Some(generation), next);
        self.state()
    }

    fn evaluate(&self, session: &SessionSnapshot) -> StorageResult<StartupState> {
        if session.email.is_none() || session.back_from_verification {
            return Ok(StartupState::Welcome);
        }
        if !session.has_token {
            return Ok(StartupState::Validate);
        }

        let store = &self.inner.store;
        if store.count(EntityKind::Territory)? > 0 {
            return Ok(StartupState::Ready);
        }
        if store.last_full_sync()?.is_none() {
            return Ok(StartupState::Loading);
        }
        if session.admin || store.count(EntityKind::PhoneTerritory)? > 0 {
            return Ok(StartupState::Ready);
        }
        Ok(StartupState::Empty)
    }

    async fn verify(&self, session: &SessionSnapshot, current: StartupState) -> StartupState {
        match self.inner.credentials.verify().await {
            Ok(CredentialCheck::Valid) => current,
            Ok(CredentialCheck::UserLoginRequired) => login_state(session),
            Ok(CredentialCheck::AdminLoginRequired) => StartupState::AdminLogin,
            Ok(CredentialCheck::PhoneLoginRequired) if !session.admin => StartupState::PhoneLogin,
            Ok(CredentialCheck::PhoneLoginRequired) => current,
            Err(e) => {
                debug!("Credential check unavailable: {}", e);
                current
            }
        }
    }

    /// Run one full sync pass unless one is already running
    pub async fn synchronize(&self) -> SyncResult<SyncOutcome> {
        let Ok(_guard) = self.inner.sync_lock.try_lock() else {
            debug!("Sync already running; request coalesced");
            return Ok(SyncOutcome::Coalesced);
        };
        if !self.inner.sync_enabled {
            return Ok(SyncOutcome::Skipped);
        }
        let session = self.inner.credentials.session();
        if !session.is_authenticated() {
            debug!("Not signed in; skipping sync");
            return Ok(SyncOutcome::Skipped);
        }

        info!("Sync started");
        let generation = self.generation();
        self.emit(SyncEvent::SyncStarted);
        if self.inner.store.count(EntityKind::Territory)? == 0 {
            self.set_state(StartupState::Loading);
        }

        match self.run_pass(generation, session).await {
            Ok(summary) => {
                info!(
                    "Sync completed: {} uploaded, {} change(s) applied",
                    summary.uploaded, summary.changed
                );
                self.emit(SyncEvent::SyncCompleted(summary.clone()));
                Ok(SyncOutcome::Completed(summary))
            }
            Err(SyncError::Cancelled) => {
                info!("Signed out during sync; results discarded");
                Err(SyncError::Cancelled)
            }
            Err(e) => {
                warn!("Sync failed: {}", e);
                self.emit(SyncEvent::SyncFailed(e.to_string()));
                Err(e)
            }
        }
    }

    fn ensure_session(&self, generation: u64) -> SyncResult<()> {
        if self.generation() == generation {
            Ok(())
        } else {
            Err(SyncError::Cancelled)
        }
    }

    async fn run_pass(
        &self,
        generation: u64,
        mut session: SessionSnapshot,
    ) -> SyncResult<SyncSummary> {
        let inner = &self.inner;
        let upload = inner.uploader.flush().await?;
        self.ensure_session(generation)?;
        for rejection in &upload.rejected {
            self.emit(SyncEvent::ChangeRejected {
                kind: rejection.change.kind,
                target: rejection.change.target.clone(),
                message: rejection.message.clone(),
            });
        }
        if upload.unauthorized {
            return Err(SyncError::Unauthorized);
        }

        let mut restarted = false;
        let (territories, phone, tokens, recalls) = loop {
            let fetched = tokio::join!(
                inner.remote.fetch_territories(),
                inner.remote.fetch_phone(),
                inner.remote.fetch_tokens(),
                inner.remote.fetch_recalls(),
            );

            // Admin or phone sign-in while fetching changes what the server returns
            let now = inner.credentials.session();
            if !restarted && (now.admin != session.admin || now.phone != session.phone) {
                info!("Credentials changed during sync; fetching again");
                restarted = true;
                session = now;
                self.emit(SyncEvent::SessionChanged);
                continue;
            }
            break fetched;
        };

        let mut errors = Vec::new();
        let snapshot = FullSnapshot {
            territories: keep(territories, "territories", &mut errors),
            phone: keep(phone, "phone territories", &mut errors),
            tokens: keep(tokens, "keys", &mut errors),
            recalls: keep(recalls, "recalls", &mut errors),
        };
        if errors.iter().any(|e| matches!(e, RemoteError::Unauthorized)) {
            return Err(SyncError::Unauthorized);
        }

        // sign_out waits on the sync lock, so nothing can clear the cache
        // between this check and the end of the pass
        self.ensure_session(generation)?;
        let reconciler = inner.reconciler.clone();
        let report =
            tokio::task::spawn_blocking(move || reconciler.reconcile(&snapshot)).await??;
        if errors.is_empty() && report.is_complete() {
            inner.store.set_last_full_sync(Utc::now())?;
        }

        if let Some(e) = errors.into_iter().next() {
            return Err(e.into());
        }
        if let Some(failure) = report.failures.first() {
            return Err(SyncError::Reconciliation {
                kind: failure.kind,
                reason: failure.reason.clone(),
            });
        }

        Ok(SyncSummary {
            uploaded: upload.confirmed,
            retained: upload.retained,
            rejected: upload.rejected.len(),
            changed: report.changed(),
        })
    }
}

fn login_state(session: &SessionSnapshot) -> StartupState {
    if session.email.is_some() {
        StartupState::Login
    } else {
        StartupState::Welcome
    }
}

/// Keep a fetched part, or record why it is missing
fn keep<T>(result: RemoteResult<T>, what: &str, errors: &mut Vec<RemoteError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Could not fetch {}: {}", what, e);
            errors.push(e);
            None
        }
    }
}

#[async_trait]
impl FullSyncTrigger for SyncManager {
    async fn request_full_sync(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.startup_process(true).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::SessionConfig;
    use crate::models::PhoneTerritory;
    use crate::pending::LocalMutations;
    use crate::reconcile::{PhoneSnapshot, TerritorySnapshot};
    use crate::sync::credentials::StaticCredentials;
    use crate::testing::{address, house, territory, Failure, FakeRemote};

    struct Harness {
        store: LocalStore,
        remote: Arc<FakeRemote>,
        credentials: Arc<StaticCredentials>,
        manager: SyncManager,
    }

    fn signed_in() -> SessionConfig {
        SessionConfig {
            user_email: Some("ann@example.com".into()),
            access_token: Some("token".into()),
            ..SessionConfig::default()
        }
    }

    fn harness(session: SessionConfig) -> Harness {
        let store = LocalStore::open_in_memory().unwrap();
        let remote = Arc::new(FakeRemote::new());
        let credentials = Arc::new(StaticCredentials::new(session));
        let manager = SyncManager::new(store.clone(), remote.clone(), credentials.clone(), 4, true);
        Harness {
            store,
            remote,
            credentials,
            manager,
        }
    }

    fn one_territory() -> TerritorySnapshot {
        TerritorySnapshot {
            territories: vec![territory("t1")],
            addresses: vec![address("a1", "t1")],
            houses: vec![house("h1", "a1")],
            visits: vec![],
        }
    }

    #[tokio::test]
    async fn test_no_territories_after_sync_is_empty() {
        let h = harness(signed_in());
        let state = h.manager.startup_process(true).await;
        assert_eq!(state, StartupState::Empty);
        assert!(h.manager.last_full_sync().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_with_data_is_ready() {
        let h = harness(signed_in());
        h.remote.set_territories(one_territory());

        let state = h.manager.startup_process(true).await;

        assert_eq!(state, StartupState::Ready);
        assert_eq!(h.store.count(EntityKind::House).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_signed_out_states() {
        let h = harness(SessionConfig::default());
        assert_eq!(h.manager.startup_process(true).await, StartupState::Welcome);
        assert_eq!(h.remote.snapshot_fetches(), 0);

        h.credentials.update(SessionConfig {
            access_token: None,
            ..signed_in()
        });
        assert_eq!(h.manager.startup_process(false).await, StartupState::Validate);

        h.credentials.update(signed_in());
        h.credentials.set_back_from_verification(true);
        assert_eq!(h.manager.startup_process(false).await, StartupState::Welcome);
    }

    #[tokio::test]
    async fn test_not_yet_synced_is_loading() {
        let h = harness(signed_in());
        assert_eq!(h.manager.startup_process(false).await, StartupState::Loading);
    }

    #[tokio::test]
    async fn test_offline_keeps_ready() {
        let h = harness(signed_in());
        h.remote.set_territories(one_territory());
        assert_eq!(h.manager.startup_process(true).await, StartupState::Ready);

        let mut events = h.manager.subscribe_events();
        h.remote.fail_fetches(Some(Failure::Offline));
        let state = h.manager.startup_process(true).await;

        assert_eq!(state, StartupState::Ready);
        assert_eq!(h.store.count(EntityKind::Territory).unwrap(), 1);
        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            failed |= matches!(event, SyncEvent::SyncFailed(_));
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_admin_or_phone_data_is_ready_without_territories() {
        let h = harness(SessionConfig {
            congregation: Some("c1".into()),
            congregation_pass: Some("secret".into()),
            ..signed_in()
        });
        assert_eq!(h.manager.startup_process(true).await, StartupState::Ready);

        let h = harness(signed_in());
        h.remote.set_phone(PhoneSnapshot {
            territories: vec![PhoneTerritory {
                id: "p1".into(),
                congregation: "c1".into(),
                number: 1,
                description: "Phones".into(),
                image: None,
            }],
            ..Default::default()
        });
        assert_eq!(h.manager.startup_process(true).await, StartupState::Ready);
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let h = harness(signed_in());
        h.remote.set_territories(one_territory());

        h.credentials.set_check(CredentialCheck::UserLoginRequired);
        assert_eq!(h.manager.startup_process(true).await, StartupState::Login);

        h.credentials.set_check(CredentialCheck::AdminLoginRequired);
        assert_eq!(h.manager.startup_process(false).await, StartupState::AdminLogin);

        h.credentials.set_check(CredentialCheck::PhoneLoginRequired);
        assert_eq!(h.manager.startup_process(false).await, StartupState::PhoneLogin);
    }

    #[tokio::test]
    async fn test_unauthorized_upload_requires_login() {
        let h = harness(signed_in());
        h.remote.set_territories(one_territory());
        h.manager.startup_process(true).await;

        LocalMutations::new(h.store.clone())
            .add(&territory("t2"))
            .unwrap();
        h.remote.fail_push(RecordKey::id("t2"), Failure::Unauthorized);

        assert_eq!(h.manager.startup_process(true).await, StartupState::Login);
        assert_eq!(h.manager.pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_coalesced() {
        let h = harness(signed_in());
        h.remote.set_delay(Duration::from_millis(100));

        let (first, second) = tokio::join!(h.manager.synchronize(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.manager.synchronize().await
        });

        assert!(matches!(first.unwrap(), SyncOutcome::Completed(_)));
        assert_eq!(second.unwrap(), SyncOutcome::Coalesced);
        assert_eq!(h.remote.snapshot_fetches(), 4);
    }

    #[tokio::test]
    async fn test_credential_change_restarts_fetch() {
        let h = harness(signed_in());
        h.remote.set_delay(Duration::from_millis(100));

        let (result, _) = tokio::join!(h.manager.synchronize(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.credentials.update(SessionConfig {
                phone_token: Some("phone".into()),
                ..signed_in()
            });
        });

        assert!(matches!(result.unwrap(), SyncOutcome::Completed(_)));
        assert_eq!(h.remote.snapshot_fetches(), 8);
    }

    #[tokio::test]
    async fn test_pending_changes_upload_before_fetch() {
        let h = harness(signed_in());
        h.remote.set_territories(one_territory());
        h.manager.startup_process(true).await;

        LocalMutations::new(h.store.clone())
            .add(&house("h2", "a1"))
            .unwrap();
        let outcome = h.manager.synchronize().await.unwrap();

        match outcome {
            SyncOutcome::Completed(summary) => assert_eq!(summary.uploaded, 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(h.manager.pending_count().unwrap(), 0);
        assert_eq!(h.remote.pushed().len(), 1);
        // The fake server never learned about h2, so the snapshot prunes it
        assert_eq!(h.store.count(EntityKind::House).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_kind_does_not_mark_sync_time() {
        let h = harness(signed_in());
        h.remote.set_territories(TerritorySnapshot {
            territories: vec![territory("t1")],
            addresses: vec![address("a1", "missing")],
            ..Default::default()
        });

        let result = h.manager.synchronize().await;

        assert!(matches!(result, Err(SyncError::Reconciliation { .. })));
        assert!(h.manager.last_full_sync().unwrap().is_none());
        assert_eq!(h.store.count(EntityKind::Territory).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sign_out_discards_running_pass() {
        let h = harness(signed_in());
        h.remote.set_territories(one_territory());
        h.remote.set_delay(Duration::from_millis(100));

        let manager = h.manager.clone();
        let pass = tokio::spawn(async move { manager.startup_process(true).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.manager.sign_out().await.unwrap();
        pass.await.unwrap();

        assert_eq!(h.manager.state(), StartupState::Welcome);
        assert_eq!(h.store.count(EntityKind::Territory).unwrap(), 0);
        assert!(h.manager.last_full_sync().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_credential_change_is_announced() {
        let h = harness(signed_in());
        h.remote.set_delay(Duration::from_millis(100));
        let mut events = h.manager.subscribe_events();

        let (result, _) = tokio::join!(h.manager.synchronize(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.credentials.update(SessionConfig {
                congregation: Some("c1".into()),
                congregation_pass: Some("secret".into()),
                ..signed_in()
            });
        });

        assert!(result.is_ok());
        let mut announced = false;
        while let Ok(event) = events.try_recv() {
            announced |= event == SyncEvent::SessionChanged;
        }
        assert!(announced);
    }

    #[tokio::test]
    async fn test_state_changes_are_broadcast() {
        let h = harness(signed_in());
        let mut states = h.manager.subscribe_state();

        h.manager.startup_process(true).await;

        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), StartupState::Empty);
        h.manager.reset();
        assert_eq!(h.manager.state(), StartupState::Welcome);
    }
}
