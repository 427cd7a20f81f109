//! Service container
//!
//! Wires the store, the sync manager, the realtime notifier and the query
//! hub together for one signed-in device. Nothing is global; every
//! collaborator is owned here and handed out by reference.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rusqlite::OptionalExtension;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::pending::{LocalMutations, PendingQueue};
use crate::query::QueryHub;
use crate::realtime::{
    FullSyncTrigger, NotifierSettings, RealtimeChannel, RealtimeNotifier, RealtimeScope,
    WebSocketChannel,
};
use crate::remote::{HttpRemote, RemoteApi};
use crate::storage::{LocalStore, StorageResult};
use crate::sync::{CredentialProvider, StartupState, StaticCredentials, SyncEvent, SyncManager};

/// Works out which congregation the realtime listener should follow
#[derive(Clone)]
struct ScopeSource {
    credentials: Arc<dyn CredentialProvider>,
    store: LocalStore,
}

impl ScopeSource {
    /// Scope from the credentials, else the congregation of the cached
    /// territories
    fn scope(&self) -> Option<RealtimeScope> {
        if let Some(scope) = self.credentials.realtime_scope() {
            return Some(scope);
        }

        let session = self.credentials.session();
        let congregation = self
            .store
            .read(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT congregation FROM territories
                         WHERE congregation != '' AND congregation != '0'
                         LIMIT 1",
                        [],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?)
            })
            .ok()
            .flatten()?;

        Some(RealtimeScope {
            congregation,
            user: session.email,
            admin: session.admin,
        })
    }
}

async fn rescope(notifier: &RealtimeNotifier, scopes: &ScopeSource) {
    match scopes.scope() {
        Some(scope) => notifier.set_scope(scope).await,
        None => debug!("No congregation known; realtime scope unchanged"),
    }
}

pub struct Engine {
    config: Config,
    store: LocalStore,
    queue: PendingQueue,
    mutations: LocalMutations,
    queries: QueryHub,
    manager: SyncManager,
    notifier: Option<Arc<RealtimeNotifier>>,
    scopes: ScopeSource,
    /// Re-scopes the notifier when the manager reports new credentials
    session_follower: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open the store named by `config` and build everything around it
    pub fn new(
        config: Config,
        remote: Arc<dyn RemoteApi>,
        channel: Option<Arc<dyn RealtimeChannel>>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> StorageResult<Self> {
        let store = LocalStore::open(&config)?;
        Ok(Self::with_store(config, store, remote, channel, credentials))
    }

    pub fn with_store(
        config: Config,
        store: LocalStore,
        remote: Arc<dyn RemoteApi>,
        channel: Option<Arc<dyn RealtimeChannel>>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let manager = SyncManager::new(
            store.clone(),
            remote.clone(),
            credentials.clone(),
            config.upload_concurrency,
            config.sync_enabled,
        );
        let notifier = channel.map(|channel| {
            let trigger: Arc<dyn FullSyncTrigger> = Arc::new(manager.clone());
            Arc::new(RealtimeNotifier::new(
                channel,
                remote,
                store.clone(),
                trigger,
                NotifierSettings::from(&config),
            ))
        });

        Self {
            queue: PendingQueue::new(store.clone()),
            mutations: LocalMutations::new(store.clone()),
            queries: QueryHub::new(store.clone()),
            scopes: ScopeSource {
                credentials,
                store: store.clone(),
            },
            config,
            store,
            manager,
            notifier,
            session_follower: Mutex::new(None),
        }
    }

    /// HTTP remote, WebSocket push when `realtime_url` is set, and the
    /// `[session]` credentials from the config file
    pub fn from_config(config: Config) -> Result<Self> {
        let remote = HttpRemote::new(&config).context("Failed to set up the server connection")?;
        let channel = config
            .realtime_url
            .as_ref()
            .map(|url| Arc::new(WebSocketChannel::new(url.clone())) as Arc<dyn RealtimeChannel>);
        let credentials = Arc::new(StaticCredentials::from_session(config.session.as_ref()));

        Self::new(config, Arc::new(remote), channel, credentials)
            .context("Failed to open the local database")
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn mutations(&self) -> &LocalMutations {
        &self.mutations
    }

    pub fn queries(&self) -> &QueryHub {
        &self.queries
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    pub fn notifier(&self) -> Option<&RealtimeNotifier> {
        self.notifier.as_deref()
    }

    pub fn state(&self) -> StartupState {
        self.manager.state()
    }

    /// App came to the foreground: sync, then listen for pushes
    pub async fn foreground(&self) -> StartupState {
        let state = self.manager.startup_process(true).await;

        if let Some(notifier) = &self.notifier {
            if !self.config.sync_enabled || !state.is_stable() {
                debug!("Realtime listener not started in state {}", state);
            } else if let Some(scope) = self.scopes.scope() {
                notifier.start(scope).await;
                self.follow_session(notifier);
            } else {
                debug!("No congregation known; realtime listener not started");
            }
        }
        state
    }

    /// Credentials changed outside a sync pass (sign-in, congregation
    /// switch, admin mode): resubscribe with the new scope
    pub async fn session_changed(&self) {
        if let Some(notifier) = &self.notifier {
            rescope(notifier, &self.scopes).await;
        }
    }

    fn follow_session(&self, notifier: &Arc<RealtimeNotifier>) {
        let Ok(mut follower) = self.session_follower.lock() else {
            return;
        };
        if follower.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let mut events = self.manager.subscribe_events();
        let notifier = notifier.clone();
        let scopes = self.scopes.clone();
        *follower = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SyncEvent::SessionChanged) | Err(RecvError::Lagged(_)) => {
                        rescope(&notifier, &scopes).await
                    }
                    Ok(_) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    fn stop_following(&self) {
        if let Ok(mut follower) = self.session_follower.lock() {
            if let Some(task) = follower.take() {
                task.abort();
            }
        }
    }

    /// App went to the background: drop the push connection
    pub async fn background(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.pause().await;
        }
    }

    /// Sign out: stop listening, cancel any running sync, then forget every
    /// cached row and change
    pub async fn logout(&self) -> StorageResult<()> {
        self.stop_following();
        if let Some(notifier) = &self.notifier {
            notifier.stop().await;
        }
        self.manager.sign_out().await?;
        info!("Signed out; local cache cleared");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.stop_following();
        if let Some(notifier) = &self.notifier {
            notifier.stop().await;
        }
        debug!("Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_following();
    }
}
