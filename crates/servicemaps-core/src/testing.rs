//! In-memory collaborators for unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{mpsc, Notify};

use crate::models::{AnyRecord, EntityKind, House, Recall, RecordKey, Territory, TerritoryAddress};
use crate::pending::PendingChange;
use crate::realtime::{
    ChangeEvent, EventStream, FullSyncTrigger, RealtimeChannel, RealtimeError, RealtimeScope,
};
use crate::reconcile::{PhoneSnapshot, TerritorySnapshot, TokenSnapshot};
use crate::remote::{RemoteApi, RemoteError, RemoteResult};

#[derive(Debug, Clone)]
pub(crate) enum Failure {
    Offline,
    Reject(String),
    Unauthorized,
}

impl Failure {
    fn error(&self) -> RemoteError {
        match self {
            Failure::Offline => RemoteError::Transport("connection refused".into()),
            Failure::Reject(message) => RemoteError::Rejected {
                status: 422,
                message: message.clone(),
            },
            Failure::Unauthorized => RemoteError::Unauthorized,
        }
    }
}

#[derive(Default)]
struct FakeState {
    territories: TerritorySnapshot,
    phone: PhoneSnapshot,
    tokens: TokenSnapshot,
    recalls: Vec<Recall>,
    entities: HashMap<(EntityKind, RecordKey), AnyRecord>,
    fetch_failure: Option<Failure>,
    push_failures: HashMap<RecordKey, Failure>,
    pushed: Vec<PendingChange>,
    snapshot_fetches: usize,
    entity_fetches: usize,
    delay: Option<Duration>,
    push_gate: Option<Arc<Notify>>,
    pushes_started: usize,
}

#[derive(Default)]
pub(crate) struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_territories(&self, snapshot: TerritorySnapshot) {
        self.state.lock().unwrap().territories = snapshot;
    }

    pub fn set_phone(&self, snapshot: PhoneSnapshot) {
        self.state.lock().unwrap().phone = snapshot;
    }

    pub fn put_entity(&self, record: AnyRecord) {
        let key = (record.kind(), record.key());
        self.state.lock().unwrap().entities.insert(key, record);
    }

    pub fn fail_fetches(&self, failure: Option<Failure>) {
        self.state.lock().unwrap().fetch_failure = failure;
    }

    pub fn fail_push(&self, key: RecordKey, failure: Failure) {
        self.state.lock().unwrap().push_failures.insert(key, failure);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    /// Make each push wait for a permit on the returned gate
    pub fn hold_pushes(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().push_gate = Some(gate.clone());
        gate
    }

    pub fn pushes_started(&self) -> usize {
        self.state.lock().unwrap().pushes_started
    }

    pub fn pushed(&self) -> Vec<PendingChange> {
        self.state.lock().unwrap().pushed.clone()
    }

    pub fn snapshot_fetches(&self) -> usize {
        self.state.lock().unwrap().snapshot_fetches
    }

    pub fn entity_fetches(&self) -> usize {
        self.state.lock().unwrap().entity_fetches
    }

    async fn pause(&self) {
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn snapshot<T: Clone>(&self, pick: impl FnOnce(&FakeState) -> T) -> RemoteResult<T> {
        let mut state = self.state.lock().unwrap();
        state.snapshot_fetches += 1;
        match &state.fetch_failure {
            Some(failure) => Err(failure.error()),
            None => Ok(pick(&*state)),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn fetch_territories(&self) -> RemoteResult<TerritorySnapshot> {
        self.pause().await;
        self.snapshot(|s| s.territories.clone())
    }

    async fn fetch_phone(&self) -> RemoteResult<PhoneSnapshot> {
        self.pause().await;
        self.snapshot(|s| s.phone.clone())
    }

    async fn fetch_tokens(&self) -> RemoteResult<TokenSnapshot> {
        self.pause().await;
        self.snapshot(|s| s.tokens.clone())
    }

    async fn fetch_recalls(&self) -> RemoteResult<Vec<Recall>> {
        self.pause().await;
        self.snapshot(|s| s.recalls.clone())
    }

    async fn fetch_entity(
        &self,
        kind: EntityKind,
        key: &RecordKey,
    ) -> RemoteResult<Option<AnyRecord>> {
        let mut state = self.state.lock().unwrap();
        state.entity_fetches += 1;
        if let Some(failure) = &state.fetch_failure {
            return Err(failure.error());
        }
        Ok(state.entities.get(&(kind, key.clone())).cloned())
    }

    async fn push(&self, change: &PendingChange) -> RemoteResult<()> {
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.pushes_started += 1;
            state.push_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.push_failures.get(&change.target) {
            return Err(failure.error());
        }
        state.pushed.push(change.clone());
        Ok(())
    }
}

type EventSender = mpsc::UnboundedSender<Result<ChangeEvent, RealtimeError>>;

/// Push channel fed by the test; each subscription gets its own stream
#[derive(Default)]
pub(crate) struct FakeChannel {
    senders: Mutex<Vec<EventSender>>,
    scopes: Mutex<Vec<RealtimeScope>>,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriptions(&self) -> usize {
        self.scopes.lock().unwrap().len()
    }

    pub fn scopes(&self) -> Vec<RealtimeScope> {
        self.scopes.lock().unwrap().clone()
    }

    /// Deliver to the newest subscription
    pub fn send(&self, event: ChangeEvent) {
        if let Some(tx) = self.senders.lock().unwrap().last() {
            let _ = tx.send(Ok(event));
        }
    }

    /// End every open stream
    pub fn disconnect(&self) {
        self.senders.lock().unwrap().clear();
    }
}

#[async_trait]
impl RealtimeChannel for FakeChannel {
    async fn subscribe(&self, scope: &RealtimeScope) -> Result<EventStream, RealtimeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        self.scopes.lock().unwrap().push(scope.clone());
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

#[derive(Default)]
pub(crate) struct FakeTrigger {
    requests: AtomicUsize,
}

impl FakeTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FullSyncTrigger for FakeTrigger {
    async fn request_full_sync(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) fn territory(id: &str) -> Territory {
    Territory {
        id: id.into(),
        congregation: "c1".into(),
        number: 1,
        description: format!("Territory {}", id),
        image: None,
    }
}

pub(crate) fn address(id: &str, territory: &str) -> TerritoryAddress {
    TerritoryAddress {
        id: id.into(),
        territory: territory.into(),
        address: format!("{} Main St", id),
        floors: None,
    }
}

pub(crate) fn house(id: &str, address: &str) -> House {
    House {
        id: id.into(),
        territory_address: address.into(),
        number: "1".into(),
        floor: None,
    }
}
