//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use servicemaps_core::reconcile::{PhoneSnapshot, TerritorySnapshot, TokenSnapshot};
use servicemaps_core::remote::RemoteResult;
use servicemaps_core::{
    AnyRecord, EntityKind, House, PendingChange, Recall, RecordKey, RemoteApi, RemoteError,
    SessionConfig, Territory, TerritoryAddress, Visit, VisitSymbol,
};

/// A server that serves whatever snapshot the test last set
#[derive(Default)]
pub struct ScriptedServer {
    territories: Mutex<TerritorySnapshot>,
    pushed: Mutex<Vec<PendingChange>>,
    offline: AtomicBool,
}

impl ScriptedServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, snapshot: TerritorySnapshot) {
        *self.territories.lock().unwrap() = snapshot;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn pushed(&self) -> Vec<PendingChange> {
        self.pushed.lock().unwrap().clone()
    }

    fn reachable(&self) -> RemoteResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RemoteError::Transport("network unreachable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteApi for ScriptedServer {
    async fn fetch_territories(&self) -> RemoteResult<TerritorySnapshot> {
        self.reachable()?;
        Ok(self.territories.lock().unwrap().clone())
    }

    async fn fetch_phone(&self) -> RemoteResult<PhoneSnapshot> {
        self.reachable()?;
        Ok(PhoneSnapshot::default())
    }

    async fn fetch_tokens(&self) -> RemoteResult<TokenSnapshot> {
        self.reachable()?;
        Ok(TokenSnapshot::default())
    }

    async fn fetch_recalls(&self) -> RemoteResult<Vec<Recall>> {
        self.reachable()?;
        Ok(Vec::new())
    }

    async fn fetch_entity(
        &self,
        _kind: EntityKind,
        _key: &RecordKey,
    ) -> RemoteResult<Option<AnyRecord>> {
        self.reachable()?;
        Ok(None)
    }

    async fn push(&self, change: &PendingChange) -> RemoteResult<()> {
        self.reachable()?;
        self.pushed.lock().unwrap().push(change.clone());
        Ok(())
    }
}

pub fn signed_in() -> SessionConfig {
    SessionConfig {
        user_email: Some("ann@example.com".into()),
        access_token: Some("token".into()),
        congregation: Some("c1".into()),
        ..SessionConfig::default()
    }
}

pub fn territory(id: &str) -> Territory {
    Territory {
        id: id.into(),
        congregation: "c1".into(),
        number: 1,
        description: format!("Territory {}", id),
        image: None,
    }
}

pub fn address(id: &str, territory: &str) -> TerritoryAddress {
    TerritoryAddress {
        id: id.into(),
        territory: territory.into(),
        address: format!("{} Elm St", id),
        floors: None,
    }
}

pub fn house(id: &str, address: &str) -> House {
    House {
        id: id.into(),
        territory_address: address.into(),
        number: "1".into(),
        floor: None,
    }
}

pub fn visit(house: &str, date: i64) -> Visit {
    Visit::new(house, date, VisitSymbol::NC, "", "ann")
}

/// `{territories:[T1], addresses:[A1], houses:[H1], visits:[]}`
pub fn scenario_a() -> TerritorySnapshot {
    TerritorySnapshot {
        territories: vec![territory("T1")],
        addresses: vec![address("A1", "T1")],
        houses: vec![house("H1", "A1")],
        visits: vec![],
    }
}
