mod common;

use std::sync::Arc;

use common::{scenario_a, signed_in, visit, ScriptedServer};
use servicemaps_core::query::{HouseList, TerritoryOverview};
use servicemaps_core::reconcile::TerritorySnapshot;
use servicemaps_core::sync::StaticCredentials;
use servicemaps_core::{Config, Engine, EntityKind, LocalStore, StartupState, SyncManager};

fn manager(store: &LocalStore, server: &Arc<ScriptedServer>) -> SyncManager {
    SyncManager::new(
        store.clone(),
        server.clone(),
        Arc::new(StaticCredentials::new(signed_in())),
        4,
        true,
    )
}

#[tokio::test]
async fn scenario_c_no_territories_is_empty() {
    let store = LocalStore::open_in_memory().unwrap();
    let server = ScriptedServer::new();
    server.serve(TerritorySnapshot::default());

    let state = manager(&store, &server).startup_process(true).await;

    assert_eq!(state, StartupState::Empty);
    assert!(store.last_full_sync().unwrap().is_some());
}

#[tokio::test]
async fn territories_make_the_app_ready() {
    let store = LocalStore::open_in_memory().unwrap();
    let server = ScriptedServer::new();
    server.serve(scenario_a());

    let state = manager(&store, &server).startup_process(true).await;

    assert_eq!(state, StartupState::Ready);
    assert_eq!(store.count(EntityKind::House).unwrap(), 1);
}

#[tokio::test]
async fn offline_start_uses_cached_data() {
    let store = LocalStore::open_in_memory().unwrap();
    let server = ScriptedServer::new();
    server.serve(scenario_a());
    let manager = manager(&store, &server);
    manager.startup_process(true).await;
    let synced_at = store.last_full_sync().unwrap();

    server.set_offline(true);
    let state = manager.startup_process(true).await;

    assert_eq!(state, StartupState::Ready);
    assert_eq!(store.count(EntityKind::Territory).unwrap(), 1);
    assert_eq!(store.last_full_sync().unwrap(), synced_at);
}

#[tokio::test]
async fn recorded_visit_reaches_server_and_views() {
    let server = ScriptedServer::new();
    server.serve(scenario_a());
    let engine = Engine::with_store(
        Config::default(),
        LocalStore::open_in_memory().unwrap(),
        server.clone(),
        None,
        Arc::new(StaticCredentials::new(signed_in())),
    );
    assert_eq!(engine.foreground().await, StartupState::Ready);

    let mut houses = engine.queries().subscribe(HouseList {
        address: "A1".into(),
    });
    assert!(houses.next().await.unwrap()[0].last_visit.is_none());

    engine.mutations().add(&visit("H1", 42)).unwrap();
    let rows = houses.next().await.unwrap();
    assert_eq!(rows[0].last_visit.as_ref().unwrap().date, 42);

    // The server now knows about the visit too
    let mut served = scenario_a();
    served.visits.push(visit("H1", 42));
    server.serve(served);
    engine.foreground().await;

    assert_eq!(server.pushed().len(), 1);
    assert_eq!(engine.queue().count().unwrap(), 0);
    let overview = engine.queries().query(&TerritoryOverview).unwrap();
    assert_eq!(overview[0].last_visit, Some(42));
}
