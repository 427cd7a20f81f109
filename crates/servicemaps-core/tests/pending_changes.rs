mod common;

use common::{house, scenario_a, visit, ScriptedServer};
use servicemaps_core::reconcile::TerritorySnapshot;
use servicemaps_core::{
    ChangeAction, EnqueueOutcome, EntityKind, FullSnapshot, House, LocalMutations, LocalStore,
    PendingQueue, Reconciler, RecordKey, Uploader,
};
use tempfile::TempDir;

fn synced_store() -> LocalStore {
    let store = LocalStore::open_in_memory().unwrap();
    Reconciler::new(store.clone())
        .reconcile(&FullSnapshot {
            territories: Some(scenario_a()),
            ..FullSnapshot::default()
        })
        .unwrap();
    store
}

fn without_everything() -> FullSnapshot {
    FullSnapshot {
        territories: Some(TerritorySnapshot::default()),
        ..FullSnapshot::default()
    }
}

#[tokio::test]
async fn queued_change_survives_restart_and_is_retried() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("servicemaps.db");
    let server = ScriptedServer::new();

    {
        let store = LocalStore::open_at(&path).unwrap();
        Reconciler::new(store.clone())
            .reconcile(&FullSnapshot {
                territories: Some(scenario_a()),
                ..FullSnapshot::default()
            })
            .unwrap();
        LocalMutations::new(store.clone())
            .add(&visit("H1", 1_700_000_000_000))
            .unwrap();

        // Upload attempt dies on the network before the restart
        server.set_offline(true);
        let report = Uploader::new(PendingQueue::new(store.clone()), server.clone(), 4)
            .flush()
            .await
            .unwrap();
        assert_eq!(report.retained, 1);
    }

    let store = LocalStore::open_at(&path).unwrap();
    let queue = PendingQueue::new(store.clone());
    assert_eq!(queue.count().unwrap(), 1);

    server.set_offline(false);
    let report = Uploader::new(queue.clone(), server.clone(), 4)
        .flush()
        .await
        .unwrap();

    assert_eq!(report.confirmed, 1);
    assert_eq!(queue.count().unwrap(), 0);
    assert_eq!(server.pushed()[0].target, RecordKey::id("H1-1700000000000"));
}

#[test]
fn repeated_updates_collapse_to_latest() {
    let store = synced_store();
    let mutations = LocalMutations::new(store.clone());
    let queue = PendingQueue::new(store);

    let mut edited = house("H1", "A1");
    edited.number = "2".into();
    mutations.update(&edited).unwrap();
    edited.number = "3".into();
    let outcome = mutations.update(&edited).unwrap();

    assert!(matches!(outcome, EnqueueOutcome::Collapsed(_)));
    let queued = queue.list().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].payload.as_ref().unwrap()["number"], "3");
}

#[test]
fn queued_delete_stays_authoritative() {
    let store = synced_store();
    let mutations = LocalMutations::new(store.clone());
    let queue = PendingQueue::new(store.clone());
    let key = RecordKey::id("H1");

    mutations.delete(EntityKind::House, &key).unwrap();
    let mut edited = house("H1", "A1");
    edited.number = "9".into();
    let outcome = mutations.update(&edited).unwrap();

    assert!(matches!(outcome, EnqueueOutcome::Ignored(_)));
    let queued = queue.list().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].action, ChangeAction::Delete);
    assert_eq!(store.get::<House>(&key).unwrap().unwrap().number, "1");
}

#[tokio::test]
async fn pending_update_keeps_row_until_resolved() {
    let store = synced_store();
    let reconciler = Reconciler::new(store.clone());
    let queue = PendingQueue::new(store.clone());
    let server = ScriptedServer::new();
    let key = RecordKey::id("H1");

    let mut edited = house("H1", "A1");
    edited.number = "12".into();
    LocalMutations::new(store.clone()).update(&edited).unwrap();

    let report = reconciler.reconcile(&without_everything()).unwrap();
    assert_eq!(report.get(EntityKind::House).preserved, 1);
    assert_eq!(store.get::<House>(&key).unwrap().unwrap().number, "12");

    Uploader::new(queue.clone(), server, 4).flush().await.unwrap();
    assert_eq!(queue.count().unwrap(), 0);

    reconciler.reconcile(&without_everything()).unwrap();
    assert!(store.get::<House>(&key).unwrap().is_none());
}

#[tokio::test]
async fn scenario_b_pending_delete_keeps_territory_until_confirmed() {
    let store = synced_store();
    let reconciler = Reconciler::new(store.clone());
    let queue = PendingQueue::new(store.clone());
    let server = ScriptedServer::new();

    LocalMutations::new(store.clone())
        .delete(EntityKind::Territory, &RecordKey::id("T1"))
        .unwrap();

    reconciler.reconcile(&without_everything()).unwrap();
    assert_eq!(store.count(EntityKind::Territory).unwrap(), 1);

    let report = Uploader::new(queue.clone(), server.clone(), 4)
        .flush()
        .await
        .unwrap();

    assert_eq!(report.confirmed, 1);
    assert_eq!(server.pushed()[0].action, ChangeAction::Delete);
    assert_eq!(store.count(EntityKind::Territory).unwrap(), 0);
    assert_eq!(store.count(EntityKind::House).unwrap(), 0);
}

#[test]
fn unsent_add_then_delete_leaves_nothing() {
    let store = synced_store();
    let mutations = LocalMutations::new(store.clone());
    let queue = PendingQueue::new(store.clone());
    let fresh = house("H9", "A1");

    mutations.add(&fresh).unwrap();
    mutations.add(&visit("H9", 10)).unwrap();
    let outcome = mutations
        .delete(EntityKind::House, &RecordKey::id("H9"))
        .unwrap();

    assert_eq!(outcome, EnqueueOutcome::Cancelled);
    assert_eq!(queue.count().unwrap(), 0);
    assert!(store.get::<House>(&RecordKey::id("H9")).unwrap().is_none());
}

