//! Pending change queue
//!
//! A write-ahead log of local mutations the server has not confirmed yet.
//! It lives in the same SQLite database as the cache, so an entry is
//! durable as soon as [`PendingQueue::enqueue`] (or the [`LocalMutations`]
//! helper) returns, before any upload for it begins.
//!
//! ## Collapse rules
//!
//! The queue keeps one current intent per entity. A newer change for an
//! entity already queued is folded into the existing entry, which keeps
//! its place in the upload order:
//!
//! | queued   | new      | result                                   |
//! |----------|----------|------------------------------------------|
//! | Add      | Update   | Add with the new payload                 |
//! | Update   | Update   | Update with the new payload              |
//! | Update   | Delete   | Delete                                   |
//! | Add      | Delete   | both dropped, local row removed          |
//! | Delete   | anything | Delete, unchanged                        |
//!
//! An Add whose upload has already started may exist on the server, so a
//! Delete folds into it like any other change instead of cancelling it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::models::{AnyRecord, EntityKind, RecordKey};
use crate::storage::{LocalStore, Record, StorageError, StorageResult, WriteTx};

/// What a pending change does to its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Add,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeAction::Add => "add",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(ChangeAction::Add),
            "update" => Ok(ChangeAction::Update),
            "delete" => Ok(ChangeAction::Delete),
            other => Err(format!("unknown change action '{}'", other)),
        }
    }
}

/// One queued local mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: Uuid,
    pub kind: EntityKind,
    pub action: ChangeAction,
    pub target: RecordKey,
    /// Entity payload as sent to the server
    pub payload: Option<serde_json::Value>,
    /// Position in the queue; later entries have larger values
    pub sequence: i64,
    /// Bumped every time a newer change is folded into this entry
    pub revision: i64,
    /// An upload of this entry has started; the server may have applied it
    pub attempted: bool,
    pub created_at: DateTime<Utc>,
}

impl PendingChange {
    /// Decode the payload into a typed record
    pub fn record(&self) -> StorageResult<Option<AnyRecord>> {
        match &self.payload {
            Some(value) => AnyRecord::from_json(self.kind, value.clone())
                .map(Some)
                .map_err(|source| StorageError::Payload {
                    kind: self.kind,
                    source,
                }),
            None => Ok(None),
        }
    }
}

/// What happened to a change handed to the queue
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// A new entry was appended
    Queued(PendingChange),
    /// An existing entry for the entity absorbed the change
    Collapsed(PendingChange),
    /// A never-uploaded Add was cancelled by a Delete; nothing remains queued
    Cancelled,
    /// A Delete is already queued for the entity
    Ignored(PendingChange),
}

const SELECT_COLUMNS: &str =
    "seq, id, kind, action, target, payload, revision, created_at, attempted";

fn corrupt(details: String) -> StorageError {
    StorageError::CorruptValue {
        table: "pending_changes",
        details,
    }
}

struct PendingRow {
    seq: i64,
    id: String,
    kind: String,
    action: String,
    target: String,
    payload: Option<String>,
    revision: i64,
    created_at: i64,
    attempted: bool,
}

impl PendingRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            kind: row.get(2)?,
            action: row.get(3)?,
            target: row.get(4)?,
            payload: row.get(5)?,
            revision: row.get(6)?,
            created_at: row.get(7)?,
            attempted: row.get(8)?,
        })
    }

    fn hydrate(self) -> StorageResult<PendingChange> {
        let kind: EntityKind = self.kind.parse().map_err(corrupt)?;
        let action: ChangeAction = self.action.parse().map_err(corrupt)?;
        let target = RecordKey::decode(kind, &self.target)
            .ok_or_else(|| corrupt(format!("bad target '{}' for {}", self.target, kind)))?;
        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt(e.to_string()))?;
        let payload = match self.payload {
            Some(text) => Some(
                serde_json::from_str(&text)
                    .map_err(|source| StorageError::Payload { kind, source })?,
            ),
            None => None,
        };
        let created_at = Utc
            .timestamp_millis_opt(self.created_at)
            .single()
            .ok_or_else(|| corrupt(format!("bad timestamp {}", self.created_at)))?;

        Ok(PendingChange {
            id,
            kind,
            action,
            target,
            payload,
            sequence: self.seq,
            revision: self.revision,
            attempted: self.attempted,
            created_at,
        })
    }
}

fn query_changes(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> StorageResult<Vec<PendingChange>> {
    let sql = format!(
        "SELECT {} FROM pending_changes {} ORDER BY seq",
        SELECT_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, PendingRow::from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.hydrate()?);
    }
    Ok(out)
}

/// All queued changes in upload order
pub fn list(conn: &Connection) -> StorageResult<Vec<PendingChange>> {
    query_changes(conn, "", [])
}

/// The queued change for one entity, if any
pub fn find(
    conn: &Connection,
    kind: EntityKind,
    target: &RecordKey,
) -> StorageResult<Option<PendingChange>> {
    let sql = format!(
        "SELECT {} FROM pending_changes WHERE kind = ?1 AND target = ?2",
        SELECT_COLUMNS
    );
    let row = conn
        .query_row(
            &sql,
            params![kind.as_str(), target.encode()],
            PendingRow::from_row,
        )
        .optional()?;
    row.map(PendingRow::hydrate).transpose()
}

pub fn count(conn: &Connection) -> StorageResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM pending_changes", [], |row| row.get(0))?)
}

/// Keys of every entity with an outstanding change, per kind
pub fn pending_keys(conn: &Connection) -> StorageResult<HashMap<EntityKind, HashSet<RecordKey>>> {
    let mut out: HashMap<EntityKind, HashSet<RecordKey>> = HashMap::new();
    for change in list(conn)? {
        out.entry(change.kind).or_default().insert(change.target);
    }
    Ok(out)
}

/// Append `action` for an entity, folding it into any queued entry
pub fn enqueue(
    tx: &mut WriteTx<'_>,
    kind: EntityKind,
    action: ChangeAction,
    target: RecordKey,
    payload: Option<serde_json::Value>,
) -> StorageResult<EnqueueOutcome> {
    if !target.fits(kind) {
        return Err(StorageError::InvalidKey {
            kind,
            key: target.encode(),
        });
    }

    let payload_text = payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|source| StorageError::Payload { kind, source })?;

    let Some(existing) = find(tx.conn(), kind, &target)? else {
        let id = Uuid::new_v4();
        tx.conn().execute(
            "INSERT INTO pending_changes (id, kind, action, target, payload, revision, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                id.to_string(),
                kind.as_str(),
                action.as_str(),
                target.encode(),
                payload_text,
                Utc::now().timestamp_millis()
            ],
        )?;
        tx.mark_pending();
        let change = find(tx.conn(), kind, &target)?
            .ok_or_else(|| corrupt(format!("entry for {} '{}' vanished", kind, target)))?;
        debug!("Queued {} {} '{}'", action, kind, target);
        return Ok(EnqueueOutcome::Queued(change));
    };

    let merged = match (existing.action, action) {
        (ChangeAction::Delete, _) => return Ok(EnqueueOutcome::Ignored(existing)),
        (ChangeAction::Add, ChangeAction::Delete) if !existing.attempted => {
            remove_entry(tx, &existing.id)?;
            tx.delete(kind, &target)?;
            purge_orphans(tx)?;
            debug!("Cancelled unsent add of {} '{}'", kind, target);
            return Ok(EnqueueOutcome::Cancelled);
        }
        (ChangeAction::Add, ChangeAction::Delete) => ChangeAction::Delete,
        (ChangeAction::Add, _) => ChangeAction::Add,
        (ChangeAction::Update, next) => next,
    };

    let payload_text = payload_text.or_else(|| {
        existing
            .payload
            .as_ref()
            .and_then(|value| serde_json::to_string(value).ok())
    });
    tx.conn().execute(
        "UPDATE pending_changes SET action = ?1, payload = ?2, revision = revision + 1 WHERE id = ?3",
        params![merged.as_str(), payload_text, existing.id.to_string()],
    )?;
    tx.mark_pending();

    let change = find(tx.conn(), kind, &target)?
        .ok_or_else(|| corrupt(format!("entry for {} '{}' vanished", kind, target)))?;
    debug!("Collapsed {} into queued {} for {} '{}'", action, merged, kind, target);
    Ok(EnqueueOutcome::Collapsed(change))
}

fn remove_entry(tx: &mut WriteTx<'_>, id: &Uuid) -> StorageResult<bool> {
    let removed = tx
        .conn()
        .execute("DELETE FROM pending_changes WHERE id = ?", [id.to_string()])?;
    if removed > 0 {
        tx.mark_pending();
    }
    Ok(removed > 0)
}

/// Flag every entry as attempted and return the queue in upload order
pub fn begin_upload(tx: &mut WriteTx<'_>) -> StorageResult<Vec<PendingChange>> {
    tx.conn()
        .execute("UPDATE pending_changes SET attempted = 1 WHERE attempted = 0", [])?;
    list(tx.conn())
}

/// Remove an entry the server has accepted
///
/// Only removes it if nothing newer was folded into it since `change`
/// was read; otherwise the newer intent stays queued. Returns whether the
/// entry was removed.
pub fn confirm(tx: &mut WriteTx<'_>, change: &PendingChange) -> StorageResult<bool> {
    let removed = tx.conn().execute(
        "DELETE FROM pending_changes WHERE id = ?1 AND revision = ?2",
        params![change.id.to_string(), change.revision],
    )?;
    if removed == 0 {
        // The server has the entity now, so a newer edit must not add it again
        if change.action == ChangeAction::Add {
            let downgraded = tx.conn().execute(
                "UPDATE pending_changes SET action = 'update' WHERE id = ?1 AND action = 'add'",
                [change.id.to_string()],
            )?;
            if downgraded > 0 {
                tx.mark_pending();
            }
        }
        return Ok(false);
    }
    tx.mark_pending();

    if change.action == ChangeAction::Delete {
        tx.delete(change.kind, &change.target)?;
        purge_orphans(tx)?;
    }
    Ok(true)
}

/// Drop an entry regardless of its revision
pub fn discard(tx: &mut WriteTx<'_>, id: &Uuid) -> StorageResult<bool> {
    remove_entry(tx, id)
}

/// Drop entries for child rows that no longer exist locally
///
/// Once a parent is gone its children's changes can never be applied.
fn purge_orphans(tx: &mut WriteTx<'_>) -> StorageResult<usize> {
    let mut purged = 0;
    for change in list(tx.conn())? {
        if change.kind.parent().is_none() {
            continue;
        }
        if !tx.exists(change.kind, &change.target)? {
            remove_entry(tx, &change.id)?;
            purged += 1;
        }
    }
    if purged > 0 {
        debug!("Dropped {} pending change(s) under removed parents", purged);
    }
    Ok(purged)
}

/// Durable queue handle
#[derive(Clone)]
pub struct PendingQueue {
    store: LocalStore,
}

impl PendingQueue {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Queue a change; committed to disk before this returns
    pub fn enqueue(
        &self,
        kind: EntityKind,
        action: ChangeAction,
        target: RecordKey,
        payload: Option<serde_json::Value>,
    ) -> StorageResult<EnqueueOutcome> {
        self.store
            .write(|tx| enqueue(tx, kind, action, target, payload))
    }

    pub fn list(&self) -> StorageResult<Vec<PendingChange>> {
        self.store.read(list)
    }

    pub fn find(&self, kind: EntityKind, target: &RecordKey) -> StorageResult<Option<PendingChange>> {
        self.store.read(|conn| find(conn, kind, target))
    }

    pub fn count(&self) -> StorageResult<i64> {
        self.store.read(count)
    }

    /// Entries for an upload pass; each is flagged as attempted first
    pub fn begin_upload(&self) -> StorageResult<Vec<PendingChange>> {
        self.store.write(begin_upload)
    }

    pub fn confirm(&self, change: &PendingChange) -> StorageResult<bool> {
        self.store.write(|tx| confirm(tx, change))
    }

    pub fn discard(&self, id: &Uuid) -> StorageResult<bool> {
        self.store.write(|tx| discard(tx, id))
    }
}

/// Local edits: mirror into the cache and queue for upload in one transaction
#[derive(Clone)]
pub struct LocalMutations {
    store: LocalStore,
}

impl LocalMutations {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn add<R: Record>(&self, record: &R) -> StorageResult<EnqueueOutcome> {
        self.save(record, ChangeAction::Add)
    }

    pub fn update<R: Record>(&self, record: &R) -> StorageResult<EnqueueOutcome> {
        self.save(record, ChangeAction::Update)
    }

    fn save<R: Record>(&self, record: &R, action: ChangeAction) -> StorageResult<EnqueueOutcome> {
        let payload = serde_json::to_value(record).map_err(|source| StorageError::Payload {
            kind: R::KIND,
            source,
        })?;
        self.store.write(|tx| {
            let key = record.key();
            if let Some(queued) = find(tx.conn(), R::KIND, &key)? {
                if queued.action == ChangeAction::Delete {
                    return Ok(EnqueueOutcome::Ignored(queued));
                }
            }
            tx.upsert(record)?;
            enqueue(tx, R::KIND, action, key, Some(payload))
        })
    }

    /// Queue a delete
    ///
    /// The row stays in the cache until the server confirms the delete,
    /// unless no upload of it was ever attempted, in which case it goes
    /// immediately.
    pub fn delete(&self, kind: EntityKind, key: &RecordKey) -> StorageResult<EnqueueOutcome> {
        self.store.write(|tx| {
            let payload = match tx.get_any(kind, key)? {
                Some(record) => Some(record.to_json().map_err(|source| {
                    StorageError::Payload { kind, source }
                })?),
                None => None,
            };
            enqueue(tx, kind, ChangeAction::Delete, key.clone(), payload)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{House, Territory, TerritoryAddress, Visit, VisitSymbol};
    use tempfile::TempDir;

    fn territory(id: &str, description: &str) -> Territory {
        Territory {
            id: id.into(),
            congregation: "c1".into(),
            number: 1,
            description: description.into(),
            image: None,
        }
    }

    fn payload(description: &str) -> Option<serde_json::Value> {
        Some(serde_json::to_value(territory("t1", description)).unwrap())
    }

    fn queue() -> (LocalStore, PendingQueue) {
        let store = LocalStore::open_in_memory().unwrap();
        (store.clone(), PendingQueue::new(store))
    }

    #[test]
    fn test_update_then_update_keeps_latest_payload() {
        let (_, queue) = queue();
        let key = RecordKey::id("t1");

        queue
            .enqueue(EntityKind::Territory, ChangeAction::Update, key.clone(), payload("one"))
            .unwrap();
        let outcome = queue
            .enqueue(EntityKind::Territory, ChangeAction::Update, key.clone(), payload("two"))
            .unwrap();

        assert!(matches!(outcome, EnqueueOutcome::Collapsed(_)));
        let entries = queue.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, ChangeAction::Update);
        assert_eq!(entries[0].payload.as_ref().unwrap()["description"], "two");
        assert_eq!(entries[0].revision, 1);
    }

    #[test]
    fn test_delete_is_terminal() {
        let (_, queue) = queue();
        let key = RecordKey::id("t1");

        queue
            .enqueue(EntityKind::Territory, ChangeAction::Delete, key.clone(), None)
            .unwrap();
        let outcome = queue
            .enqueue(EntityKind::Territory, ChangeAction::Update, key.clone(), payload("late"))
            .unwrap();

        assert!(matches!(outcome, EnqueueOutcome::Ignored(_)));
        let entries = queue.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, ChangeAction::Delete);
        assert!(entries[0].payload.is_none());
    }

    #[test]
    fn test_add_then_update_stays_add() {
        let (_, queue) = queue();
        let key = RecordKey::id("t1");

        queue
            .enqueue(EntityKind::Territory, ChangeAction::Add, key.clone(), payload("draft"))
            .unwrap();
        queue
            .enqueue(EntityKind::Territory, ChangeAction::Update, key.clone(), payload("final"))
            .unwrap();

        let entry = queue.find(EntityKind::Territory, &key).unwrap().unwrap();
        assert_eq!(entry.action, ChangeAction::Add);
        assert_eq!(entry.payload.unwrap()["description"], "final");
    }

    #[test]
    fn test_update_then_delete_becomes_delete() {
        let (_, queue) = queue();
        let key = RecordKey::id("t1");

        queue
            .enqueue(EntityKind::Territory, ChangeAction::Update, key.clone(), payload("x"))
            .unwrap();
        queue
            .enqueue(EntityKind::Territory, ChangeAction::Delete, key.clone(), None)
            .unwrap();

        let entry = queue.find(EntityKind::Territory, &key).unwrap().unwrap();
        assert_eq!(entry.action, ChangeAction::Delete);
    }

    #[test]
    fn test_collapse_keeps_queue_position() {
        let (_, queue) = queue();

        queue
            .enqueue(EntityKind::Territory, ChangeAction::Update, RecordKey::id("t1"), payload("a"))
            .unwrap();
        queue
            .enqueue(EntityKind::Territory, ChangeAction::Update, RecordKey::id("t2"), payload("b"))
            .unwrap();
        queue
            .enqueue(EntityKind::Territory, ChangeAction::Update, RecordKey::id("t1"), payload("c"))
            .unwrap();

        let targets: Vec<_> = queue.list().unwrap().into_iter().map(|c| c.target).collect();
        assert_eq!(targets, vec![RecordKey::id("t1"), RecordKey::id("t2")]);
    }

    #[test]
    fn test_add_then_delete_cancels_and_removes_children() {
        let (store, _) = queue();
        let mutations = LocalMutations::new(store.clone());
        let queue = PendingQueue::new(store.clone());

        store.upsert(&territory("t1", "North")).unwrap();
        let address = TerritoryAddress {
            id: "a1".into(),
            territory: "t1".into(),
            address: "1 Main St".into(),
            floors: None,
        };
        let house = House {
            id: "h1".into(),
            territory_address: "a1".into(),
            number: "1".into(),
            floor: None,
        };
        mutations.add(&address).unwrap();
        mutations.add(&house).unwrap();
        assert_eq!(queue.count().unwrap(), 2);

        let outcome = mutations
            .delete(EntityKind::TerritoryAddress, &RecordKey::id("a1"))
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert_eq!(queue.count().unwrap(), 0);
        assert_eq!(store.count(EntityKind::TerritoryAddress).unwrap(), 0);
        assert_eq!(store.count(EntityKind::House).unwrap(), 0);
    }

    #[test]
    fn test_delete_after_upload_started_is_queued() {
        let (store, queue) = queue();
        let mutations = LocalMutations::new(store.clone());
        mutations.add(&territory("t1", "North")).unwrap();

        let uploading = queue.begin_upload().unwrap();
        assert!(uploading[0].attempted);
        let outcome = mutations
            .delete(EntityKind::Territory, &RecordKey::id("t1"))
            .unwrap();

        assert!(matches!(outcome, EnqueueOutcome::Collapsed(_)));
        assert_eq!(store.count(EntityKind::Territory).unwrap(), 1);
        assert!(!queue.confirm(&uploading[0]).unwrap());
        let entry = queue.list().unwrap().remove(0);
        assert_eq!(entry.action, ChangeAction::Delete);
        assert_eq!(entry.revision, 1);
    }

    #[test]
    fn test_edit_during_add_upload_becomes_update() {
        let (store, queue) = queue();
        let mutations = LocalMutations::new(store.clone());
        mutations.add(&territory("t1", "North")).unwrap();

        let uploading = queue.begin_upload().unwrap();
        mutations.update(&territory("t1", "South")).unwrap();
        assert!(!queue.confirm(&uploading[0]).unwrap());

        let entry = queue.list().unwrap().remove(0);
        assert_eq!(entry.action, ChangeAction::Update);
        assert_eq!(entry.payload.unwrap()["description"], "South");
    }

    #[test]
    fn test_mutation_mirrors_locally() {
        let (store, queue) = queue();
        let mutations = LocalMutations::new(store.clone());
        let mut changes = store.subscribe_changes();

        mutations.add(&territory("t1", "North")).unwrap();

        assert_eq!(store.count(EntityKind::Territory).unwrap(), 1);
        assert_eq!(queue.count().unwrap(), 1);
        let change = changes.try_recv().unwrap();
        assert!(change.pending);
        assert!(change.kinds.contains(&EntityKind::Territory));
    }

    #[test]
    fn test_mutation_with_missing_parent_queues_nothing() {
        let (store, queue) = queue();
        let mutations = LocalMutations::new(store);

        let visit = Visit::new("no-such-house", 5, VisitSymbol::NC, "", "me");
        let result = mutations.add(&visit);

        assert!(matches!(result, Err(StorageError::MissingParent { .. })));
        assert_eq!(queue.count().unwrap(), 0);
    }

    #[test]
    fn test_delete_keeps_row_until_confirmed() {
        let (store, queue) = queue();
        let mutations = LocalMutations::new(store.clone());
        store.upsert(&territory("t1", "North")).unwrap();

        mutations
            .delete(EntityKind::Territory, &RecordKey::id("t1"))
            .unwrap();
        assert_eq!(store.count(EntityKind::Territory).unwrap(), 1);

        let entry = queue.list().unwrap().remove(0);
        assert!(queue.confirm(&entry).unwrap());
        assert_eq!(store.count(EntityKind::Territory).unwrap(), 0);
        assert_eq!(queue.count().unwrap(), 0);
    }

    #[test]
    fn test_confirm_skips_entry_changed_since_upload() {
        let (_, queue) = queue();
        let key = RecordKey::id("t1");

        queue
            .enqueue(EntityKind::Territory, ChangeAction::Update, key.clone(), payload("one"))
            .unwrap();
        let uploaded = queue.list().unwrap().remove(0);
        queue
            .enqueue(EntityKind::Territory, ChangeAction::Update, key.clone(), payload("two"))
            .unwrap();

        assert!(!queue.confirm(&uploaded).unwrap());
        let entry = queue.find(EntityKind::Territory, &key).unwrap().unwrap();
        assert_eq!(entry.payload.unwrap()["description"], "two");
    }

    #[test]
    fn test_entries_survive_restart() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("servicemaps.db");

        {
            let store = LocalStore::open_at(&path).unwrap();
            PendingQueue::new(store)
                .enqueue(
                    EntityKind::Recall,
                    ChangeAction::Add,
                    RecordKey::pair("ann@example.com", "h1"),
                    None,
                )
                .unwrap();
            // Dropped here without any upload, as if the process died
        }

        let queue = PendingQueue::new(LocalStore::open_at(&path).unwrap());
        let entries = queue.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target, RecordKey::pair("ann@example.com", "h1"));
    }

    #[test]
    fn test_rejects_key_of_wrong_arity() {
        let (_, queue) = queue();
        let result = queue.enqueue(
            EntityKind::Recall,
            ChangeAction::Add,
            RecordKey::id("ann-h1"),
            None,
        );
        assert!(matches!(result, Err(StorageError::InvalidKey { .. })));
    }
}
