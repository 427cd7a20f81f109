//! Snapshot reconciliation
//!
//! Merges authoritative server snapshots into the local cache. A pass runs
//! inside one transaction, with one savepoint per entity kind:
//!
//! 1. Upsert every kind root-to-leaf, so a child never references a parent
//!    that has not been written yet.
//! 2. Prune rows missing from the snapshot leaf-to-root.
//!
//! A kind that fails (a record whose parent is absent, an invalid key) is
//! rolled back on its own and left exactly as it was before the pass.
//!
//! Rows with an outstanding pending change are never overwritten or pruned,
//! and neither are their ancestors, so unsynced local work survives until
//! the server has seen it.

use std::collections::{BTreeMap, HashMap, HashSet};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::{
    AnyRecord, EntityKind, House, PhoneCall, PhoneNumber, PhoneTerritory, Recall, RecordKey,
    Territory, TerritoryAddress, Token, TokenTerritory, UserToken, Visit,
};
use crate::pending;
use crate::storage::record;
use crate::storage::{LocalStore, Record, StorageError, StorageResult, UpsertOutcome, WriteTx};

/// Full listing of the territory hierarchy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerritorySnapshot {
    pub territories: Vec<Territory>,
    pub addresses: Vec<TerritoryAddress>,
    pub houses: Vec<House>,
    pub visits: Vec<Visit>,
}

/// Full listing of the phone hierarchy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneSnapshot {
    pub territories: Vec<PhoneTerritory>,
    pub numbers: Vec<PhoneNumber>,
    pub calls: Vec<PhoneCall>,
}

/// Access keys with their territory grants and members
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSnapshot {
    pub tokens: Vec<Token>,
    pub token_territories: Vec<TokenTerritory>,
    pub user_tokens: Vec<UserToken>,
}

/// Everything fetched by one sync pass
///
/// A `None` part was not fetched; its kinds are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FullSnapshot {
    pub territories: Option<TerritorySnapshot>,
    pub phone: Option<PhoneSnapshot>,
    pub tokens: Option<TokenSnapshot>,
    pub recalls: Option<Vec<Recall>>,
}

impl FullSnapshot {
    /// Whether every part was fetched
    pub fn is_complete(&self) -> bool {
        self.territories.is_some()
            && self.phone.is_some()
            && self.tokens.is_some()
            && self.recalls.is_some()
    }

    /// Records per included kind, parents before children
    fn batches(&self) -> BTreeMap<EntityKind, Vec<AnyRecord>> {
        fn put<R: Record>(out: &mut BTreeMap<EntityKind, Vec<AnyRecord>>, records: &[R]) {
            out.insert(R::KIND, records.iter().cloned().map(R::into_any).collect());
        }

        let mut out = BTreeMap::new();
        if let Some(s) = &self.territories {
            put(&mut out, &s.territories);
            put(&mut out, &s.addresses);
            put(&mut out, &s.houses);
            put(&mut out, &s.visits);
        }
        if let Some(s) = &self.phone {
            put(&mut out, &s.territories);
            put(&mut out, &s.numbers);
            put(&mut out, &s.calls);
        }
        if let Some(s) = &self.tokens {
            put(&mut out, &s.tokens);
            put(&mut out, &s.token_territories);
            put(&mut out, &s.user_tokens);
        }
        if let Some(recalls) = &self.recalls {
            put(&mut out, recalls);
        }
        out
    }
}

/// Counts for one kind in one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Rows kept as they are because of pending local changes
    pub preserved: usize,
}

impl KindReport {
    pub fn changed(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// A kind whose apply was rolled back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindFailure {
    pub kind: EntityKind,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub kinds: BTreeMap<EntityKind, KindReport>,
    pub failures: Vec<KindFailure>,
}

impl ReconcileReport {
    /// Whether every kind in the snapshot was applied
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn changed(&self) -> usize {
        self.kinds.values().map(KindReport::changed).sum()
    }

    pub fn get(&self, kind: EntityKind) -> KindReport {
        self.kinds.get(&kind).copied().unwrap_or_default()
    }
}

/// Result of merging a single entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOutcome {
    Upserted(UpsertOutcome),
    /// Whether a row was actually removed
    Deleted(bool),
    /// A pending local change holds the row
    Preserved,
}

type KeySets = HashMap<EntityKind, HashSet<RecordKey>>;

/// Keys a snapshot must not touch: rows with pending changes and their ancestors
fn protected_keys(conn: &Connection) -> StorageResult<KeySets> {
    let mut out = KeySets::new();
    for change in pending::list(conn)? {
        let mut kind = change.kind;
        let mut parent = match record::fetch_any(conn, kind, &change.target)? {
            Some(row) => row.parent_key(),
            None => change.record().ok().flatten().and_then(|r| r.parent_key()),
        };
        out.entry(kind).or_default().insert(change.target);

        while let (Some(parent_kind), Some(parent_key)) = (kind.parent(), parent.take()) {
            parent = record::fetch_any(conn, parent_kind, &parent_key)?
                .and_then(|row| row.parent_key());
            out.entry(parent_kind).or_default().insert(parent_key);
            kind = parent_kind;
        }
    }
    Ok(out)
}

fn is_protected(protected: &KeySets, kind: EntityKind, key: &RecordKey) -> bool {
    protected.get(&kind).is_some_and(|keys| keys.contains(key))
}

/// Later duplicates replace earlier ones but keep the first position
fn dedupe(records: &[AnyRecord]) -> Vec<AnyRecord> {
    let mut index: HashMap<RecordKey, usize> = HashMap::new();
    let mut out: Vec<AnyRecord> = Vec::with_capacity(records.len());
    for record in records {
        let key = record.key();
        match index.get(&key) {
            Some(&i) => out[i] = record.clone(),
            None => {
                index.insert(key, out.len());
                out.push(record.clone());
            }
        }
    }
    out
}

fn upsert_kind(
    tx: &mut WriteTx<'_>,
    kind: EntityKind,
    records: &[AnyRecord],
    valid_parents: Option<&HashSet<RecordKey>>,
    protected: &KeySets,
) -> StorageResult<KindReport> {
    let mut report = KindReport::default();
    for record in records {
        let key = record.key();
        if is_protected(protected, kind, &key) {
            report.preserved += 1;
            continue;
        }

        // A parent absent from the same snapshot is about to be pruned
        if let (Some(parent_kind), Some(parent), Some(valid)) =
            (kind.parent(), record.parent_key(), valid_parents)
        {
            if !valid.contains(&parent) && !is_protected(protected, parent_kind, &parent) {
                return Err(StorageError::MissingParent {
                    kind,
                    key,
                    parent_kind,
                    parent,
                });
            }
        }

        match tx.upsert_any(record)? {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::Updated => report.updated += 1,
            UpsertOutcome::Unchanged => report.unchanged += 1,
        }
    }
    Ok(report)
}

fn prune_kind(
    tx: &mut WriteTx<'_>,
    kind: EntityKind,
    keep: &HashSet<RecordKey>,
    protected: &KeySets,
    report: &mut KindReport,
) -> StorageResult<()> {
    for key in tx.keys(kind)? {
        if keep.contains(&key) {
            continue;
        }
        if is_protected(protected, kind, &key) {
            report.preserved += 1;
            continue;
        }
        if tx.delete(kind, &key)? {
            report.deleted += 1;
        }
    }
    Ok(())
}

fn reconcile_in(
    tx: &mut WriteTx<'_>,
    batches: BTreeMap<EntityKind, Vec<AnyRecord>>,
) -> StorageResult<ReconcileReport> {
    let protected = protected_keys(tx.conn())?;
    let mut report = ReconcileReport::default();
    // Snapshot keys of kinds whose upserts went through
    let mut applied = KeySets::new();

    for (&kind, records) in &batches {
        let records = dedupe(records);
        let keys: HashSet<RecordKey> = records.iter().map(AnyRecord::key).collect();
        let valid_parents = kind
            .parent()
            .filter(|parent| batches.contains_key(parent))
            .and_then(|parent| applied.get(&parent));

        match tx.savepoint(|tx| upsert_kind(tx, kind, &records, valid_parents, &protected)) {
            Ok(counts) => {
                report.kinds.insert(kind, counts);
                applied.insert(kind, keys);
            }
            Err(e) if e.is_integrity_violation() => {
                warn!("Rolled back {} from snapshot: {}", kind, e);
                report.failures.push(KindFailure {
                    kind,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    for kind in EntityKind::ALL.iter().rev() {
        let Some(keep) = applied.get(kind) else {
            continue;
        };
        let mut counts = report.get(*kind);
        prune_kind(tx, *kind, keep, &protected, &mut counts)?;
        report.kinds.insert(*kind, counts);
    }

    Ok(report)
}

/// Applies snapshots and single-entity updates to the local cache
#[derive(Clone)]
pub struct Reconciler {
    store: LocalStore,
}

impl Reconciler {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Merge a snapshot; fetched parts replace their kinds wholesale
    pub fn reconcile(&self, snapshot: &FullSnapshot) -> StorageResult<ReconcileReport> {
        let batches = snapshot.batches();
        if batches.is_empty() {
            return Ok(ReconcileReport::default());
        }

        let report = self.store.write(|tx| reconcile_in(tx, batches))?;
        info!(
            "Reconciled snapshot: {} change(s), {} kind(s) failed",
            report.changed(),
            report.failures.len()
        );
        for (kind, counts) in &report.kinds {
            if counts.changed() > 0 || counts.preserved > 0 {
                debug!(
                    "{}: +{} ~{} -{} preserved {}",
                    kind, counts.inserted, counts.updated, counts.deleted, counts.preserved
                );
            }
        }
        Ok(report)
    }

    /// Merge one entity as the server now has it; `None` means deleted
    pub fn apply_entity(
        &self,
        kind: EntityKind,
        key: &RecordKey,
        record: Option<AnyRecord>,
    ) -> StorageResult<EntityOutcome> {
        if let Some(record) = &record {
            if record.kind() != kind || record.key() != *key {
                return Err(StorageError::InvalidKey {
                    kind,
                    key: record.key().encode(),
                });
            }
        }

        let outcome = self.store.write(|tx| {
            let protected = protected_keys(tx.conn())?;
            if is_protected(&protected, kind, key) {
                return Ok(EntityOutcome::Preserved);
            }
            match &record {
                Some(record) => Ok(EntityOutcome::Upserted(tx.upsert_any(record)?)),
                None => Ok(EntityOutcome::Deleted(tx.delete(kind, key)?)),
            }
        })?;
        debug!("Applied {} '{}': {:?}", kind, key, outcome);
        Ok(outcome)
    }
}
