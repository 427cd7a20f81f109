//! Typed row mapping
//!
//! Each mirrored entity implements [`Record`], which is enough to derive
//! every statement the cache needs: keyed lookup, full scan, upsert and
//! keyed delete. Upserts use `INSERT .. ON CONFLICT DO UPDATE` rather than
//! `INSERT OR REPLACE`, which would delete the old row first and cascade
//! the delete to its children.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::error::{StorageError, StorageResult};
use crate::models::{
    AnyRecord, EntityKind, House, PhoneCall, PhoneNumber, PhoneTerritory, Recall, RecordKey,
    Territory, TerritoryAddress, Token, TokenTerritory, UserToken, Visit,
};

/// A row of one mirrored table
pub trait Record: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;

    /// All columns, in the order used by [`Record::from_row`] and [`Record::to_values`]
    const COLUMNS: &'static [&'static str];

    fn key(&self) -> RecordKey;

    /// Key of the row this one hangs off, if the kind has an enforced parent
    fn parent_key(&self) -> Option<RecordKey> {
        None
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    fn to_values(&self) -> Vec<Value>;

    fn into_any(self) -> AnyRecord;
}

/// Result of writing one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Field-for-field identical to the stored row; nothing was written
    Unchanged,
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn opt_text(value: &Option<String>) -> Value {
    value.as_deref().map_or(Value::Null, text)
}

fn opt_int(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

impl Record for Territory {
    const KIND: EntityKind = EntityKind::Territory;
    const COLUMNS: &'static [&'static str] = &["id", "congregation", "number", "description", "image"];

    fn key(&self) -> RecordKey {
        RecordKey::id(&self.id)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            congregation: row.get(1)?,
            number: row.get(2)?,
            description: row.get(3)?,
            image: row.get(4)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.congregation),
            Value::Integer(self.number),
            text(&self.description),
            opt_text(&self.image),
        ]
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::Territory(self)
    }
}

impl Record for TerritoryAddress {
    const KIND: EntityKind = EntityKind::TerritoryAddress;
    const COLUMNS: &'static [&'static str] = &["id", "territory", "address", "floors"];

    fn key(&self) -> RecordKey {
        RecordKey::id(&self.id)
    }

    fn parent_key(&self) -> Option<RecordKey> {
        Some(RecordKey::id(&self.territory))
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            territory: row.get(1)?,
            address: row.get(2)?,
            floors: row.get(3)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.territory),
            text(&self.address),
            opt_int(self.floors),
        ]
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::TerritoryAddress(self)
    }
}

impl Record for House {
    const KIND: EntityKind = EntityKind::House;
    const COLUMNS: &'static [&'static str] = &["id", "territory_address", "number", "floor"];

    fn key(&self) -> RecordKey {
        RecordKey::id(&self.id)
    }

    fn parent_key(&self) -> Option<RecordKey> {
        Some(RecordKey::id(&self.territory_address))
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            territory_address: row.get(1)?,
            number: row.get(2)?,
            floor: row.get(3)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.territory_address),
            text(&self.number),
            opt_text(&self.floor),
        ]
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::House(self)
    }
}

impl Record for Visit {
    const KIND: EntityKind = EntityKind::Visit;
    const COLUMNS: &'static [&'static str] = &["id", "house", "date", "symbol", "notes", "user"];

    fn key(&self) -> RecordKey {
        RecordKey::id(&self.id)
    }

    fn parent_key(&self) -> Option<RecordKey> {
        Some(RecordKey::id(&self.house))
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            house: row.get(1)?,
            date: row.get(2)?,
            symbol: row.get(3)?,
            notes: row.get(4)?,
            user: row.get(5)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.house),
            Value::Integer(self.date),
            text(&self.symbol),
            text(&self.notes),
            text(&self.user),
        ]
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::Visit(self)
    }
}

impl Record for PhoneTerritory {
    const KIND: EntityKind = EntityKind::PhoneTerritory;
    const COLUMNS: &'static [&'static str] = &["id", "congregation", "number", "description", "image"];

    fn key(&self) -> RecordKey {
        RecordKey::id(&self.id)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            congregation: row.get(1)?,
            number: row.get(2)?,
            description: row.get(3)?,
            image: row.get(4)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.congregation),
            Value::Integer(self.number),
            text(&self.description),
            opt_text(&self.image),
        ]
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::PhoneTerritory(self)
    }
}

impl Record for PhoneNumber {
    const KIND: EntityKind = EntityKind::PhoneNumber;
    const COLUMNS: &'static [&'static str] = &["id", "congregation", "number", "territory", "house"];

    fn key(&self) -> RecordKey {
        RecordKey::id(&self.id)
    }

    fn parent_key(&self) -> Option<RecordKey> {
        Some(RecordKey::id(&self.territory))
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            congregation: row.get(1)?,
            number: row.get(2)?,
            territory: row.get(3)?,
            house: row.get(4)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.congregation),
            text(&self.number),
            text(&self.territory),
            opt_text(&self.house),
        ]
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::PhoneNumber(self)
    }
}

impl Record for PhoneCall {
    const KIND: EntityKind = EntityKind::PhoneCall;
    const COLUMNS: &'static [&'static str] = &["id", "phonenumber", "date", "notes", "user"];

    fn key(&self) -> RecordKey {
        RecordKey::id(&self.id)
    }

    fn parent_key(&self) -> Option<RecordKey> {
        Some(RecordKey::id(&self.phone_number))
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            phone_number: row.get(1)?,
            date: row.get(2)?,
            notes: row.get(3)?,
            user: row.get(4)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.phone_number),
            Value::Integer(self.date),
            text(&self.notes),
            text(&self.user),
        ]
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::PhoneCall(self)
    }
}

impl Record for Token {
    const KIND: EntityKind = EntityKind::Token;
    const COLUMNS: &'static [&'static str] =
        &["id", "name", "owner", "congregation", "moderator", "expire", "user"];

    fn key(&self) -> RecordKey {
        RecordKey::id(&self.id)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            owner: row.get(2)?,
            congregation: row.get(3)?,
            moderator: row.get(4)?,
            expire: row.get(5)?,
            user: row.get(6)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            text(&self.id),
            text(&self.name),
            text(&self.owner),
            text(&self.congregation),
            Value::Integer(i64::from(self.moderator)),
            opt_int(self.expire),
            opt_text(&self.user),
        ]
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::Token(self)
    }
}

impl Record for TokenTerritory {
    const KIND: EntityKind = EntityKind::TokenTerritory;
    const COLUMNS: &'static [&'static str] = &["token", "territory"];

    fn key(&self) -> RecordKey {
        self.grant_key().into()
    }

    fn parent_key(&self) -> Option<RecordKey> {
        Some(RecordKey::id(&self.token))
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            token: row.get(0)?,
            territory: row.get(1)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![text(&self.token), text(&self.territory)]
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::TokenTerritory(self)
    }
}

impl Record for UserToken {
    const KIND: EntityKind = EntityKind::UserToken;
    const COLUMNS: &'static [&'static str] = &["token", "user_id", "name", "blocked"];

    fn key(&self) -> RecordKey {
        self.member_key().into()
    }

    fn parent_key(&self) -> Option<RecordKey> {
        Some(RecordKey::id(&self.token))
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            token: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            blocked: row.get(3)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            text(&self.token),
            text(&self.user_id),
            text(&self.name),
            Value::Integer(i64::from(self.blocked)),
        ]
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::UserToken(self)
    }
}

impl Record for Recall {
    const KIND: EntityKind = EntityKind::Recall;
    const COLUMNS: &'static [&'static str] = &["user", "house", "id"];

    fn key(&self) -> RecordKey {
        self.recall_key().into()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user: row.get(0)?,
            house: row.get(1)?,
            id: row.get(2)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![text(&self.user), text(&self.house), Value::Integer(self.id)]
    }

    fn into_any(self) -> AnyRecord {
        AnyRecord::Recall(self)
    }
}

/// Run `$body` with `$ty` bound to the record type of `$kind`
macro_rules! with_record_type {
    ($kind:expr, $ty:ident => $body:expr) => {
        match $kind {
            EntityKind::Territory => {
                type $ty = Territory;
                $body
            }
            EntityKind::TerritoryAddress => {
                type $ty = TerritoryAddress;
                $body
            }
            EntityKind::House => {
                type $ty = House;
                $body
            }
            EntityKind::Visit => {
                type $ty = Visit;
                $body
            }
            EntityKind::PhoneTerritory => {
                type $ty = PhoneTerritory;
                $body
            }
            EntityKind::PhoneNumber => {
                type $ty = PhoneNumber;
                $body
            }
            EntityKind::PhoneCall => {
                type $ty = PhoneCall;
                $body
            }
            EntityKind::Token => {
                type $ty = Token;
                $body
            }
            EntityKind::TokenTerritory => {
                type $ty = TokenTerritory;
                $body
            }
            EntityKind::UserToken => {
                type $ty = UserToken;
                $body
            }
            EntityKind::Recall => {
                type $ty = Recall;
                $body
            }
        }
    };
}

/// Run `$body` with `$rec` bound to the concrete record inside an [`AnyRecord`]
macro_rules! with_any_record {
    ($any:expr, $rec:ident => $body:expr) => {
        match $any {
            AnyRecord::Territory($rec) => $body,
            AnyRecord::TerritoryAddress($rec) => $body,
            AnyRecord::House($rec) => $body,
            AnyRecord::Visit($rec) => $body,
            AnyRecord::PhoneTerritory($rec) => $body,
            AnyRecord::PhoneNumber($rec) => $body,
            AnyRecord::PhoneCall($rec) => $body,
            AnyRecord::Token($rec) => $body,
            AnyRecord::TokenTerritory($rec) => $body,
            AnyRecord::UserToken($rec) => $body,
            AnyRecord::Recall($rec) => $body,
        }
    };
}

impl AnyRecord {
    pub fn key(&self) -> RecordKey {
        with_any_record!(self, r => Record::key(r))
    }

    pub fn parent_key(&self) -> Option<RecordKey> {
        with_any_record!(self, r => Record::parent_key(r))
    }
}

fn key_predicate(kind: EntityKind) -> String {
    kind.key_columns()
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{} = ?{}", col, i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn check_key(kind: EntityKind, key: &RecordKey) -> StorageResult<()> {
    if key.fits(kind) {
        Ok(())
    } else {
        Err(StorageError::InvalidKey {
            kind,
            key: key.encode(),
        })
    }
}

/// Fetch one row by key
pub fn fetch_one<R: Record>(conn: &Connection, key: &RecordKey) -> StorageResult<Option<R>> {
    check_key(R::KIND, key)?;
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        R::COLUMNS.join(", "),
        R::KIND.table(),
        key_predicate(R::KIND)
    );
    let row = conn
        .query_row(&sql, params_from_iter(key.parts()), R::from_row)
        .optional()?;
    Ok(row)
}

/// Fetch every row of a kind, ordered by key
pub fn fetch_all<R: Record>(conn: &Connection) -> StorageResult<Vec<R>> {
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        R::COLUMNS.join(", "),
        R::KIND.table(),
        R::KIND.key_columns().join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], R::from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Fetch one row of any kind
pub fn fetch_any(
    conn: &Connection,
    kind: EntityKind,
    key: &RecordKey,
) -> StorageResult<Option<AnyRecord>> {
    with_record_type!(kind, R => Ok(fetch_one::<R>(conn, key)?.map(Record::into_any)))
}

/// Keys of every row of a kind
pub fn fetch_keys(conn: &Connection, kind: EntityKind) -> StorageResult<Vec<RecordKey>> {
    let columns = kind.key_columns();
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        columns.join(", "),
        kind.table(),
        columns.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        if columns.len() == 2 {
            Ok(RecordKey::Pair(row.get(0)?, row.get(1)?))
        } else {
            Ok(RecordKey::Id(row.get(0)?))
        }
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn exists(conn: &Connection, kind: EntityKind, key: &RecordKey) -> StorageResult<bool> {
    check_key(kind, key)?;
    let sql = format!("SELECT 1 FROM {} WHERE {}", kind.table(), key_predicate(kind));
    let mut stmt = conn.prepare(&sql)?;
    Ok(stmt.exists(params_from_iter(key.parts()))?)
}

pub fn count(conn: &Connection, kind: EntityKind) -> StorageResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

/// Insert or update one row
///
/// Fails with [`StorageError::MissingParent`] when the record's parent row
/// is absent, and skips the write when the stored row is identical.
pub fn upsert<R: Record>(conn: &Connection, record: &R) -> StorageResult<UpsertOutcome> {
    let key = record.key();
    let existing = fetch_one::<R>(conn, &key)?;
    if existing.as_ref() == Some(record) {
        return Ok(UpsertOutcome::Unchanged);
    }

    if let (Some(parent_kind), Some(parent)) = (R::KIND.parent(), record.parent_key()) {
        if !exists(conn, parent_kind, &parent)? {
            return Err(StorageError::MissingParent {
                kind: R::KIND,
                key,
                parent_kind,
                parent,
            });
        }
    }

    let key_columns = R::KIND.key_columns();
    let placeholders = (1..=R::COLUMNS.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = R::COLUMNS
        .iter()
        .filter(|col| !key_columns.contains(*col))
        .map(|col| format!("{col} = excluded.{col}"))
        .collect::<Vec<_>>();
    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        R::KIND.table(),
        R::COLUMNS.join(", "),
        placeholders,
        key_columns.join(", "),
        conflict
    );
    conn.execute(&sql, params_from_iter(record.to_values()))?;

    Ok(if existing.is_some() {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Inserted
    })
}

/// Upsert a record of any kind
pub fn upsert_any(conn: &Connection, record: &AnyRecord) -> StorageResult<UpsertOutcome> {
    with_any_record!(record, r => upsert(conn, r))
}

/// Delete one row; dependents go with it through the schema's cascades
pub fn delete(conn: &Connection, kind: EntityKind, key: &RecordKey) -> StorageResult<bool> {
    check_key(kind, key)?;
    let sql = format!("DELETE FROM {} WHERE {}", kind.table(), key_predicate(kind));
    let removed = conn.execute(&sql, params_from_iter(key.parts()))?;
    Ok(removed > 0)
}
