//! Local cache handle
//!
//! [`LocalStore`] owns the single SQLite connection. Every mutation goes
//! through [`LocalStore::write`], which runs the caller's closure inside one
//! transaction and, once it commits, publishes a single [`StoreChange`]
//! naming the kinds that were actually touched. A rolled-back closure, or
//! one that only rewrote identical rows, publishes nothing.
//!
//! A file-backed store also keeps a read-only connection. With WAL
//! journaling its reads run alongside a write transaction and only ever
//! observe fully committed data. In-memory stores have a single
//! connection, so their reads wait for the writer.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use tokio::sync::broadcast;
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::record::{self, Record, UpsertOutcome};
use super::schema::{init_schema, needs_init};
use crate::config::Config;
use crate::models::{AnyRecord, EntityKind, RecordKey};

const LAST_FULL_SYNC: &str = "last_full_sync";
const CHANGE_CHANNEL_CAPACITY: usize = 256;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Tables touched by one committed transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreChange {
    pub kinds: BTreeSet<EntityKind>,
    pub pending: bool,
}

impl StoreChange {
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty() && !self.pending
    }

    /// Whether any of `kinds` was touched
    pub fn touches(&self, kinds: &[EntityKind]) -> bool {
        kinds.iter().any(|kind| self.kinds.contains(kind))
    }
}

/// An open write transaction
///
/// Obtained from [`LocalStore::write`]. Dropping it without returning `Ok`
/// from the closure rolls everything back.
pub struct WriteTx<'conn> {
    tx: Transaction<'conn>,
    change: StoreChange,
}

impl<'conn> WriteTx<'conn> {
    fn new(tx: Transaction<'conn>) -> Self {
        Self {
            tx,
            change: StoreChange::default(),
        }
    }

    /// The underlying connection, for reads inside the transaction
    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    pub fn upsert<R: Record>(&mut self, record: &R) -> StorageResult<UpsertOutcome> {
        let outcome = record::upsert(&self.tx, record)?;
        if outcome != UpsertOutcome::Unchanged {
            self.change.kinds.insert(R::KIND);
        }
        Ok(outcome)
    }

    pub fn upsert_any(&mut self, record: &AnyRecord) -> StorageResult<UpsertOutcome> {
        let outcome = record::upsert_any(&self.tx, record)?;
        if outcome != UpsertOutcome::Unchanged {
            self.change.kinds.insert(record.kind());
        }
        Ok(outcome)
    }

    /// Delete a row and, through cascades, everything beneath it
    pub fn delete(&mut self, kind: EntityKind, key: &RecordKey) -> StorageResult<bool> {
        let removed = record::delete(&self.tx, kind, key)?;
        if removed {
            self.change.kinds.insert(kind);
            self.change.kinds.extend(kind.descendants());
        }
        Ok(removed)
    }

    pub fn get<R: Record>(&self, key: &RecordKey) -> StorageResult<Option<R>> {
        record::fetch_one(&self.tx, key)
    }

    pub fn get_any(&self, kind: EntityKind, key: &RecordKey) -> StorageResult<Option<AnyRecord>> {
        record::fetch_any(&self.tx, kind, key)
    }

    pub fn exists(&self, kind: EntityKind, key: &RecordKey) -> StorageResult<bool> {
        record::exists(&self.tx, kind, key)
    }

    pub fn keys(&self, kind: EntityKind) -> StorageResult<Vec<RecordKey>> {
        record::fetch_keys(&self.tx, kind)
    }

    /// Record that the pending-change log was modified
    pub(crate) fn mark_pending(&mut self) {
        self.change.pending = true;
    }

    /// Run `f` under a savepoint
    ///
    /// If `f` fails, its writes are rolled back and forgotten while the
    /// enclosing transaction stays open.
    pub fn savepoint<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let before = self.change.clone();
        self.tx.execute_batch("SAVEPOINT scoped")?;
        match f(self) {
            Ok(value) => {
                self.tx.execute_batch("RELEASE scoped")?;
                Ok(value)
            }
            Err(e) => {
                self.tx
                    .execute_batch("ROLLBACK TO scoped; RELEASE scoped")?;
                self.change = before;
                Err(e)
            }
        }
    }

    fn commit(self) -> StorageResult<StoreChange> {
        self.tx.commit()?;
        Ok(self.change)
    }
}

struct Inner {
    conn: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    changes: broadcast::Sender<StoreChange>,
    path: Option<PathBuf>,
}

/// Handle to the local relational cache
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

impl LocalStore {
    /// Open or create the cache at the configured location
    pub fn open(config: &Config) -> StorageResult<Self> {
        Self::open_at(&config.sqlite_path())
    }

    /// Open or create the cache at a specific path
    pub fn open_at(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
        }

        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(BUSY_TIMEOUT)?;

        debug!("Opened local store at {:?}", path);
        Ok(Self::from_connections(
            conn,
            Some(reader),
            Some(path.to_path_buf()),
        ))
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_schema(&conn)?;
        Ok(Self::from_connections(conn, None, None))
    }

    fn from_connections(
        conn: Connection,
        reader: Option<Connection>,
        path: Option<PathBuf>,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                reader: reader.map(Mutex::new),
                changes,
                path,
            }),
        }
    }

    /// Location of the database file, if file-backed
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.inner.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Run `f` inside one transaction
    ///
    /// Either everything `f` wrote becomes visible, or (when `f` fails)
    /// none of it does.
    pub fn write<T>(&self, f: impl FnOnce(&mut WriteTx<'_>) -> StorageResult<T>) -> StorageResult<T> {
        let (value, change) = {
            let mut conn = self.lock()?;
            let mut tx = WriteTx::new(conn.transaction()?);
            let value = f(&mut tx)?;
            (value, tx.commit()?)
        };

        if !change.is_empty() {
            // No receivers is fine
            let _ = self.inner.changes.send(change);
        }
        Ok(value)
    }

    /// Run a read-only closure against committed data
    ///
    /// Everything `f` reads comes from one snapshot. On a file-backed
    /// store this never waits for a write in progress.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let mut conn = match &self.inner.reader {
            Some(reader) => reader.lock().map_err(|_| StorageError::LockPoisoned)?,
            None => self.lock()?,
        };
        let tx = conn.transaction()?;
        f(&tx)
    }

    /// Receive a [`StoreChange`] after every commit that touched something
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes.subscribe()
    }

    // ==================== Record Operations ====================

    pub fn upsert<R: Record>(&self, record: &R) -> StorageResult<UpsertOutcome> {
        self.write(|tx| tx.upsert(record))
    }

    pub fn delete(&self, kind: EntityKind, key: &RecordKey) -> StorageResult<bool> {
        self.write(|tx| tx.delete(kind, key))
    }

    pub fn get<R: Record>(&self, key: &RecordKey) -> StorageResult<Option<R>> {
        self.read(|conn| record::fetch_one(conn, key))
    }

    pub fn get_any(&self, kind: EntityKind, key: &RecordKey) -> StorageResult<Option<AnyRecord>> {
        self.read(|conn| record::fetch_any(conn, kind, key))
    }

    pub fn fetch_all<R: Record>(&self) -> StorageResult<Vec<R>> {
        self.read(|conn| record::fetch_all::<R>(conn))
    }

    pub fn keys(&self, kind: EntityKind) -> StorageResult<Vec<RecordKey>> {
        self.read(|conn| record::fetch_keys(conn, kind))
    }

    pub fn count(&self, kind: EntityKind) -> StorageResult<i64> {
        self.read(|conn| record::count(conn, kind))
    }

    // ==================== Sync Bookkeeping ====================

    /// When the last complete full sync finished
    pub fn last_full_sync(&self) -> StorageResult<Option<DateTime<Utc>>> {
        self.read(|conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT value FROM sync_meta WHERE key = ?",
                    [LAST_FULL_SYNC],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(value) = value else {
                return Ok(None);
            };
            let millis: i64 = value.parse().map_err(|_| StorageError::CorruptValue {
                table: "sync_meta",
                details: format!("{} = '{}'", LAST_FULL_SYNC, value),
            })?;
            Ok(Utc.timestamp_millis_opt(millis).single())
        })
    }

    pub fn set_last_full_sync(&self, at: DateTime<Utc>) -> StorageResult<()> {
        self.write(|tx| {
            tx.conn().execute(
                "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![LAST_FULL_SYNC, at.timestamp_millis().to_string()],
            )?;
            Ok(())
        })
    }

    /// Remove every cached row, pending change and sync marker
    pub fn clear(&self) -> StorageResult<()> {
        self.write(|tx| {
            // Leaf kinds first keeps each delete free of cascades
            for kind in EntityKind::ALL.iter().rev() {
                let removed = tx
                    .conn()
                    .execute(&format!("DELETE FROM {}", kind.table()), [])?;
                if removed > 0 {
                    tx.change.kinds.insert(*kind);
                }
            }
            let pending = tx.conn().execute("DELETE FROM pending_changes", [])?;
            if pending > 0 {
                tx.mark_pending();
            }
            tx.conn().execute("DELETE FROM sync_meta", [])?;
            Ok(())
        })
    }
}
