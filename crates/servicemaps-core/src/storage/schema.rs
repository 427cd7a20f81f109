//! SQLite schema for the local cache
//!
//! One table per mirrored entity kind, keyed by the kind's primary (or
//! composite) key, plus the pending-change log and a small key/value
//! table for sync bookkeeping. Parent links cascade on delete so a
//! removed territory takes its addresses, houses and visits with it.

use rusqlite::{Connection, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Sync bookkeeping (last full sync, ...)
        CREATE TABLE IF NOT EXISTS sync_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Territory hierarchy
        CREATE TABLE IF NOT EXISTS territories (
            id TEXT PRIMARY KEY,
            congregation TEXT NOT NULL,
            number INTEGER NOT NULL,
            description TEXT NOT NULL,
            image TEXT
        );

        CREATE TABLE IF NOT EXISTS territory_addresses (
            id TEXT PRIMARY KEY,
            territory TEXT NOT NULL,
            address TEXT NOT NULL,
            floors INTEGER,
            FOREIGN KEY (territory) REFERENCES territories(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS houses (
            id TEXT PRIMARY KEY,
            territory_address TEXT NOT NULL,
            number TEXT NOT NULL,
            floor TEXT,
            FOREIGN KEY (territory_address) REFERENCES territory_addresses(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS visits (
            id TEXT PRIMARY KEY,
            house TEXT NOT NULL,
            date INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            notes TEXT NOT NULL,
            user TEXT NOT NULL,
            FOREIGN KEY (house) REFERENCES houses(id) ON DELETE CASCADE
        );

        -- Phone hierarchy
        CREATE TABLE IF NOT EXISTS phone_territories (
            id TEXT PRIMARY KEY,
            congregation TEXT NOT NULL,
            number INTEGER NOT NULL,
            description TEXT NOT NULL,
            image TEXT
        );

        CREATE TABLE IF NOT EXISTS phone_numbers (
            id TEXT PRIMARY KEY,
            congregation TEXT NOT NULL,
            number TEXT NOT NULL,
            territory TEXT NOT NULL,
            house TEXT,
            FOREIGN KEY (territory) REFERENCES phone_territories(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS phone_calls (
            id TEXT PRIMARY KEY,
            phonenumber TEXT NOT NULL,
            date INTEGER NOT NULL,
            notes TEXT NOT NULL,
            user TEXT NOT NULL,
            FOREIGN KEY (phonenumber) REFERENCES phone_numbers(id) ON DELETE CASCADE
        );

        -- Access keys
        CREATE TABLE IF NOT EXISTS tokens (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            owner TEXT NOT NULL,
            congregation TEXT NOT NULL,
            moderator INTEGER NOT NULL,
            expire INTEGER,
            user TEXT
        );

        -- Territory side is not enforced: grants may name territories
        -- outside the caller's scope
        CREATE TABLE IF NOT EXISTS token_territories (
            token TEXT NOT NULL,
            territory TEXT NOT NULL,
            PRIMARY KEY (token, territory),
            FOREIGN KEY (token) REFERENCES tokens(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS user_tokens (
            token TEXT NOT NULL,
            user_id TEXT NOT NULL,
            name TEXT NOT NULL,
            blocked INTEGER NOT NULL,
            PRIMARY KEY (token, user_id),
            FOREIGN KEY (token) REFERENCES tokens(id) ON DELETE CASCADE
        );

        -- Recalls are identified by (user, house); `id` is the server surrogate
        CREATE TABLE IF NOT EXISTS recalls (
            user TEXT NOT NULL,
            house TEXT NOT NULL,
            id INTEGER NOT NULL,
            PRIMARY KEY (user, house)
        );

        -- Local mutations not yet confirmed by the server, one per entity
        CREATE TABLE IF NOT EXISTS pending_changes (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            action TEXT NOT NULL,
            target TEXT NOT NULL,
            payload TEXT,
            revision INTEGER NOT NULL DEFAULT 0,
            attempted INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE (kind, target)
        );

        -- Indexes on parent references for cascades and projections
        CREATE INDEX IF NOT EXISTS idx_addresses_territory ON territory_addresses(territory);
        CREATE INDEX IF NOT EXISTS idx_houses_address ON houses(territory_address);
        CREATE INDEX IF NOT EXISTS idx_visits_house ON visits(house);
        CREATE INDEX IF NOT EXISTS idx_visits_date ON visits(date);
        CREATE INDEX IF NOT EXISTS idx_phone_numbers_territory ON phone_numbers(territory);
        CREATE INDEX IF NOT EXISTS idx_phone_calls_number ON phone_calls(phonenumber);
        CREATE INDEX IF NOT EXISTS idx_token_territories_territory ON token_territories(territory);
        CREATE INDEX IF NOT EXISTS idx_recalls_house ON recalls(house);
        "#,
    )?;

    // Version 1 logs predate upload tracking
    let has_attempted = conn
        .prepare("SELECT 1 FROM pragma_table_info('pending_changes') WHERE name = 'attempted'")?
        .exists([])?;
    if !has_attempted {
        conn.execute_batch(
            "ALTER TABLE pending_changes ADD COLUMN attempted INTEGER NOT NULL DEFAULT 0;",
        )?;
    }

    // Set schema version
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_info WHERE key = 'version'")?;
    let result: Result<String> = stmt.query_row([], |row| row.get(0));

    match result {
        Ok(version_str) => Ok(version_str.parse().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check if schema needs initialization or migration
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}
