//! SQLite layout of the key/value store
//!
//! Migrations are embedded and tracked through `PRAGMA user_version`.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: key/value table
    r#"
    CREATE TABLE IF NOT EXISTS kv (
        key              TEXT PRIMARY KEY,
        value            TEXT NOT NULL
    );
    "#,
    // Version 2: write times, read back as the key's revision
    r#"
    ALTER TABLE kv ADD COLUMN updated_at DATETIME;
    UPDATE kv SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE updated_at IS NULL;
    "#,
];

/// Apply every migration newer than the file's `user_version`.
///
/// Each step commits together with its version bump, so an interrupted
/// upgrade resumes at the failed step on the next open.
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let from = get_schema_version(conn)?;
    if from >= SCHEMA_VERSION {
        return Ok(());
    }

    for (version, sql) in (1..).zip(MIGRATIONS.iter()).skip(from.max(0) as usize) {
        tracing::debug!(version, "Applying storage migration");
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    tracing::info!(from, to = SCHEMA_VERSION, "Storage schema upgraded");
    Ok(())
}

/// `PRAGMA user_version` of an open storage file
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |r| r.get(0))?)
}
