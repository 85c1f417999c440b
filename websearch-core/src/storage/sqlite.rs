//! SQLite-backed key/value store

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{KeyValueStore, StorageResult};
use crate::error::{Result, StorageError};

/// Key/value store persisted in a single SQLite file (single connection for now)
pub struct SqliteStore {
    conn: Mutex<Connection>,
    quota_bytes: usize,
}

impl SqliteStore {
    /// Open or create a store at the given path and run migrations
    pub fn open(path: &PathBuf, quota_bytes: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        super::schema::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            quota_bytes,
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(quota_bytes: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::schema::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            quota_bytes,
        })
    }

    /// Bytes used by every key except `key`
    fn used_by_others(conn: &Connection, key: &str) -> StorageResult<usize> {
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
             FROM kv WHERE key != ?1",
            [key],
            |r| r.get(0),
        )?;
        Ok(used.max(0) as usize)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .map_err(StorageError::from)
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();

        let needed = Self::used_by_others(&conn, key)? + key.len() + value.len();
        if needed > self.quota_bytes {
            return Err(StorageError::QuotaExceeded {
                needed,
                quota: self.quota_bytes,
            });
        }

        conn.execute(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    fn revision(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT updated_at FROM kv WHERE key = ?1", [key], |row| {
            row.get::<_, Option<String>>(0)
        })
        .optional()
        .map(Option::flatten)
        .map_err(StorageError::from)
    }
}
