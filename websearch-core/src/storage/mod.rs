//! Key/value persistence for client-side state
//!
//! Everything the client persists lives under a handful of well-known keys,
//! each holding one serialized document:
//! - [`HISTORY_KEY`]: the search history aggregate
//! - [`THEME_KEY`]: the theme preference string
//! - [`HISTORY_BACKUP_KEY`]: the last unreadable history document, saved
//!   before it is replaced
//!
//! Two backends are provided: [`SqliteStore`] for durable on-disk storage and
//! [`MemoryStore`] for degraded sessions and tests.

pub mod schema;
mod sqlite;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::StorageError;

pub use sqlite::SqliteStore;

/// Storage key of the search history document
pub const HISTORY_KEY: &str = "websearch-history";

/// Storage key holding an unreadable history document before it is overwritten
pub const HISTORY_BACKUP_KEY: &str = "websearch-history-backup";

/// Storage key of the theme preference
pub const THEME_KEY: &str = "websearch-agent-theme";

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A string-keyed, string-valued persistent store.
pub trait KeyValueStore: Send + Sync {
    /// Read the value under `key`, if any.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Write `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Delete `key`. Missing keys are not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Opaque marker that changes whenever `key` is written, by any writer.
    ///
    /// The default compares whole values; backends that track write times
    /// should return those instead.
    fn revision(&self, key: &str) -> StorageResult<Option<String>> {
        self.get(key)
    }

    /// Check that the store accepts writes right now.
    fn probe(&self) -> StorageResult<()> {
        const PROBE_KEY: &str = "__storage_probe__";
        self.set(PROBE_KEY, PROBE_KEY)?;
        self.remove(PROBE_KEY)
    }
}

/// In-process store with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
    disabled: bool,
}

impl MemoryStore {
    /// Unlimited in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory store that rejects writes pushing the total over `quota_bytes`
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// A store that behaves like disabled browser storage: every call fails.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }

    fn check_enabled(&self) -> StorageResult<()> {
        if self.disabled {
            return Err(StorageError::Unavailable("storage is disabled".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.check_enabled()?;
        let values = self.values.lock().unwrap();
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.check_enabled()?;
        let mut values = self.values.lock().unwrap();

        if let Some(quota) = self.quota_bytes {
            let others: usize = values
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            let needed = others + key.len() + value.len();
            if needed > quota {
                return Err(StorageError::QuotaExceeded { needed, quota });
            }
        }

        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.check_enabled()?;
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}
