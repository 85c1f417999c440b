//! History service: load, save and guarded mutations

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::migrate::{self, MigrationError, CURRENT_VERSION};
use super::types::{HistoryChange, HistoryEntry, HistoryStatus, HistoryStore, TerminalOutcome};
use crate::error::StorageError;
use crate::storage::{KeyValueStore, MemoryStore, HISTORY_BACKUP_KEY, HISTORY_KEY};

/// Document written under [`HISTORY_KEY`]
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedHistory<'a> {
    version: u64,
    entries: &'a [HistoryEntry],
    max_entries: usize,
}

/// What storage currently holds under [`HISTORY_KEY`]
enum Stored {
    Absent,
    Usable(HistoryStore),
    /// Written by a newer build; this build never overwrites it
    Newer(u64),
    /// Unreadable payload, kept verbatim so it can be backed up
    Corrupt(String),
}

/// Persistent, capacity-bounded search history.
///
/// Every read goes back to storage and every mutation is re-persisted
/// immediately. Persistence failures are logged and reported as "not saved";
/// they never propagate to callers.
///
/// A mutation only writes when it could read the current document first. A
/// failed read, or a document written by a newer build, leaves storage
/// untouched; an unreadable document is copied to [`HISTORY_BACKUP_KEY`]
/// before it is replaced.
pub struct History {
    storage: Arc<dyn KeyValueStore>,
    max_entries: usize,
    degraded: bool,
    /// Serializes load-modify-save cycles
    write_lock: Mutex<()>,
    /// Storage revision as of this instance's last read or write
    seen_revision: Mutex<Option<String>>,
    changes: broadcast::Sender<HistoryChange>,
}

impl History {
    /// Open the history on `storage`.
    ///
    /// If the storage does not accept writes, the history falls back to an
    /// in-memory store for the rest of the session.
    pub fn open(storage: Arc<dyn KeyValueStore>, max_entries: usize) -> Self {
        let (storage, degraded) = match storage.probe() {
            Ok(()) => (storage, false),
            Err(e) => {
                tracing::warn!(error = %e, "Storage not available, history will not survive restart");
                (Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>, true)
            }
        };

        let seen_revision = storage.revision(HISTORY_KEY).ok().flatten();
        let (changes, _) = broadcast::channel(64);
        Self {
            storage,
            max_entries: max_entries.max(1),
            degraded,
            write_lock: Mutex::new(()),
            seen_revision: Mutex::new(seen_revision),
            changes,
        }
    }

    /// History kept only in memory (for testing and degraded sessions)
    pub fn in_memory(max_entries: usize) -> Self {
        Self::open(Arc::new(MemoryStore::new()), max_entries)
    }

    /// True when running on the in-memory fallback because storage was unavailable
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Receive a notification after every successful mutation.
    ///
    /// Observers should re-[`load`](Self::load) rather than patch a cached copy.
    /// Writes by other processes are only reported once
    /// [`check_external`](Self::check_external) notices them.
    pub fn subscribe(&self) -> broadcast::Receiver<HistoryChange> {
        self.changes.subscribe()
    }

    /// Publish [`HistoryChange::External`] if the stored history was rewritten
    /// by someone other than this instance since it last looked.
    ///
    /// Returns whether a change was detected.
    pub fn check_external(&self) -> bool {
        let _guard = self.write_lock.lock().unwrap();
        let current = match self.storage.revision(HISTORY_KEY) {
            Ok(revision) => revision,
            Err(e) => {
                tracing::debug!(error = %e, "Could not read history revision");
                return false;
            }
        };

        let mut seen = self.seen_revision.lock().unwrap();
        if *seen == current {
            return false;
        }
        *seen = current;
        drop(seen);

        tracing::debug!("Search history changed outside this process");
        self.notify(HistoryChange::External);
        true
    }

    /// Run [`check_external`](Self::check_external) every `interval` until the
    /// returned guard is dropped or the history itself goes away.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch_external(self: &Arc<Self>, interval: Duration) -> ExternalWatch {
        let history = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(history) = history.upgrade() else {
                    break;
                };
                history.check_external();
            }
        });
        ExternalWatch { task }
    }

    // ============================================
    // Load / save
    // ============================================

    /// Read the history from storage.
    ///
    /// Missing data yields an empty store; data that fails validation is
    /// migrated; data that cannot be read or migrated yields an empty store.
    pub fn load(&self) -> HistoryStore {
        let stored = self.read_stored().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read search history, using empty history");
            Stored::Absent
        });

        let mut store = match stored {
            Stored::Usable(store) => store,
            Stored::Absent | Stored::Newer(_) | Stored::Corrupt(_) => {
                HistoryStore::empty(self.max_entries)
            }
        };
        store.max_entries = self.max_entries;
        store
    }

    /// Read the history at the start of a load-modify-save cycle.
    ///
    /// `None` means the cycle must not write: storage could not be read (after
    /// one retry), holds a newer document, or holds an unreadable document
    /// that could not be backed up.
    fn load_for_write(&self) -> Option<HistoryStore> {
        let stored = match self.read_stored() {
            Ok(stored) => stored,
            Err(first) => {
                tracing::debug!(error = %first, "History read failed, retrying once");
                match self.read_stored() {
                    Ok(stored) => stored,
                    Err(e) => {
                        tracing::error!(error = %e, "Cannot read search history, change not saved");
                        return None;
                    }
                }
            }
        };

        let mut store = match stored {
            Stored::Absent => HistoryStore::empty(self.max_entries),
            Stored::Usable(store) => store,
            Stored::Newer(version) => {
                tracing::warn!(
                    version,
                    "Search history was written by a newer version, leaving it untouched"
                );
                return None;
            }
            Stored::Corrupt(raw) => {
                if let Err(e) = self.storage.set(HISTORY_BACKUP_KEY, &raw) {
                    tracing::error!(
                        error = %e,
                        "Failed to back up unreadable search history, change not saved"
                    );
                    return None;
                }
                tracing::warn!(
                    backup_key = HISTORY_BACKUP_KEY,
                    bytes = raw.len(),
                    "Backed up unreadable search history before replacing it"
                );
                HistoryStore::empty(self.max_entries)
            }
        };
        store.max_entries = self.max_entries;
        Some(store)
    }

    fn read_stored(&self) -> Result<Stored, StorageError> {
        match self.storage.get(HISTORY_KEY)? {
            Some(raw) => Ok(self.parse(raw)),
            None => Ok(Stored::Absent),
        }
    }

    fn parse(&self, raw: String) -> Stored {
        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "Stored search history is not valid JSON");
                return Stored::Corrupt(raw);
            }
        };

        let is_current = value.get("version").and_then(|v| v.as_u64()) == Some(CURRENT_VERSION);
        if is_current {
            if let Ok(store) = serde_json::from_value::<HistoryStore>(value.clone()) {
                if store.entries.iter().all(is_consistent) {
                    return Stored::Usable(store);
                }
            }
        }

        match migrate::migrate(value, self.max_entries) {
            Ok(store) => {
                tracing::info!(entries = store.entries.len(), "Migrated stored search history");
                Stored::Usable(store)
            }
            Err(MigrationError::UnsupportedVersion(version)) => {
                tracing::warn!(version, "Stored search history is from a newer version");
                Stored::Newer(version)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Invalid history data found");
                Stored::Corrupt(raw)
            }
        }
    }

    /// Persist `store`, trimmed to the configured capacity.
    ///
    /// On a quota failure the write is retried once with half the entries,
    /// keeping the newest ones. Returns whether anything was saved.
    pub fn save(&self, store: &HistoryStore) -> bool {
        let mut store = store.clone();
        self.persist(&mut store)
    }

    /// Like [`save`](Self::save), but truncates `store` to what was written.
    fn persist(&self, store: &mut HistoryStore) -> bool {
        store.max_entries = self.max_entries;
        store.entries.truncate(self.max_entries);

        match self.write(&store.entries) {
            Ok(()) => true,
            Err(StorageError::QuotaExceeded { needed, quota }) => {
                let keep = (store.entries.len() / 2).max(1);
                tracing::warn!(
                    needed,
                    quota,
                    keep,
                    "Storage quota exceeded, retrying with fewer history entries"
                );
                match self.write(&store.entries[..keep.min(store.entries.len())]) {
                    Ok(()) => {
                        store.entries.truncate(keep);
                        true
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to save reduced search history");
                        false
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to save search history");
                false
            }
        }
    }

    fn write(&self, entries: &[HistoryEntry]) -> Result<(), StorageError> {
        let doc = PersistedHistory {
            version: CURRENT_VERSION,
            entries,
            max_entries: self.max_entries,
        };
        let json = serde_json::to_string(&doc).map_err(|e| StorageError::Backend(e.to_string()))?;
        self.storage.set(HISTORY_KEY, &json)?;

        // Our own write is not an external change
        *self.seen_revision.lock().unwrap() = self.storage.revision(HISTORY_KEY).ok().flatten();
        Ok(())
    }

    fn notify(&self, change: HistoryChange) {
        // No receivers is fine
        let _ = self.changes.send(change);
    }

    // ============================================
    // Mutations
    // ============================================

    /// Record a freshly triggered run as `processing`.
    ///
    /// Any previous entry with the same `run_id` is replaced.
    pub fn add_processing(
        &self,
        query: &str,
        run_id: &str,
        model: Option<&str>,
        write_model: Option<&str>,
    ) -> HistoryEntry {
        let entry = HistoryEntry {
            id: generate_id(),
            query: query.trim().to_string(),
            run_id: run_id.to_string(),
            status: HistoryStatus::Processing,
            result: None,
            error: None,
            timestamp: now_ms(),
            completed_at: None,
            model: model.map(str::to_string),
            write_model: write_model.map(str::to_string),
        };
        self.insert(entry.clone());
        entry
    }

    fn insert(&self, entry: HistoryEntry) {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut store) = self.load_for_write() else {
            return;
        };
        store.entries.retain(|e| e.run_id != entry.run_id);
        let run_id = entry.run_id.clone();
        store.entries.insert(0, entry);

        if self.persist(&mut store) {
            tracing::debug!(run_id = %run_id, "Added history entry");
            self.notify(HistoryChange::Added { run_id });
        }
    }

    /// Move the entry for `run_id` to a terminal status.
    ///
    /// A no-op when the entry is missing or already terminal, so duplicate
    /// terminal events from the live stream and a reconciliation poll are safe.
    pub fn update_status(&self, run_id: &str, outcome: TerminalOutcome) -> HistoryStore {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut store) = self.load_for_write() else {
            return self.load();
        };

        let Some(entry) = store.entries.iter_mut().find(|e| e.run_id == run_id) else {
            tracing::debug!(run_id = %run_id, "No history entry to update");
            return store;
        };

        let status = outcome.status();
        if !entry.finalize(outcome, now_ms()) {
            tracing::debug!(
                run_id = %run_id,
                current = %entry.status,
                ignored = %status,
                "History entry already terminal, ignoring update"
            );
            return store;
        }

        if self.persist(&mut store) {
            tracing::info!(run_id = %run_id, status = %status, "History entry finalized");
            self.notify(HistoryChange::Updated {
                run_id: run_id.to_string(),
                status,
            });
        }
        store
    }

    /// Remove one entry by id
    pub fn delete(&self, id: &str) -> HistoryStore {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut store) = self.load_for_write() else {
            return self.load();
        };
        let before = store.entries.len();
        store.entries.retain(|e| e.id != id);

        if store.entries.len() != before && self.persist(&mut store) {
            self.notify(HistoryChange::Deleted { id: id.to_string() });
        }
        store
    }

    /// Remove every entry
    pub fn clear(&self) -> HistoryStore {
        let _guard = self.write_lock.lock().unwrap();
        let Some(mut store) = self.load_for_write() else {
            return self.load();
        };
        store.entries.clear();
        if self.persist(&mut store) {
            self.notify(HistoryChange::Cleared);
        }
        store
    }

    // ============================================
    // Queries
    // ============================================

    /// Entries still believed to be running
    pub fn list_processing(&self) -> Vec<HistoryEntry> {
        self.by_status(HistoryStatus::Processing)
    }

    pub fn find_by_run_id(&self, run_id: &str) -> Option<HistoryEntry> {
        self.load().entries.into_iter().find(|e| e.run_id == run_id)
    }

    /// Get entry by ID
    pub fn get(&self, id: &str) -> Option<HistoryEntry> {
        self.load().entries.into_iter().find(|e| e.id == id)
    }

    /// The `count` most recent entries
    pub fn recent(&self, count: usize) -> Vec<HistoryEntry> {
        let mut entries = self.load().entries;
        entries.truncate(count);
        entries
    }

    /// Case-insensitive substring search over queries; a blank term returns everything
    pub fn search(&self, term: &str) -> Vec<HistoryEntry> {
        let entries = self.load().entries;
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return entries;
        }
        entries
            .into_iter()
            .filter(|e| e.query.to_lowercase().contains(&term))
            .collect()
    }

    pub fn by_status(&self, status: HistoryStatus) -> Vec<HistoryEntry> {
        self.load()
            .entries
            .into_iter()
            .filter(|e| e.status == status)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background [`History::check_external`] loop; stops when dropped
pub struct ExternalWatch {
    task: JoinHandle<()>,
}

impl Drop for ExternalWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn is_consistent(entry: &HistoryEntry) -> bool {
    let payload_ok = match entry.status {
        HistoryStatus::Processing => entry.result.is_none() && entry.error.is_none(),
        HistoryStatus::Complete => entry.result.is_some() && entry.error.is_none(),
        HistoryStatus::Failed | HistoryStatus::Canceled => {
            entry.error.is_some() && entry.result.is_none()
        }
    };
    let completed_ok = entry.completed_at.map_or(true, |c| c >= entry.timestamp);
    payload_ok && completed_ok
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// `<epoch millis>-<9 random chars>`: unique and ordered by creation time
fn generate_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now_ms(), &random[..9])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::SearchOutput;
    use crate::storage::{KeyValueStore, StorageResult};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn history_on(store: &Arc<MemoryStore>, max_entries: usize) -> History {
        History::open(store.clone() as Arc<dyn KeyValueStore>, max_entries)
    }

    /// Memory store whose next `failing_reads` reads fail
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing_reads: AtomicUsize,
    }

    impl FlakyStore {
        fn fail_next_reads(&self, count: usize) {
            self.failing_reads.store(count, Ordering::SeqCst);
        }
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> StorageResult<Option<String>> {
            let failing = self.failing_reads.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_reads.store(failing - 1, Ordering::SeqCst);
                return Err(StorageError::Backend("disk I/O error".to_string()));
            }
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> StorageResult<()> {
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> StorageResult<()> {
            self.inner.remove(key)
        }
    }

    fn seeded_flaky_history(count: usize) -> (Arc<FlakyStore>, History) {
        let storage = Arc::new(FlakyStore::default());
        let history = History::open(storage.clone() as Arc<dyn KeyValueStore>, 50);
        for i in 0..count {
            history.add_processing(&format!("query {}", i), &format!("run_{}", i), None, None);
        }
        (storage, history)
    }

    fn complete(answer: &str) -> TerminalOutcome {
        TerminalOutcome::Complete(SearchOutput {
            answer: Some(answer.to_string()),
            conversation: vec![],
        })
    }

    #[test]
    fn test_empty_when_nothing_stored() {
        let history = History::in_memory(50);
        let store = history.load();
        assert!(store.entries.is_empty());
        assert_eq!(store.max_entries, 50);
    }

    #[test]
    fn test_add_processing_listed_until_finalized() {
        let history = History::in_memory(50);
        let entry = history.add_processing("  rust async  ", "run_1", Some("m"), None);
        assert_eq!(entry.query, "rust async");
        assert_eq!(entry.status, HistoryStatus::Processing);

        let processing = history.list_processing();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].run_id, "run_1");

        history.update_status("run_1", complete("X"));
        assert!(history.list_processing().is_empty());
    }

    #[test]
    fn test_duplicate_run_id_replaces_entry() {
        let history = History::in_memory(50);
        history.add_processing("first", "run_1", None, None);
        history.add_processing("other", "run_2", None, None);
        history.add_processing("second", "run_1", None, None);

        let store = history.load();
        assert_eq!(store.entries.len(), 2);
        assert_eq!(store.entries[0].query, "second");
        assert_eq!(
            store.entries.iter().filter(|e| e.run_id == "run_1").count(),
            1
        );
    }

    #[test]
    fn test_update_status_is_idempotent() {
        let history = History::in_memory(50);
        history.add_processing("q", "run_1", None, None);

        history.update_status("run_1", complete("X"));
        let first = history.find_by_run_id("run_1").unwrap();

        history.update_status("run_1", complete("Y"));
        history.update_status("run_1", TerminalOutcome::Failed("boom".to_string()));
        let after = history.find_by_run_id("run_1").unwrap();

        assert_eq!(first, after);
        assert_eq!(after.status, HistoryStatus::Complete);
        assert!(after.completed_at.unwrap() >= after.timestamp);
    }

    #[test]
    fn test_update_unknown_run_is_noop() {
        let history = History::in_memory(50);
        history.add_processing("q", "run_1", None, None);
        let store = history.update_status("missing", complete("X"));
        assert_eq!(store.entries.len(), 1);
        assert_eq!(store.entries[0].status, HistoryStatus::Processing);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let history = History::in_memory(3);
        for i in 0..5 {
            history.add_processing(&format!("q{}", i), &format!("run_{}", i), None, None);
        }
        let store = history.load();
        assert_eq!(store.entries.len(), 3);
        let runs: Vec<_> = store.entries.iter().map(|e| e.run_id.as_str()).collect();
        assert_eq!(runs, vec!["run_4", "run_3", "run_2"]);
    }

    #[test]
    fn test_save_trims_to_max_entries() {
        let history = History::in_memory(2);
        let mut store = HistoryStore::empty(2);
        for i in 0..4 {
            store.entries.push(HistoryEntry {
                id: format!("id{}", i),
                query: "q".to_string(),
                run_id: format!("r{}", i),
                status: HistoryStatus::Processing,
                result: None,
                error: None,
                timestamp: i,
                completed_at: None,
                model: None,
                write_model: None,
            });
        }
        assert!(history.save(&store));
        assert_eq!(history.load().entries.len(), 2);
    }

    #[test]
    fn test_quota_failure_retries_with_half_keeping_newest() {
        let storage = Arc::new(MemoryStore::with_quota(1200));
        let history = history_on(&storage, 50);
        for i in 0..12 {
            history.add_processing(&format!("query number {}", i), &format!("run_{}", i), None, None);
        }

        let store = history.load();
        assert!(!store.entries.is_empty());
        assert!(store.entries.len() < 12);
        assert_eq!(store.entries[0].run_id, "run_11");
    }

    #[test]
    fn test_disabled_storage_degrades_to_memory() {
        let history = History::open(Arc::new(MemoryStore::disabled()), 50);
        assert!(history.is_degraded());
        history.add_processing("q", "run_1", None, None);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_load_save_roundtrip_is_stable() {
        let storage = Arc::new(MemoryStore::new());
        let history = history_on(&storage, 50);
        history.add_processing("a", "run_a", Some("m"), Some("w"));
        history.add_processing("b", "run_b", None, None);
        history.update_status("run_a", TerminalOutcome::Canceled("Task was canceled".into()));

        history.save(&history.load());
        let once = storage.get(HISTORY_KEY).unwrap();
        history.save(&history.load());
        let twice = storage.get(HISTORY_KEY).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_legacy_document_is_migrated_on_load() {
        let storage = Arc::new(MemoryStore::new());
        let legacy = json!({
            "entries": [
                {"id": "2", "query": "new", "timestamp": 2000, "result": {"answer": "b", "conversation": []}},
                {"id": "1", "query": "old", "timestamp": 1000, "result": {"answer": "a", "conversation": []}}
            ],
            "maxEntries": 50
        });
        storage.set(HISTORY_KEY, &legacy.to_string()).unwrap();

        let history = history_on(&storage, 50);
        let store = history.load();
        assert_eq!(store.entries.len(), 2);
        for entry in &store.entries {
            assert_eq!(entry.status, HistoryStatus::Complete);
            assert!(entry.run_id.starts_with("legacy-"));
        }
    }

    #[test]
    fn test_garbage_loads_as_empty() {
        let storage = Arc::new(MemoryStore::new());
        storage.set(HISTORY_KEY, "not json at all").unwrap();
        let history = history_on(&storage, 50);
        assert!(history.load().entries.is_empty());

        storage.set(HISTORY_KEY, "[1,2,3]").unwrap();
        assert!(history.load().entries.is_empty());
    }

    #[test]
    fn test_single_failed_read_does_not_lose_entries() {
        let (storage, history) = seeded_flaky_history(5);

        storage.fail_next_reads(1);
        history.add_processing("after hiccup", "run_new", None, None);

        let store = history.load();
        assert_eq!(store.entries.len(), 6);
        assert_eq!(store.entries[0].run_id, "run_new");
    }

    #[test]
    fn test_unreadable_storage_aborts_mutations() {
        let (storage, history) = seeded_flaky_history(5);
        let before = storage.inner.get(HISTORY_KEY).unwrap();
        let mut rx = history.subscribe();

        storage.fail_next_reads(usize::MAX);
        history.add_processing("lost write", "run_new", None, None);
        history.update_status("run_0", complete("X"));
        history.delete("whatever");
        history.clear();

        assert_eq!(storage.inner.get(HISTORY_KEY).unwrap(), before);
        assert!(rx.try_recv().is_err());

        storage.fail_next_reads(0);
        assert_eq!(history.len(), 5);
        assert!(history.find_by_run_id("run_new").is_none());
    }

    #[test]
    fn test_newer_document_is_never_overwritten() {
        let storage = Arc::new(MemoryStore::new());
        let newer = json!({
            "version": 3,
            "entries": [
                {"id": "1", "query": "kept by newer build", "runId": "run_x", "status": "archived", "timestamp": 1}
            ],
            "maxEntries": 50,
            "shards": 4
        })
        .to_string();
        storage.set(HISTORY_KEY, &newer).unwrap();

        let history = history_on(&storage, 50);
        history.add_processing("from older build", "run_old", None, None);
        history.clear();

        assert_eq!(storage.get(HISTORY_KEY).unwrap().as_deref(), Some(newer.as_str()));
        assert!(history.load().entries.is_empty());
    }

    #[test]
    fn test_corrupt_document_is_backed_up_before_write() {
        let storage = Arc::new(MemoryStore::new());
        storage.set(HISTORY_KEY, "{\"entries\": [truncated").unwrap();

        let history = history_on(&storage, 50);
        history.add_processing("fresh start", "run_1", None, None);

        assert_eq!(
            storage.get(HISTORY_BACKUP_KEY).unwrap().as_deref(),
            Some("{\"entries\": [truncated")
        );
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_corrupt_document_kept_when_backup_fails() {
        let raw = "x".repeat(300);
        let storage = Arc::new(MemoryStore::with_quota(500));
        storage.set(HISTORY_KEY, &raw).unwrap();

        let history = history_on(&storage, 50);
        history.add_processing("fresh start", "run_1", None, None);

        assert_eq!(storage.get(HISTORY_KEY).unwrap().as_deref(), Some(raw.as_str()));
        assert_eq!(storage.get(HISTORY_BACKUP_KEY).unwrap(), None);
    }

    #[test]
    fn test_quota_smaller_than_one_entry_keeps_existing_data() {
        let storage = Arc::new(MemoryStore::with_quota(600));
        let history = history_on(&storage, 50);
        history.add_processing("short", "run_1", None, None);
        let before = storage.get(HISTORY_KEY).unwrap();
        assert!(before.is_some());
        let mut rx = history.subscribe();

        history.add_processing(&"a".repeat(2000), "run_2", None, None);

        assert_eq!(storage.get(HISTORY_KEY).unwrap(), before);
        assert_eq!(history.len(), 1);
        assert_eq!(history.load().entries[0].run_id, "run_1");
        assert!(rx.try_recv().is_err());

        let mut oversized = history.load();
        oversized.entries[0].query = "b".repeat(2000);
        assert!(!history.save(&oversized));
        assert_eq!(storage.get(HISTORY_KEY).unwrap(), before);
    }

    #[test]
    fn test_external_write_is_reported_once() {
        let storage = Arc::new(MemoryStore::new());
        let ours = history_on(&storage, 50);
        let theirs = history_on(&storage, 50);
        let mut rx = ours.subscribe();

        // Our own writes are not external
        ours.add_processing("mine", "run_1", None, None);
        assert_eq!(rx.try_recv().unwrap(), HistoryChange::Added { run_id: "run_1".into() });
        assert!(!ours.check_external());

        theirs.update_status("run_1", complete("done elsewhere"));
        assert!(ours.check_external());
        assert_eq!(rx.try_recv().unwrap(), HistoryChange::External);
        assert!(!ours.check_external());
        assert!(rx.try_recv().is_err());

        assert_eq!(
            ours.find_by_run_id("run_1").unwrap().status,
            HistoryStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_watch_external_publishes_changes() {
        let storage = Arc::new(MemoryStore::new());
        let ours = Arc::new(history_on(&storage, 50));
        let theirs = history_on(&storage, 50);
        let mut rx = ours.subscribe();

        let watch = ours.watch_external(Duration::from_millis(10));
        theirs.add_processing("elsewhere", "run_9", None, None);

        let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("external change noticed")
            .unwrap();
        assert_eq!(change, HistoryChange::External);
        drop(watch);
    }

    #[test]
    fn test_queries() {
        let history = History::in_memory(50);
        let a = history.add_processing("Rust Async", "run_a", None, None);
        history.add_processing("python typing", "run_b", None, None);
        history.update_status("run_b", TerminalOutcome::Failed("x".into()));

        assert_eq!(history.search("rust").len(), 1);
        assert_eq!(history.search("  ").len(), 2);
        assert_eq!(history.recent(1)[0].run_id, "run_b");
        assert_eq!(history.by_status(HistoryStatus::Failed).len(), 1);
        assert_eq!(history.get(&a.id).unwrap().run_id, "run_a");

        history.delete(&a.id);
        assert!(history.get(&a.id).is_none());
        history.clear();
        assert!(history.is_empty());
    }

    #[test]
    fn test_changes_are_broadcast() {
        let history = History::in_memory(50);
        let mut rx = history.subscribe();

        history.add_processing("q", "run_1", None, None);
        history.update_status("run_1", complete("X"));
        // Second terminal write is a no-op and publishes nothing
        history.update_status("run_1", complete("Y"));
        history.clear();

        assert_eq!(
            rx.try_recv().unwrap(),
            HistoryChange::Added { run_id: "run_1".into() }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            HistoryChange::Updated {
                run_id: "run_1".into(),
                status: HistoryStatus::Complete
            }
        );
        assert_eq!(rx.try_recv().unwrap(), HistoryChange::Cleared);
        assert!(rx.try_recv().is_err());
    }
}
