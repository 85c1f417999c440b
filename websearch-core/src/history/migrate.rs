//! Versioned migration chain for persisted history documents
//!
//! ```text
//! raw JSON -> v0 (legacy) -> v1 -> v2 (current)
//! ```
//!
//! - **v0**: no `version` field; entries carry `id`, `query`, `timestamp` and
//!   `result` but no `runId`/`status`.
//! - **v1**: entries carry `runId` and `status`; still no `version` field.
//! - **v2**: `{ "version": 2, "entries": [...], "maxEntries": n }`.
//!
//! Every step is a pure function over [`serde_json::Value`]. Entries that
//! cannot be upgraded are dropped one by one instead of failing the document.

use serde_json::{json, Map, Value};

use super::types::{HistoryEntry, HistoryStore};

/// Version written by this build
pub const CURRENT_VERSION: u64 = 2;

/// Reasons a document cannot be migrated at all
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    /// Not an object with an `entries` array
    #[error("document is not a search history")]
    NotAHistory,
    /// Written by a newer build
    #[error("history version {0} is newer than {CURRENT_VERSION}")]
    UnsupportedVersion(u64),
}

/// Determine which schema version a raw document was written with.
pub fn detect_version(raw: &Value) -> Result<u64, MigrationError> {
    let obj = raw.as_object().ok_or(MigrationError::NotAHistory)?;
    let entries = obj
        .get("entries")
        .and_then(Value::as_array)
        .ok_or(MigrationError::NotAHistory)?;

    if let Some(version) = obj.get("version").and_then(Value::as_u64) {
        return Ok(version);
    }

    let all_current = entries.iter().all(|e| {
        e.get("runId").map_or(false, Value::is_string)
            && e.get("status").map_or(false, Value::is_string)
    });
    Ok(if all_current { 1 } else { 0 })
}

/// v0 -> v1: synthesize `runId`, `status` and `completedAt` for legacy entries.
pub fn v0_to_v1(raw: Value) -> Value {
    let mut obj = match raw {
        Value::Object(obj) => obj,
        other => return other,
    };

    let entries = match obj.remove("entries") {
        Some(Value::Array(entries)) => entries,
        _ => Vec::new(),
    };

    let upgraded: Vec<Value> = entries.into_iter().filter_map(upgrade_legacy_entry).collect();
    obj.insert("entries".to_string(), Value::Array(upgraded));
    Value::Object(obj)
}

fn upgrade_legacy_entry(entry: Value) -> Option<Value> {
    let Value::Object(mut e) = entry else {
        tracing::warn!("Dropping non-object history entry during migration");
        return None;
    };

    if e.get("runId").map_or(false, Value::is_string)
        && e.get("status").map_or(false, Value::is_string)
    {
        return Some(Value::Object(e));
    }

    let id = e.get("id").and_then(Value::as_str).map(str::to_string);
    let has_query = e.get("query").map_or(false, Value::is_string);
    let timestamp = e.get("timestamp").and_then(Value::as_i64);
    let has_result = e.get("result").map_or(false, Value::is_object);

    match (id, has_query, timestamp, has_result) {
        (Some(id), true, Some(timestamp), true) => {
            e.insert("runId".to_string(), json!(format!("legacy-{}", id)));
            e.insert("status".to_string(), json!("complete"));
            e.insert("completedAt".to_string(), json!(timestamp));
            Some(Value::Object(e))
        }
        _ => {
            let id = e
                .get("id")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("<missing>");
            tracing::warn!(
                id,
                "Dropping legacy history entry that cannot be upgraded"
            );
            None
        }
    }
}

/// v1 -> v2: keep only entries that parse, dedupe by `runId` (newest first
/// wins), normalize `maxEntries` and stamp the version.
///
/// Idempotent, so it also sanitizes current documents with damaged entries.
pub fn v1_to_v2(raw: Value, default_max_entries: usize) -> Value {
    let mut obj = match raw {
        Value::Object(obj) => obj,
        other => return other,
    };

    let entries = match obj.remove("entries") {
        Some(Value::Array(entries)) => entries,
        _ => Vec::new(),
    };

    let mut seen = std::collections::HashSet::new();
    let mut kept = Vec::with_capacity(entries.len());
    for entry in entries {
        match serde_json::from_value::<HistoryEntry>(entry.clone()) {
            Ok(parsed) if seen.insert(parsed.run_id.clone()) => kept.push(entry),
            Ok(parsed) => {
                tracing::debug!(run_id = %parsed.run_id, "Dropping duplicate history entry");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed history entry");
            }
        }
    }

    let max_entries = obj
        .get("maxEntries")
        .and_then(Value::as_u64)
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .unwrap_or(default_max_entries);

    let mut out = Map::new();
    out.insert("version".to_string(), json!(CURRENT_VERSION));
    out.insert("entries".to_string(), Value::Array(kept));
    out.insert("maxEntries".to_string(), json!(max_entries));
    Value::Object(out)
}

/// Run the full chain from whatever version `raw` is at.
pub fn migrate(raw: Value, default_max_entries: usize) -> Result<HistoryStore, MigrationError> {
    let version = detect_version(&raw)?;
    if version > CURRENT_VERSION {
        return Err(MigrationError::UnsupportedVersion(version));
    }

    let mut doc = raw;
    if version < 1 {
        tracing::info!("Migrating history from legacy format");
        doc = v0_to_v1(doc);
    }
    doc = v1_to_v2(doc, default_max_entries);

    let mut store: HistoryStore =
        serde_json::from_value(doc).map_err(|_| MigrationError::NotAHistory)?;
    for entry in &mut store.entries {
        entry.normalize();
    }
    Ok(store)
}
