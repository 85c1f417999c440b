//! Local search history
//!
//! A size-bounded, newest-first record of submitted tasks persisted as one
//! document in a [`KeyValueStore`](crate::storage::KeyValueStore).
//!
//! The history is the single shared mutable resource of the client. Both the
//! live monitor (push events) and reconciliation (polling) finalize entries
//! through [`History::update_status`], whose guarded transition makes the
//! first terminal write win and every later one a no-op.

pub mod migrate;
mod store;
mod types;

pub use store::{ExternalWatch, History};
pub use types::{
    ConversationMessage, HistoryChange, HistoryEntry, HistoryStatus, HistoryStore,
    SearchOutput, TerminalOutcome, ToolCall, ToolFunction,
};
