//! # websearch-core
//!
//! Core library for websearch - a client for a remote web search agent.
//!
//! This library provides:
//! - Persistent, size-bounded search history with schema migration
//! - A client for the remote task platform
//! - Reconciliation of locally running tasks against remote truth
//! - A live monitor for the active task, built on a pure state reducer
//! - Configuration, logging and theme preference
//!
//! ## Task lifecycle
//!
//! A search is triggered, recorded as `processing`, then finalized exactly
//! once. Two independent paths can finalize a run:
//! - **Push:** the [`LiveMonitor`] receives a terminal event on the run's stream
//! - **Poll:** the [`Reconciler`] finds the run terminal on the platform
//!
//! Both go through [`History::update_status`], where the first terminal
//! write wins.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use websearch_core::{Config, History, PlatformClient, Reconciler, SqliteStore};
//!
//! # async fn run() -> websearch_core::Result<()> {
//! let config = Config::load()?;
//! let storage = Arc::new(SqliteStore::open(&Config::database_path(), config.history.quota_bytes)?);
//! let history = Arc::new(History::open(storage, config.history.max_entries));
//!
//! let platform = Arc::new(PlatformClient::new(config.platform.clone())?);
//! let reconciler = Reconciler::new(platform, history.clone(), &config.reconcile);
//! let report = reconciler.reconcile_all().await;
//! println!("{} task(s) can be resumed", report.resumable.len());
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use error::{Error, Result};
pub use history::{History, HistoryEntry, HistoryStatus, HistoryStore, SearchOutput, TerminalOutcome};
pub use monitor::{AppState, LiveMonitor, PollingSubscriber, Stage};
pub use platform::{PlatformClient, RemoteRunStatus, RunState, SearchInput, TaskPlatform};
pub use reconcile::{ReconcileReport, Reconciler, Reconciliation, ResumableTask};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use theme::{Theme, ThemeStore};

// Public modules
pub mod config;
pub mod error;
pub mod format;
pub mod history;
pub mod logging;
pub mod monitor;
pub mod platform;
pub mod progress;
pub mod reconcile;
pub mod storage;
pub mod theme;
