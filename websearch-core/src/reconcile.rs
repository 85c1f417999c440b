//! Reconciliation of locally processing entries against the remote platform
//!
//! Finalizing through a poll funnels into the same guarded
//! [`History::update_status`] as push events, so whichever path reaches a run
//! first wins and the other becomes a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;

use crate::config::ReconcileConfig;
use crate::error::{Error, Result};
use crate::history::{History, HistoryStatus, TerminalOutcome};
use crate::platform::{validate_run_id, AccessToken, TaskPlatform};

/// Error recorded for runs the platform has no memory of
pub const NOT_FOUND_MESSAGE: &str = "Task not found on server";

/// A still-running task that can be reattached to
#[derive(Debug, Clone, PartialEq)]
pub struct ResumableTask {
    pub run_id: String,
    /// Empty when the run has no local history entry
    pub query: String,
    pub timestamp: Option<i64>,
    pub model: Option<String>,
    pub write_model: Option<String>,
    pub access_token: AccessToken,
}

/// Outcome of reconciling one run
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Still running remotely and a token was issued
    Resumable(ResumableTask),
    /// Terminal; carries the status the history now holds
    Finalized(HistoryStatus),
    /// Still running, but no token this cycle
    StillRunning,
}

/// A run whose status could not be determined
#[derive(Debug)]
pub struct ReconcileFailure {
    pub run_id: String,
    pub error: Error,
}

/// Summary of a [`Reconciler::reconcile_all`] pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub resumable: Vec<ResumableTask>,
    pub finalized: Vec<(String, HistoryStatus)>,
    /// Still running without a usable token
    pub pending: Vec<String>,
    pub errors: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    pub fn checked(&self) -> usize {
        self.resumable.len() + self.finalized.len() + self.pending.len() + self.errors.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct BackoffRecord {
    failures: u32,
    next_attempt: DateTime<Utc>,
}

/// Per-run exponential backoff for token issuance.
///
/// After `n` consecutive failures the next automatic attempt waits
/// `base * 2^(n-1)`, capped at `max`. Once `max_attempts` failures accumulate,
/// automatic attempts stop until the record is reset.
#[derive(Debug)]
pub struct TokenBackoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    records: Mutex<HashMap<String, BackoffRecord>>,
}

impl TokenBackoff {
    pub fn new(config: &ReconcileConfig) -> Self {
        Self {
            base: Duration::seconds(config.token_retry_base_secs as i64),
            max: Duration::seconds(config.token_retry_max_secs as i64),
            max_attempts: config.max_token_attempts.max(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Delay imposed after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::zero();
        }
        let factor = 1i32 << (failures - 1).min(30);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Whether an automatic attempt for `run_id` is allowed at `now`
    pub fn allows(&self, run_id: &str, now: DateTime<Utc>) -> bool {
        let records = self.records.lock().unwrap();
        match records.get(run_id) {
            None => true,
            Some(r) if r.failures >= self.max_attempts => false,
            Some(r) => now >= r.next_attempt,
        }
    }

    /// Record a failed attempt; returns the consecutive failure count.
    pub fn record_failure(&self, run_id: &str, now: DateTime<Utc>) -> u32 {
        let mut records = self.records.lock().unwrap();
        let failures = records.get(run_id).map_or(0, |r| r.failures) + 1;
        let next_attempt = now + self.delay_for(failures);
        records.insert(
            run_id.to_string(),
            BackoffRecord {
                failures,
                next_attempt,
            },
        );
        failures
    }

    /// Forget the run (after a success, a manual retry, or finalization)
    pub fn reset(&self, run_id: &str) {
        self.records.lock().unwrap().remove(run_id);
    }

    pub fn failures(&self, run_id: &str) -> u32 {
        self.records
            .lock()
            .unwrap()
            .get(run_id)
            .map_or(0, |r| r.failures)
    }
}

/// Brings processing history entries in line with remote truth
pub struct Reconciler {
    platform: Arc<dyn TaskPlatform>,
    history: Arc<History>,
    backoff: TokenBackoff,
}

impl Reconciler {
    pub fn new(
        platform: Arc<dyn TaskPlatform>,
        history: Arc<History>,
        config: &ReconcileConfig,
    ) -> Self {
        Self {
            platform,
            history,
            backoff: TokenBackoff::new(config),
        }
    }

    pub fn backoff(&self) -> &TokenBackoff {
        &self.backoff
    }

    /// Check every processing entry concurrently.
    ///
    /// Transport failures leave the entry untouched and are listed in
    /// [`ReconcileReport::errors`].
    pub async fn reconcile_all(&self) -> ReconcileReport {
        let processing = self.history.list_processing();
        let mut report = ReconcileReport::default();
        if processing.is_empty() {
            return report;
        }

        tracing::info!(count = processing.len(), "Reconciling processing tasks");

        let checks = processing
            .iter()
            .map(|entry| self.check(&entry.run_id, false));
        let results = join_all(checks).await;

        for (entry, result) in processing.into_iter().zip(results) {
            match result {
                Ok(Reconciliation::Resumable(task)) => report.resumable.push(task),
                Ok(Reconciliation::Finalized(status)) => {
                    report.finalized.push((entry.run_id, status))
                }
                Ok(Reconciliation::StillRunning) => report.pending.push(entry.run_id),
                Err(error) => {
                    tracing::warn!(run_id = %entry.run_id, error = %error, "Could not check task status");
                    report.errors.push(ReconcileFailure {
                        run_id: entry.run_id,
                        error,
                    });
                }
            }
        }

        tracing::info!(
            resumable = report.resumable.len(),
            finalized = report.finalized.len(),
            pending = report.pending.len(),
            errors = report.errors.len(),
            "Reconciliation finished"
        );
        report
    }

    /// Reconcile a single run on explicit request.
    ///
    /// Ignores and clears the run's token backoff. A run already terminal in
    /// history is reported without contacting the platform.
    pub async fn reconcile_one(&self, run_id: &str) -> Result<Reconciliation> {
        validate_run_id(run_id)?;

        if let Some(entry) = self.history.find_by_run_id(run_id) {
            if entry.status.is_terminal() {
                return Ok(Reconciliation::Finalized(entry.status));
            }
        }

        self.backoff.reset(run_id);
        self.check(run_id, true).await
    }

    async fn check(&self, run_id: &str, manual: bool) -> Result<Reconciliation> {
        let remote = match self.platform.fetch_status(run_id).await {
            Ok(remote) => remote,
            Err(Error::NotFound(_)) => {
                tracing::warn!(run_id = %run_id, "Task not found on server, marking failed");
                return Ok(self.finalize(
                    run_id,
                    TerminalOutcome::Failed(NOT_FOUND_MESSAGE.to_string()),
                ));
            }
            Err(e) => return Err(e),
        };

        if let Some(outcome) = remote.terminal_outcome() {
            return Ok(self.finalize(run_id, outcome));
        }

        // A push event may have finalized the entry while we were waiting
        let entry = self.history.find_by_run_id(run_id);
        if let Some(current) = entry.as_ref().filter(|e| e.status.is_terminal()) {
            self.backoff.reset(run_id);
            return Ok(Reconciliation::Finalized(current.status));
        }

        let now = Utc::now();
        if !manual && !self.backoff.allows(run_id, now) {
            tracing::debug!(
                run_id = %run_id,
                failures = self.backoff.failures(run_id),
                "Skipping token issuance during backoff"
            );
            return Ok(Reconciliation::StillRunning);
        }

        match self.platform.issue_access_token(run_id).await {
            Ok(access_token) => {
                self.backoff.reset(run_id);
                tracing::info!(run_id = %run_id, state = %remote.state, "Task is resumable");
                Ok(Reconciliation::Resumable(ResumableTask {
                    run_id: run_id.to_string(),
                    query: entry.as_ref().map(|e| e.query.clone()).unwrap_or_default(),
                    timestamp: entry.as_ref().map(|e| e.timestamp),
                    model: entry.as_ref().and_then(|e| e.model.clone()),
                    write_model: entry.as_ref().and_then(|e| e.write_model.clone()),
                    access_token,
                }))
            }
            Err(e) => {
                let failures = self.backoff.record_failure(run_id, now);
                tracing::warn!(
                    run_id = %run_id,
                    error = %e,
                    failures,
                    "Token issuance failed, task stays processing"
                );
                Ok(Reconciliation::StillRunning)
            }
        }
    }

    fn finalize(&self, run_id: &str, outcome: TerminalOutcome) -> Reconciliation {
        self.backoff.reset(run_id);
        let requested = outcome.status();
        let store = self.history.update_status(run_id, outcome);
        let status = store
            .find_by_run_id(run_id)
            .map_or(requested, |e| e.status);
        Reconciliation::Finalized(status)
    }
}
