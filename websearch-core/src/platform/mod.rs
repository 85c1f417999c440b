//! Remote task platform access
//!
//! [`TaskPlatform`] is the seam between this crate and the remote task runner.
//! [`PlatformClient`] talks to the real platform over HTTP; tests substitute
//! in-process fakes. Every implementation reports failures using the
//! [`Error`](crate::Error) taxonomy, never raw HTTP status codes.

mod client;

pub use client::PlatformClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SearchDefaults;
use crate::error::{Error, Result};
use crate::history::{SearchOutput, TerminalOutcome};

/// Run state as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    /// Queued, delayed, waiting or otherwise not yet running
    Pending,
    Executing,
    Completed,
    /// Failed, crashed, timed out or expired
    Failed,
    Canceled,
    /// A state this client does not know; treated as still running
    Other(String),
}

impl RunState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "QUEUED" | "WAITING_FOR_DEPLOY" | "DELAYED" | "REATTEMPTING"
            | "FROZEN" | "WAITING" | "DEQUEUED" | "PENDING_VERSION" => RunState::Pending,
            "EXECUTING" => RunState::Executing,
            "COMPLETED" => RunState::Completed,
            "CANCELED" | "CANCELLED" => RunState::Canceled,
            "FAILED" | "CRASHED" | "SYSTEM_FAILURE" | "TIMED_OUT" | "EXPIRED" | "INTERRUPTED" => {
                RunState::Failed
            }
            _ => RunState::Other(raw.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Canceled
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => f.write_str("PENDING"),
            RunState::Executing => f.write_str("EXECUTING"),
            RunState::Completed => f.write_str("COMPLETED"),
            RunState::Failed => f.write_str("FAILED"),
            RunState::Canceled => f.write_str("CANCELED"),
            RunState::Other(raw) => f.write_str(raw),
        }
    }
}

/// Point-in-time snapshot of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRunStatus {
    pub run_id: String,
    pub state: RunState,
    /// Progress metadata published by the running task
    pub metadata: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteRunStatus {
    /// The local outcome this snapshot implies, or `None` while the run is live.
    pub fn terminal_outcome(&self) -> Option<TerminalOutcome> {
        match self.state {
            RunState::Completed => Some(TerminalOutcome::Complete(SearchOutput::from_value(
                self.output.as_ref(),
            ))),
            RunState::Failed => Some(TerminalOutcome::Failed(
                self.error
                    .clone()
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "Task execution failed".to_string()),
            )),
            RunState::Canceled => Some(TerminalOutcome::Canceled("Task was canceled".to_string())),
            _ => None,
        }
    }
}

/// Short-lived token granting read access to one run
#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of triggering a run
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerHandle {
    pub run_id: String,
    pub access_token: AccessToken,
}

/// Web search tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub search_depth: String,
    pub topic: String,
    pub max_results: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_images: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_image_descriptions: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_answer: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
}

/// Page extraction tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractParams {
    pub include_images: bool,
    pub extract_depth: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
}

/// Payload of a search run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchInput {
    pub query: String,
    pub search_params: SearchParams,
    pub extract_params: ExtractParams,
    pub model: String,
    pub write_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summarize: Option<bool>,
    pub max_iterations: u32,
}

impl SearchInput {
    /// Build an input from configured defaults, with optional model overrides.
    pub fn new(
        query: &str,
        defaults: &SearchDefaults,
        model: Option<&str>,
        write_model: Option<&str>,
    ) -> Self {
        Self {
            query: query.trim().to_string(),
            search_params: SearchParams {
                search_depth: defaults.search_depth.clone(),
                topic: defaults.topic.clone(),
                max_results: defaults.max_results,
                include_images: None,
                include_image_descriptions: None,
                include_answer: None,
                time_range: None,
                days: None,
            },
            extract_params: ExtractParams {
                include_images: defaults.include_images,
                extract_depth: defaults.extract_depth.clone(),
                timeout: None,
            },
            model: model
                .map(str::to_string)
                .unwrap_or_else(|| defaults.effective_model()),
            write_model: write_model
                .map(str::to_string)
                .unwrap_or_else(|| defaults.effective_write_model()),
            summarize: None,
            max_iterations: defaults.max_iterations,
        }
    }
}

/// Operations the remote task runner offers
#[async_trait]
pub trait TaskPlatform: Send + Sync {
    /// Submit a new run.
    async fn trigger(&self, input: &SearchInput) -> Result<TriggerHandle>;

    /// Current status of a run, authenticated with the platform secret.
    async fn fetch_status(&self, run_id: &str) -> Result<RemoteRunStatus>;

    /// Current status of a run, authenticated with a scoped access token.
    async fn fetch_with_token(&self, run_id: &str, token: &str) -> Result<RemoteRunStatus>;

    /// Mint a token granting read access to exactly one run.
    async fn issue_access_token(&self, run_id: &str) -> Result<AccessToken>;

    /// Request cancellation. `true` means the request was accepted, not that
    /// the run has stopped.
    async fn cancel(&self, run_id: &str) -> Result<bool>;
}

/// Reject run ids that cannot name a run before they reach the network.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.is_empty() {
        return Err(Error::InvalidRequest("run id is required".to_string()));
    }
    if run_id.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(Error::InvalidRequest(format!(
            "malformed run id: {:?}",
            run_id
        )));
    }
    Ok(())
}
