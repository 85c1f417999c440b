//! History domain types
//!
//! Field names serialize in camelCase (`runId`, `completedAt`, `writeModel`)
//! so documents written by earlier front-ends load unchanged.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a history entry.
///
/// Transitions are one-directional: `Processing` to exactly one terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Processing,
    Complete,
    Failed,
    Canceled,
}

impl HistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Processing => "processing",
            HistoryStatus::Complete => "complete",
            HistoryStatus::Failed => "failed",
            HistoryStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, HistoryStatus::Processing)
    }
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HistoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "processing" => Ok(HistoryStatus::Processing),
            "complete" => Ok(HistoryStatus::Complete),
            "failed" => Ok(HistoryStatus::Failed),
            "canceled" | "cancelled" => Ok(HistoryStatus::Canceled),
            _ => Err(format!("unknown history status: {}", s)),
        }
    }
}

/// Function invoked by a tool call in the agent transcript
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// A tool call requested by the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<ToolFunction>,
}

/// One message of the agent conversation transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// Final output of a search run: the answer plus the full transcript
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchOutput {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub conversation: Vec<ConversationMessage>,
}

impl SearchOutput {
    /// Parse a run's `output` payload, falling back to an empty result when
    /// the payload does not have the expected shape.
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        match value {
            Some(v) => serde_json::from_value(v.clone()).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Run output has unexpected shape, storing empty result");
                SearchOutput::default()
            }),
            None => SearchOutput::default(),
        }
    }
}

/// The terminal outcome of a run.
///
/// Carries exactly the payload its status requires, so an entry can never
/// end up complete without a result or failed without an error.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Complete(SearchOutput),
    Failed(String),
    Canceled(String),
}

impl TerminalOutcome {
    pub fn status(&self) -> HistoryStatus {
        match self {
            TerminalOutcome::Complete(_) => HistoryStatus::Complete,
            TerminalOutcome::Failed(_) => HistoryStatus::Failed,
            TerminalOutcome::Canceled(_) => HistoryStatus::Canceled,
        }
    }
}

/// One record per submitted task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Generation-ordered unique id
    pub id: String,
    pub query: String,
    /// Remote run identifier; the dedup key
    pub run_id: String,
    pub status: HistoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SearchOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Trigger time, epoch millis
    pub timestamp: i64,
    /// First terminal transition, epoch millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_model: Option<String>,
}

impl HistoryEntry {
    /// Guarded terminal transition.
    ///
    /// Returns `false` and leaves the entry untouched when it is already
    /// terminal; the first terminal write wins.
    pub fn finalize(&mut self, outcome: TerminalOutcome, now_ms: i64) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        self.status = outcome.status();
        match outcome {
            TerminalOutcome::Complete(output) => {
                self.result = Some(output);
                self.error = None;
            }
            TerminalOutcome::Failed(message) | TerminalOutcome::Canceled(message) => {
                self.result = None;
                self.error = Some(message);
            }
        }
        self.completed_at = Some(now_ms.max(self.timestamp));
        true
    }

    /// Repair an entry loaded from storage so the status/payload invariants hold.
    pub(crate) fn normalize(&mut self) {
        match self.status {
            HistoryStatus::Processing => {
                self.result = None;
                self.error = None;
                self.completed_at = None;
            }
            HistoryStatus::Complete => {
                self.error = None;
                if self.result.is_none() {
                    self.result = Some(SearchOutput::default());
                }
            }
            HistoryStatus::Failed | HistoryStatus::Canceled => {
                self.result = None;
                if self.error.is_none() {
                    self.error = Some(match self.status {
                        HistoryStatus::Canceled => "Task was canceled".to_string(),
                        _ => "Task execution failed".to_string(),
                    });
                }
            }
        }

        if self.status.is_terminal() {
            let completed = self.completed_at.unwrap_or(self.timestamp);
            self.completed_at = Some(completed.max(self.timestamp));
        }
    }
}

/// The persisted aggregate: newest-first entries capped at `max_entries`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStore {
    pub entries: Vec<HistoryEntry>,
    pub max_entries: usize,
}

impl HistoryStore {
    pub fn empty(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
        }
    }

    pub fn find_by_run_id(&self, run_id: &str) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.run_id == run_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Change notification published after every successful mutation
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryChange {
    Added { run_id: String },
    Updated { run_id: String, status: HistoryStatus },
    Deleted { id: String },
    Cleared,
    /// Another process rewrote the stored history
    External,
}
