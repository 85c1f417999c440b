//! Application state machine for the live monitor
//!
//! ```text
//! idle -> processing -> complete
//!              |
//!              +------> error   (failure and cancellation)
//! complete/error -> processing (new trigger or resume)
//! ```
//!
//! [`reduce`] is pure: it never touches storage or the network. Side effects
//! are described by [`Effect`] and carried out by the
//! [`LiveMonitor`](super::LiveMonitor).

use chrono::Utc;
use serde_json::Value;

use crate::history::{SearchOutput, TerminalOutcome};
use crate::platform::RemoteRunStatus;
use crate::progress::calculate_progress;

/// Stage of the active-task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    Idle,
    Processing,
    Complete,
    /// Failed or canceled; the message tells which
    Error,
}

/// Transient progress published by a running task
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressMetadata {
    /// Percentage, 0..=100
    pub progress: f64,
    pub action_history: Vec<String>,
    pub current_action: Option<String>,
    pub total_iterations: u32,
    pub current_iteration: u32,
    /// RFC 3339
    pub last_updated: String,
}

impl Default for ProgressMetadata {
    fn default() -> Self {
        Self {
            progress: 0.0,
            action_history: Vec::new(),
            current_action: None,
            total_iterations: 5,
            current_iteration: 0,
            last_updated: Utc::now().to_rfc3339(),
        }
    }
}

impl ProgressMetadata {
    /// Read metadata field by field. Missing or mistyped fields take their
    /// defaults, so a malformed payload can never fail a state update.
    ///
    /// Without an explicit `progress`, the percentage is derived from the
    /// iteration counts when the task reports a current iteration.
    pub fn from_value(value: &Value) -> Self {
        let defaults = Self::default();

        let as_count = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_u64)
                .map(|n| n.min(u32::MAX as u64) as u32)
        };
        let total_iterations = as_count("totalIterations").unwrap_or(defaults.total_iterations);
        let current_iteration = as_count("currentIteration");

        let progress = value
            .get("progress")
            .and_then(Value::as_f64)
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 100.0))
            .or_else(|| {
                current_iteration.map(|current| calculate_progress(current, total_iterations, 0.0))
            })
            .unwrap_or(defaults.progress);

        let action_history = value
            .get("actionHistory")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let current_action = value
            .get("currentAction")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            progress,
            action_history,
            current_action,
            total_iterations,
            current_iteration: current_iteration.unwrap_or(defaults.current_iteration),
            last_updated: value
                .get("lastUpdated")
                .and_then(Value::as_str)
                .map_or(defaults.last_updated, str::to_string),
        }
    }
}

/// Everything the front-end renders for the active task
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppState {
    pub stage: Stage,
    pub query: String,
    pub run_id: Option<String>,
    pub access_token: Option<String>,
    pub progress: ProgressMetadata,
    pub result: Option<SearchOutput>,
    pub error: Option<String>,
}

impl AppState {
    /// Processing, but the trigger has not returned a run id yet
    pub fn is_triggering(&self) -> bool {
        self.stage == Stage::Processing && self.run_id.is_none()
    }

    /// Whether a new trigger or resume may start from this state
    pub fn can_start(&self) -> bool {
        self.stage != Stage::Processing
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// A trigger request is about to be sent
    TriggerStarted { query: String },
    TriggerSucceeded { run_id: String, access_token: String },
    TriggerFailed { message: String },
    /// Reattach to a known running task
    Resume {
        run_id: String,
        access_token: String,
        query: String,
    },
    /// A snapshot from the run's event stream
    RunUpdated(RemoteRunStatus),
    /// The event stream itself failed; the run may still be alive
    SubscriptionFailed { run_id: String, message: String },
    CancelRequested,
    DismissError,
    Reset,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    None,
    /// Attach the event stream for this run
    Subscribe { run_id: String, access_token: String },
    /// Record the terminal outcome in history
    Finalize {
        run_id: String,
        outcome: TerminalOutcome,
    },
    /// The action did not apply to the current state
    Ignored(&'static str),
}

/// New state plus the effect to perform
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: AppState,
    pub effect: Effect,
}

impl Transition {
    fn to(state: AppState, effect: Effect) -> Self {
        Self { state, effect }
    }

    fn ignored(state: &AppState, reason: &'static str) -> Self {
        Self {
            state: state.clone(),
            effect: Effect::Ignored(reason),
        }
    }
}

/// Apply `action` to `state`.
pub fn reduce(state: &AppState, action: Action) -> Transition {
    match action {
        Action::TriggerStarted { query } => {
            if !state.can_start() {
                return Transition::ignored(state, "a task is already processing");
            }
            let progress = ProgressMetadata {
                current_action: Some("Initializing search...".to_string()),
                action_history: vec!["Starting web search agent".to_string()],
                ..ProgressMetadata::default()
            };
            Transition::to(
                AppState {
                    stage: Stage::Processing,
                    query,
                    progress,
                    ..AppState::default()
                },
                Effect::None,
            )
        }

        Action::TriggerSucceeded {
            run_id,
            access_token,
        } => {
            if !state.is_triggering() {
                return Transition::ignored(state, "trigger resolved after the monitor moved on");
            }
            let mut next = state.clone();
            next.progress.current_action =
                Some("Task triggered successfully, waiting for updates...".to_string());
            next.progress
                .action_history
                .push(format!("Task started with ID: {}", run_id));
            next.run_id = Some(run_id.clone());
            next.access_token = Some(access_token.clone());
            Transition::to(
                next,
                Effect::Subscribe {
                    run_id,
                    access_token,
                },
            )
        }

        Action::TriggerFailed { message } => {
            if !state.is_triggering() {
                return Transition::ignored(state, "no trigger in flight");
            }
            let mut next = state.clone();
            next.stage = Stage::Error;
            next.error = Some(message);
            next.progress.current_action = Some("Failed to start search".to_string());
            Transition::to(next, Effect::None)
        }

        Action::Resume {
            run_id,
            access_token,
            query,
        } => {
            if !state.can_start() {
                return Transition::ignored(state, "a task is already processing");
            }
            let progress = ProgressMetadata {
                current_action: Some("Reconnecting to running task...".to_string()),
                action_history: vec![format!("Resumed task {}", run_id)],
                ..ProgressMetadata::default()
            };
            Transition::to(
                AppState {
                    stage: Stage::Processing,
                    query,
                    run_id: Some(run_id.clone()),
                    access_token: Some(access_token.clone()),
                    progress,
                    ..AppState::default()
                },
                Effect::Subscribe {
                    run_id,
                    access_token,
                },
            )
        }

        Action::RunUpdated(run) => apply_run_update(state, run),

        Action::SubscriptionFailed { run_id, message } => {
            if state.stage != Stage::Processing || state.run_id.as_deref() != Some(&run_id) {
                return Transition::ignored(state, "stream error for a run that is not tracked");
            }
            let mut next = state.clone();
            next.error = Some(format!("Real-time connection error: {}", message));
            Transition::to(next, Effect::None)
        }

        Action::CancelRequested => {
            if state.stage != Stage::Processing || state.run_id.is_none() {
                return Transition::ignored(state, "nothing to cancel");
            }
            let mut next = state.clone();
            next.progress.current_action = Some("Cancellation requested...".to_string());
            next.progress
                .action_history
                .push("Cancellation requested".to_string());
            Transition::to(next, Effect::None)
        }

        Action::DismissError => {
            if state.stage != Stage::Processing || state.error.is_none() {
                return Transition::ignored(state, "no dismissible error");
            }
            let mut next = state.clone();
            next.error = None;
            Transition::to(next, Effect::None)
        }

        Action::Reset => Transition::to(AppState::default(), Effect::None),
    }
}

fn apply_run_update(state: &AppState, run: RemoteRunStatus) -> Transition {
    if state.stage != Stage::Processing {
        return Transition::ignored(state, "not processing");
    }
    if state.run_id.as_deref() != Some(run.run_id.as_str()) {
        tracing::debug!(
            run_id = %run.run_id,
            current = ?state.run_id,
            "Ignoring update from previous run"
        );
        return Transition::ignored(state, "update for a different run");
    }

    let mut next = state.clone();
    if let Some(metadata) = &run.metadata {
        next.progress = ProgressMetadata::from_value(metadata);
    }

    let Some(outcome) = run.terminal_outcome() else {
        return Transition::to(next, Effect::None);
    };

    match &outcome {
        TerminalOutcome::Complete(output) => {
            next.stage = Stage::Complete;
            next.result = Some(output.clone());
            next.error = None;
            next.progress.progress = 100.0;
            next.progress.current_action = Some("Search completed successfully".to_string());
        }
        TerminalOutcome::Failed(message) => {
            next.stage = Stage::Error;
            next.error = Some(message.clone());
            next.progress.current_action = Some("Search failed".to_string());
        }
        TerminalOutcome::Canceled(message) => {
            next.stage = Stage::Error;
            next.error = Some(message.clone());
            next.progress.current_action = Some("Search canceled".to_string());
        }
    }

    Transition::to(
        next,
        Effect::Finalize {
            run_id: run.run_id,
            outcome,
        },
    )
}
