//! Live monitoring of the single active task
//!
//! [`LiveMonitor`] owns the [`AppState`], the event stream of the tracked run,
//! and the side effects of [`reduce`]. At most one run is monitored at a time:
//! starting a trigger or resume drops any previous subscription first.

mod state;
mod subscription;

pub use state::{reduce, Action, AppState, Effect, ProgressMetadata, Stage, Transition};
pub use subscription::{PollingSubscriber, RunSubscriber, RunSubscription, SubscriptionEvent};

use std::sync::Arc;

use chrono::Utc;

use crate::config::SearchDefaults;
use crate::error::{Error, Result};
use crate::history::History;
use crate::platform::{SearchInput, TaskPlatform};
use crate::progress::validate_query;
use crate::reconcile::ResumableTask;

/// Model overrides of the tracked run, reused on retry
#[derive(Debug, Clone, Default, PartialEq)]
struct ModelChoice {
    model: Option<String>,
    write_model: Option<String>,
}

pub struct LiveMonitor {
    platform: Arc<dyn TaskPlatform>,
    history: Arc<History>,
    subscriber: Arc<dyn RunSubscriber>,
    defaults: SearchDefaults,
    state: AppState,
    subscription: Option<RunSubscription>,
    models: ModelChoice,
}

impl LiveMonitor {
    pub fn new(
        platform: Arc<dyn TaskPlatform>,
        history: Arc<History>,
        subscriber: Arc<dyn RunSubscriber>,
        defaults: SearchDefaults,
    ) -> Self {
        Self {
            platform,
            history,
            subscriber,
            defaults,
            state: AppState::default(),
            subscription: None,
            models: ModelChoice::default(),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Whether an event stream is attached
    pub fn is_attached(&self) -> bool {
        self.subscription.is_some()
    }

    /// Run `action` through the reducer and carry out its effect.
    pub fn dispatch(&mut self, action: Action) -> Effect {
        let Transition { state, effect } = reduce(&self.state, action);
        self.state = state;

        match &effect {
            Effect::Subscribe {
                run_id,
                access_token,
            } => {
                self.subscription = None;
                self.subscription = Some(self.subscriber.subscribe(run_id, access_token));
                tracing::debug!(run_id = %run_id, "Subscribed to run events");
            }
            Effect::Finalize { run_id, outcome } => {
                self.history.update_status(run_id, outcome.clone());
            }
            Effect::Ignored(reason) => {
                tracing::debug!(reason, "Monitor action ignored");
            }
            Effect::None => {}
        }

        if self.state.stage != Stage::Processing {
            self.subscription = None;
        }
        effect
    }

    /// Start a new search and attach to its run.
    ///
    /// The query is validated before any state change. A trigger failure moves
    /// the monitor to `Error` and is also returned.
    pub async fn trigger_search(
        &mut self,
        query: &str,
        model: Option<&str>,
        write_model: Option<&str>,
    ) -> Result<String> {
        let query = validate_query(query)?;
        if !self.state.can_start() {
            return Err(Error::Validation(
                "A search is already in progress".to_string(),
            ));
        }

        self.subscription = None;
        self.models = ModelChoice {
            model: model.map(str::to_string),
            write_model: write_model.map(str::to_string),
        };
        self.dispatch(Action::TriggerStarted {
            query: query.clone(),
        });

        let input = SearchInput::new(&query, &self.defaults, model, write_model);
        match self.platform.trigger(&input).await {
            Ok(handle) => {
                // The run exists remotely whether or not we still track it
                self.history.add_processing(
                    &query,
                    &handle.run_id,
                    Some(&input.model),
                    Some(&input.write_model),
                );
                self.dispatch(Action::TriggerSucceeded {
                    run_id: handle.run_id.clone(),
                    access_token: handle.access_token.token,
                });
                Ok(handle.run_id)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to trigger search");
                self.dispatch(Action::TriggerFailed {
                    message: e.user_message(),
                });
                Err(e)
            }
        }
    }

    /// Trigger the last query again (from `Complete` or `Error`), with the
    /// same model overrides it was first started with.
    pub async fn retry_search(&mut self) -> Result<String> {
        if self.state.query.is_empty() {
            return Err(Error::Validation("No previous search to retry".to_string()));
        }
        let query = self.state.query.clone();
        let ModelChoice { model, write_model } = self.models.clone();
        self.trigger_search(&query, model.as_deref(), write_model.as_deref())
            .await
    }

    /// Reattach to a task reconciliation found resumable.
    ///
    /// Refuses an expired read token; reconcile again to get a fresh one.
    pub fn resume(&mut self, task: &ResumableTask) -> Result<()> {
        if task.access_token.is_expired(Utc::now()) {
            return Err(Error::Unauthorized(format!(
                "read access to run {} has expired; check it again to get a new token",
                task.run_id
            )));
        }

        self.resume_task(&task.run_id, &task.access_token.token, &task.query)?;
        self.models = ModelChoice {
            model: task.model.clone(),
            write_model: task.write_model.clone(),
        };
        Ok(())
    }

    /// Reattach to a running task, e.g. one reconciliation found resumable.
    pub fn resume_task(&mut self, run_id: &str, access_token: &str, query: &str) -> Result<()> {
        crate::platform::validate_run_id(run_id)?;
        if !self.state.can_start() {
            return Err(Error::Validation(
                "A search is already in progress".to_string(),
            ));
        }

        self.subscription = None;
        self.models = ModelChoice::default();
        self.dispatch(Action::Resume {
            run_id: run_id.to_string(),
            access_token: access_token.to_string(),
            query: query.to_string(),
        });
        Ok(())
    }

    /// Ask the platform to cancel the tracked run.
    ///
    /// Local status is untouched; the terminal state arrives through the
    /// event stream or a later reconciliation.
    pub async fn cancel_task(&mut self) -> Result<bool> {
        let run_id = match (&self.state.stage, &self.state.run_id) {
            (Stage::Processing, Some(run_id)) => run_id.clone(),
            _ => {
                return Err(Error::Validation(
                    "No running task to cancel".to_string(),
                ))
            }
        };

        let accepted = self.platform.cancel(&run_id).await?;
        if accepted {
            self.dispatch(Action::CancelRequested);
        }
        Ok(accepted)
    }

    pub fn dismiss_error(&mut self) {
        self.dispatch(Action::DismissError);
    }

    /// Return to idle, abandoning any subscription.
    pub fn reset_search(&mut self) {
        self.subscription = None;
        self.dispatch(Action::Reset);
    }

    /// Wait for the next stream event and apply it.
    ///
    /// Returns `None` when nothing is attached or the stream has ended.
    pub async fn next_event(&mut self) -> Option<Effect> {
        let (run_id, event) = {
            let subscription = self.subscription.as_mut()?;
            let event = subscription.recv().await;
            (subscription.run_id().to_string(), event)
        };

        match event {
            Some(SubscriptionEvent::Update(status)) => Some(self.dispatch(Action::RunUpdated(status))),
            Some(SubscriptionEvent::Error(message)) => {
                Some(self.dispatch(Action::SubscriptionFailed { run_id, message }))
            }
            None => {
                tracing::debug!(run_id = %run_id, "Run event stream ended");
                self.subscription = None;
                None
            }
        }
    }
}
