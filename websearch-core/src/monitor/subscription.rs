//! Run event streams
//!
//! A [`RunSubscription`] is a channel of [`SubscriptionEvent`]s for one run.
//! Dropping it stops whatever produces the events.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::platform::{RemoteRunStatus, TaskPlatform};

const CHANNEL_CAPACITY: usize = 32;

/// One message from a run's event stream
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A new snapshot of the run
    Update(RemoteRunStatus),
    /// The stream itself failed (not the run)
    Error(String),
}

/// Live event stream for a single run
pub struct RunSubscription {
    run_id: String,
    events: mpsc::Receiver<SubscriptionEvent>,
    producer: Option<JoinHandle<()>>,
}

impl RunSubscription {
    /// Wrap a receiver fed by `producer`, which is aborted on drop.
    pub fn new(
        run_id: impl Into<String>,
        events: mpsc::Receiver<SubscriptionEvent>,
        producer: JoinHandle<()>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            events,
            producer: Some(producer),
        }
    }

    /// Wrap a receiver whose sender is owned elsewhere
    pub fn from_receiver(run_id: impl Into<String>, events: mpsc::Receiver<SubscriptionEvent>) -> Self {
        Self {
            run_id: run_id.into(),
            events,
            producer: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }
}

impl Drop for RunSubscription {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// Opens event streams for runs
pub trait RunSubscriber: Send + Sync {
    /// Start streaming events for `run_id`, authenticated by `access_token`.
    ///
    /// Must be called from within a tokio runtime.
    fn subscribe(&self, run_id: &str, access_token: &str) -> RunSubscription;
}

/// Streams run events by polling the platform with the run's scoped token.
///
/// Emits an update only when the snapshot changes. Stops after a terminal
/// status, or after an error that polling cannot fix (run gone, token
/// rejected). Transport errors are reported once per outage and polling
/// continues.
pub struct PollingSubscriber {
    platform: Arc<dyn TaskPlatform>,
    interval: Duration,
}

impl PollingSubscriber {
    pub fn new(platform: Arc<dyn TaskPlatform>, interval: Duration) -> Self {
        Self { platform, interval }
    }
}

impl RunSubscriber for PollingSubscriber {
    fn subscribe(&self, run_id: &str, access_token: &str) -> RunSubscription {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let producer = tokio::spawn(poll_run(
            self.platform.clone(),
            run_id.to_string(),
            access_token.to_string(),
            self.interval,
            tx,
        ));
        RunSubscription::new(run_id, rx, producer)
    }
}

async fn poll_run(
    platform: Arc<dyn TaskPlatform>,
    run_id: String,
    token: String,
    interval: Duration,
    tx: mpsc::Sender<SubscriptionEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<RemoteRunStatus> = None;
    let mut failing = false;

    loop {
        ticker.tick().await;

        match platform.fetch_with_token(&run_id, &token).await {
            Ok(status) => {
                failing = false;
                let terminal = status.state.is_terminal();
                if last.as_ref() != Some(&status) {
                    last = Some(status.clone());
                    if tx.send(SubscriptionEvent::Update(status)).await.is_err() {
                        break;
                    }
                }
                if terminal {
                    tracing::debug!(run_id = %run_id, "Run reached terminal status, polling stopped");
                    break;
                }
            }
            Err(e) => {
                let fatal = matches!(
                    e,
                    Error::NotFound(_) | Error::Unauthorized(_) | Error::InvalidRequest(_)
                );
                if !failing || fatal {
                    tracing::warn!(run_id = %run_id, error = %e, fatal, "Polling run status failed");
                    if tx.send(SubscriptionEvent::Error(e.user_message())).await.is_err() {
                        break;
                    }
                }
                failing = true;
                if fatal {
                    break;
                }
            }
        }
    }
}
