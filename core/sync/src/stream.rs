//! Client side of the change-event stream.
//!
//! State machine: `Connecting → Streaming → (Reconnecting ⇄ Streaming) → Closed`.
//! A missing heartbeat counts as a disconnect. Reconnect attempts follow a
//! [`ReconnectPolicy`]; exhausting it closes the stream with a `Transport` error.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::ReconnectPolicy;
use teamvault_common::{ChangeEvent, Error, Result};
use teamvault_storage::{SessionToken, StreamItem, Subscription, VaultBackend};

/// Observable state of an [`EventStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Streaming,
    /// Waiting for, or performing, reconnect attempt `attempt` (one-based).
    Reconnecting { attempt: u32 },
    Closed,
}

/// Receives events from an [`EventStream`].
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: &ChangeEvent);

    /// Called after every successful reconnect, since events may have been missed.
    async fn on_resync(&self) {}
}

/// Opens subscriptions.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(&self) -> Result<Subscription>;
}

/// [`EventSource`] subscribing through a [`VaultBackend`].
pub struct BackendSource {
    backend: Arc<dyn VaultBackend>,
    session: SessionToken,
}

impl BackendSource {
    pub fn new(backend: Arc<dyn VaultBackend>, session: SessionToken) -> Self {
        Self { backend, session }
    }
}

#[async_trait]
impl EventSource for BackendSource {
    async fn connect(&self) -> Result<Subscription> {
        self.backend.subscribe(&self.session).await
    }
}

/// Stream settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    pub reconnect: ReconnectPolicy,
    /// Silence longer than this is treated as a lost connection.
    #[serde(with = "secs")]
    pub heartbeat_timeout: Duration,
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            heartbeat_timeout: Duration::from_secs(45),
        }
    }
}

enum PumpOutcome {
    Cancelled,
    Disconnected(&'static str),
}

/// Handle to a running event stream task.
pub struct EventStream {
    state: watch::Receiver<StreamState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl EventStream {
    /// Start streaming events from `source` into `handler`.
    pub fn spawn(
        source: Arc<dyn EventSource>,
        handler: Arc<dyn EventHandler>,
        config: StreamConfig,
    ) -> Self {
        let (state_tx, state) = watch::channel(StreamState::Connecting);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(source, handler, config, state_tx, cancel.clone()));
        Self {
            state,
            cancel,
            task: Some(task),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Receiver for observing state transitions.
    pub fn watch(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    /// Wait until the stream reaches a state matching `predicate`.
    pub async fn wait_for(&self, predicate: impl Fn(&StreamState) -> bool) -> StreamState {
        let mut rx = self.state.clone();
        let reached = match rx.wait_for(|s| predicate(s)).await {
            Ok(state) => *state,
            Err(_) => StreamState::Closed,
        };
        reached
    }

    /// Stop streaming. In-flight handler calls are allowed to finish.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait for the stream task to end and return how it ended.
    pub async fn join(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::Transport(format!("event stream task failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    source: Arc<dyn EventSource>,
    handler: Arc<dyn EventHandler>,
    config: StreamConfig,
    state: watch::Sender<StreamState>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut failures: u32 = 0;
    let mut connected_before = false;

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = source.connect() => result,
        };

        match connected {
            Ok(mut subscription) => {
                failures = 0;
                if connected_before {
                    handler.on_resync().await;
                }
                connected_before = true;
                state.send_replace(StreamState::Streaming);
                info!("event stream connected");

                match pump(&mut subscription, handler.as_ref(), config.heartbeat_timeout, &cancel).await {
                    PumpOutcome::Cancelled => break,
                    PumpOutcome::Disconnected(reason) => warn!(reason, "event stream disconnected"),
                }
            }
            Err(e) if !config.reconnect.should_retry(&e) => {
                warn!(error = %e, "event stream rejected; not retrying");
                state.send_replace(StreamState::Closed);
                return Err(e);
            }
            Err(e) => warn!(error = %e, attempt = failures, "event stream connect failed"),
        }

        if !config.reconnect.allows(failures) {
            state.send_replace(StreamState::Closed);
            return Err(Error::Transport(format!(
                "event stream gave up after {} reconnect attempts",
                failures
            )));
        }
        let delay = config.reconnect.delay_for_attempt(failures);
        failures += 1;
        state.send_replace(StreamState::Reconnecting { attempt: failures });
        debug!(attempt = failures, ?delay, "reconnecting");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state.send_replace(StreamState::Closed);
    info!("event stream closed");
    Ok(())
}

async fn pump(
    subscription: &mut Subscription,
    handler: &dyn EventHandler,
    heartbeat_timeout: Duration,
    cancel: &CancellationToken,
) -> PumpOutcome {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpOutcome::Cancelled,
            next = tokio::time::timeout(heartbeat_timeout, subscription.next()) => next,
        };

        match next {
            Err(_) => return PumpOutcome::Disconnected("heartbeat timeout"),
            Ok(None) => return PumpOutcome::Disconnected("stream ended"),
            Ok(Some(StreamItem::Heartbeat(_))) => {}
            Ok(Some(StreamItem::Event(event))) => {
                if let Err(e) = event.validate() {
                    warn!(error = %e, "ignoring malformed event");
                    continue;
                }
                handler.on_event(&event).await;
            }
        }
    }
}
