//! Keeping a client's view current from the event stream.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::stream::EventHandler;
use teamvault_common::{ChangeEvent, Result};

/// Something that can re-pull server state.
#[async_trait]
pub trait ChangeTarget: Send + Sync {
    /// React to one event. Implementations decide what to re-fetch.
    async fn apply_change(&self, event: &ChangeEvent) -> Result<()>;

    /// Re-pull everything after a gap in the event stream.
    async fn resync(&self) -> Result<()>;
}

/// [`EventHandler`] forwarding events to a [`ChangeTarget`].
///
/// Target failures are logged, never propagated, so one bad refresh does not
/// stop the stream.
pub struct RefreshOnChange<T: ChangeTarget> {
    target: Arc<T>,
    applied: AtomicU64,
    failed: AtomicU64,
}

impl<T: ChangeTarget> RefreshOnChange<T> {
    pub fn new(target: Arc<T>) -> Self {
        Self {
            target,
            applied: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Number of successful refreshes, resyncs included.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn record(&self, what: &str, result: Result<()>) {
        match result {
            Ok(()) => {
                self.applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "{} failed", what);
            }
        }
    }
}

#[async_trait]
impl<T: ChangeTarget + 'static> EventHandler for RefreshOnChange<T> {
    async fn on_event(&self, event: &ChangeEvent) {
        debug!(kind = ?event.kind, "change event");
        let result = self.target.apply_change(event).await;
        self.record("refresh", result);
    }

    async fn on_resync(&self) {
        let result = self.target.resync().await;
        self.record("resync", result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use teamvault_common::{Error, EventKind, UserId, VaultId};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<EventKind>>,
        resyncs: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl ChangeTarget for Recorder {
        async fn apply_change(&self, event: &ChangeEvent) -> Result<()> {
            self.seen.lock().unwrap().push(event.kind);
            if self.fail {
                return Err(Error::Transport("down".to_string()));
            }
            Ok(())
        }

        async fn resync(&self) -> Result<()> {
            self.resyncs.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn update() -> ChangeEvent {
        ChangeEvent::new(EventKind::VaultUpdate, UserId::new("bob").unwrap())
            .with_vault(VaultId::new("v1").unwrap())
    }

    #[tokio::test]
    async fn test_events_reach_target() {
        let target = Arc::new(Recorder::default());
        let handler = RefreshOnChange::new(target.clone());

        handler.on_event(&update()).await;
        handler.on_resync().await;

        assert_eq!(*target.seen.lock().unwrap(), vec![EventKind::VaultUpdate]);
        assert_eq!(target.resyncs.load(Ordering::Relaxed), 1);
        assert_eq!(handler.applied(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_raised() {
        let target = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let handler = RefreshOnChange::new(target);

        handler.on_event(&update()).await;
        assert_eq!(handler.failed(), 1);
        assert_eq!(handler.applied(), 0);
    }
}
