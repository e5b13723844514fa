//! Access-filtered publish/subscribe for change events.
//!
//! Each subscriber owns a bounded channel and a cancellation token. Publishing
//! re-checks every subscriber's session and access rights against the event's
//! resource, then hands the event over with `try_send`, so a slow or stuck
//! subscriber only ever loses its own events.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::access::AccessPolicy;
use crate::session::{SessionGuard, SessionToken};
use teamvault_common::{ChangeEvent, Result, UserId};

/// Broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Interval between heartbeats on idle and busy streams alike.
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,
    /// Per-subscriber queue depth. Events beyond it are dropped for that subscriber.
    pub subscriber_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            subscriber_buffer: 64,
        }
    }
}

impl BrokerConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_subscriber_buffer(mut self, buffer: usize) -> Self {
        self.subscriber_buffer = buffer.max(1);
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// One item on a subscriber's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Event(ChangeEvent),
    Heartbeat(DateTime<Utc>),
}

struct SubscriberSlot {
    user_id: UserId,
    session: SessionToken,
    tx: mpsc::Sender<StreamItem>,
    cancel: CancellationToken,
}

/// Server-side change-event fan-out.
pub struct SyncEventBroker {
    subscribers: Mutex<HashMap<u64, SubscriberSlot>>,
    next_id: AtomicU64,
    policy: Arc<dyn AccessPolicy>,
    sessions: Arc<SessionGuard>,
    config: BrokerConfig,
}

impl SyncEventBroker {
    pub fn new(
        policy: Arc<dyn AccessPolicy>,
        sessions: Arc<SessionGuard>,
        config: BrokerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            policy,
            sessions,
            config,
        })
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<u64, SubscriberSlot>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber for the session's user.
    ///
    /// # Errors
    /// - `Authorization` if the session does not validate
    pub async fn subscribe(self: &Arc<Self>, session: &SessionToken) -> Result<Subscription> {
        let user_id = self.sessions.validate(session).await?;
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let cancel = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.registry().insert(
            id,
            SubscriberSlot {
                user_id: user_id.clone(),
                session: session.clone(),
                tx,
                cancel: cancel.clone(),
            },
        );
        debug!(subscriber = id, user = %user_id, "subscriber added");

        Ok(Subscription {
            id,
            rx,
            cancel,
            broker: Arc::downgrade(self),
        })
    }

    /// Drop a subscriber from the registry and cancel its stream.
    pub fn unsubscribe(&self, id: u64) {
        if let Some(slot) = self.registry().remove(&id) {
            slot.cancel.cancel();
            debug!(subscriber = id, user = %slot.user_id, "subscriber removed");
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    fn snapshot(&self) -> Vec<(u64, UserId, SessionToken, mpsc::Sender<StreamItem>)> {
        self.registry()
            .iter()
            .map(|(id, slot)| (*id, slot.user_id.clone(), slot.session.clone(), slot.tx.clone()))
            .collect()
    }

    /// Fan an event out to every subscriber allowed to see it.
    ///
    /// Returns the number of subscribers the event was queued for.
    ///
    /// # Errors
    /// - `InvalidInput` if the event is missing tags its kind requires
    pub async fn publish(&self, event: ChangeEvent) -> Result<usize> {
        event.validate()?;
        let resource = event.resource();

        let checks = self.snapshot().into_iter().map(|(id, user_id, session, tx)| {
            let resource = &resource;
            async move {
                if self.sessions.validate(&session).await.is_err() {
                    return (id, Delivery::SessionInvalid);
                }
                if !self.policy.can_access(&user_id, resource).await {
                    return (id, Delivery::Filtered);
                }
                (id, Delivery::Allowed(tx))
            }
        });

        let mut delivered = 0;
        for (id, outcome) in join_all(checks).await {
            match outcome {
                Delivery::Allowed(tx) => match tx.try_send(StreamItem::Event(event.clone())) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber = id, kind = ?event.kind, "subscriber queue full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => self.unsubscribe(id),
                },
                Delivery::Filtered => {}
                Delivery::SessionInvalid => {
                    info!(subscriber = id, "cancelling subscriber with invalid session");
                    self.unsubscribe(id);
                }
            }
        }
        debug!(kind = ?event.kind, delivered, "event published");
        Ok(delivered)
    }

    /// Send one heartbeat to every live subscriber.
    pub fn heartbeat(&self) {
        let now = Utc::now();
        for (id, _, _, tx) in self.snapshot() {
            if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(StreamItem::Heartbeat(now)) {
                self.unsubscribe(id);
            }
        }
    }

    /// Spawn the periodic heartbeat task. It stops when `shutdown` fires or
    /// the broker is dropped.
    pub fn spawn_heartbeat(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let broker = Arc::downgrade(self);
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match broker.upgrade() {
                            Some(broker) => broker.heartbeat(),
                            None => break,
                        }
                    }
                }
            }
            debug!("heartbeat task stopped");
        })
    }

    /// Cancel every subscriber, as on server shutdown or transport loss.
    pub fn disconnect_all(&self) {
        let slots: Vec<SubscriberSlot> = self.registry().drain().map(|(_, slot)| slot).collect();
        for slot in &slots {
            slot.cancel.cancel();
        }
        info!(count = slots.len(), "all subscribers disconnected");
    }
}

enum Delivery {
    Allowed(mpsc::Sender<StreamItem>),
    Filtered,
    SessionInvalid,
}

/// Receiving end of one subscriber. Unregisters itself on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<StreamItem>,
    cancel: CancellationToken,
    broker: Weak<SyncEventBroker>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next item, or `None` once the broker cancelled this subscriber.
    pub async fn next(&mut self) -> Option<StreamItem> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use teamvault_common::{EventKind, Resource, TeamId};

    /// Grants access to listed (user, resource) pairs only.
    struct FixedPolicy(HashSet<(UserId, Resource)>);

    #[async_trait]
    impl AccessPolicy for FixedPolicy {
        async fn can_access(&self, user_id: &UserId, resource: &Resource) -> bool {
            if let Resource::User(u) = resource {
                return u == user_id;
            }
            self.0.contains(&(user_id.clone(), resource.clone()))
        }
    }

    fn uid(name: &str) -> UserId {
        UserId::new(name).unwrap()
    }

    fn team(name: &str) -> TeamId {
        TeamId::new(name).unwrap()
    }

    fn setup(
        members: &[(&str, &str)],
        config: BrokerConfig,
    ) -> (Arc<SyncEventBroker>, Arc<SessionGuard>) {
        let allowed = members
            .iter()
            .map(|(u, t)| (uid(u), Resource::Team(team(t))))
            .collect();
        let sessions = Arc::new(SessionGuard::new(Default::default()));
        let broker = SyncEventBroker::new(Arc::new(FixedPolicy(allowed)), sessions.clone(), config);
        (broker, sessions)
    }

    fn removal(team_id: &str) -> ChangeEvent {
        ChangeEvent::new(EventKind::TeamMemberRemove, uid("admin"))
            .with_team(team(team_id))
            .with_member(uid("carol"))
    }

    #[tokio::test]
    async fn test_non_member_never_receives_team_event() {
        let (broker, sessions) = setup(&[("alice", "x")], BrokerConfig::default());
        let mut alice = broker
            .subscribe(&sessions.issue(uid("alice")).await.unwrap())
            .await
            .unwrap();
        let mut bob = broker
            .subscribe(&sessions.issue(uid("bob")).await.unwrap())
            .await
            .unwrap();

        assert_eq!(broker.publish(removal("x")).await.unwrap(), 1);
        broker.heartbeat();

        assert!(matches!(alice.next().await, Some(StreamItem::Event(e)) if e.kind == EventKind::TeamMemberRemove));
        assert!(matches!(bob.next().await, Some(StreamItem::Heartbeat(_))));
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_others() {
        let config = BrokerConfig::default().with_subscriber_buffer(1);
        let (broker, sessions) = setup(&[("alice", "x"), ("bob", "x")], config);
        let _slow = broker
            .subscribe(&sessions.issue(uid("alice")).await.unwrap())
            .await
            .unwrap();
        let mut fast = broker
            .subscribe(&sessions.issue(uid("bob")).await.unwrap())
            .await
            .unwrap();

        assert_eq!(broker.publish(removal("x")).await.unwrap(), 2);
        assert!(fast.next().await.is_some());
        // alice's queue is still full; bob still gets the second event.
        assert_eq!(broker.publish(removal("x")).await.unwrap(), 1);
        assert!(fast.next().await.is_some());
    }

    #[tokio::test]
    async fn test_revoked_session_is_cancelled() {
        let (broker, sessions) = setup(&[("alice", "x")], BrokerConfig::default());
        let token = sessions.issue(uid("alice")).await.unwrap();
        let mut sub = broker.subscribe(&token).await.unwrap();

        sessions.revoke(&token).await.unwrap();
        assert_eq!(broker.publish(removal("x")).await.unwrap(), 0);

        assert!(sub.is_cancelled());
        assert!(sub.next().await.is_none());
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_requires_valid_session() {
        let (broker, _) = setup(&[], BrokerConfig::default());
        let result = broker.subscribe(&SessionToken::from_string("x.y")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_event_rejected() {
        let (broker, _) = setup(&[], BrokerConfig::default());
        let event = ChangeEvent::new(EventKind::VaultUpdate, uid("alice"));
        assert!(broker.publish(event).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let (broker, sessions) = setup(&[], BrokerConfig::default());
        let sub = broker
            .subscribe(&sessions.issue(uid("alice")).await.unwrap())
            .await
            .unwrap();
        assert_eq!(broker.subscriber_count(), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_task_ticks() {
        let config = BrokerConfig::default().with_heartbeat_interval(Duration::from_secs(5));
        let (broker, sessions) = setup(&[], config);
        let mut sub = broker
            .subscribe(&sessions.issue(uid("alice")).await.unwrap())
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = broker.spawn_heartbeat(shutdown.clone());

        assert!(matches!(sub.next().await, Some(StreamItem::Heartbeat(_))));
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_all_cancels_streams() {
        let (broker, sessions) = setup(&[], BrokerConfig::default());
        let mut sub = broker
            .subscribe(&sessions.issue(uid("alice")).await.unwrap())
            .await
            .unwrap();
        broker.disconnect_all();
        assert!(sub.next().await.is_none());
    }
}
