//! In-process event bus.
//!
//! Publishing never blocks: every subscriber has a bounded queue and an
//! event that does not fit is dropped for that subscriber only. The most
//! recent events are kept in a ring buffer so late subscribers can catch up.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::monitoring::state::StatusChange;
use crate::orchestrator::CycleSummary;
use crate::orchestrator::registry::ReconcileSummary;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    MonitoringStarted { targets: usize, interval_secs: u64 },
    MonitoringStopped,
    TargetsReloaded(ReconcileSummary),
    StatusChanged(StatusChange),
    CycleCompleted(CycleSummary),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::MonitoringStarted { .. } => "monitoring_started",
            EventKind::MonitoringStopped => "monitoring_stopped",
            EventKind::TargetsReloaded(_) => "targets_reloaded",
            EventKind::StatusChanged(_) => "status_changed",
            EventKind::CycleCompleted(_) => "cycle_completed",
        }
    }
}

/// A published event, numbered in publish order
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriberId(Uuid);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusStats {
    pub subscribers: usize,
    pub published: u64,
    /// Deliveries dropped because a subscriber queue was full
    pub dropped: u64,
    /// Subscribers removed after a delivery or handler failure
    pub removed: u64,
    pub history: usize,
}

struct BusState {
    next_id: u64,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Event>>,
    history: VecDeque<Event>,
}

struct BusInner {
    capacity: usize,
    history_size: usize,
    state: Mutex<BusState>,
    published: AtomicU64,
    dropped: AtomicU64,
    removed: AtomicU64,
}

impl BusInner {
    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize, history_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                history_size,
                state: Mutex::new(BusState {
                    next_id: 1,
                    subscribers: HashMap::new(),
                    history: VecDeque::with_capacity(history_size),
                }),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                removed: AtomicU64::new(0),
            }),
        }
    }

    /// Deliver an event to every subscriber without waiting on any of them
    pub fn publish(&self, kind: EventKind) -> Event {
        let mut state = self.inner.state();

        let event = Event { id: state.next_id, at: Utc::now(), kind };
        state.next_id += 1;

        if self.inner.history_size > 0 {
            if state.history.len() == self.inner.history_size {
                state.history.pop_front();
            }
            state.history.push_back(event.clone());
        }

        let mut closed = Vec::new();
        for (id, sender) in &state.subscribers {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = %id, event = event.kind.name(), "Subscriber queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            state.subscribers.remove(&id);
            self.inner.removed.fetch_add(1, Ordering::Relaxed);
            debug!(subscriber = %id, "Removed closed subscriber");
        }

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        event
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_history(0)
    }

    /// Subscribe and replay up to `limit` of the most recent events first
    ///
    /// Replay and registration happen under one lock, so no event is missed
    /// or seen twice.
    pub fn subscribe_with_history(&self, limit: usize) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let id = SubscriberId(Uuid::new_v4());

        let mut state = self.inner.state();
        let skip = state.history.len().saturating_sub(limit);
        let backlog = state.history.iter().skip(skip).cloned().collect();
        state.subscribers.insert(id, sender);
        drop(state);

        debug!(subscriber = %id, "Subscriber registered");
        Subscription { id, backlog, receiver, bus: Arc::downgrade(&self.inner) }
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.state().subscribers.remove(&id).is_some()
    }

    /// Most recent events, oldest first
    pub fn history(&self, limit: usize) -> Vec<Event> {
        let state = self.inner.state();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Disconnect every subscriber; their receivers drain and then end
    pub fn close(&self) -> usize {
        let mut state = self.inner.state();
        let count = state.subscribers.len();
        state.subscribers.clear();
        count
    }

    pub fn stats(&self) -> BusStats {
        let state = self.inner.state();
        BusStats {
            subscribers: state.subscribers.len(),
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            removed: self.inner.removed.load(Ordering::Relaxed),
            history: state.history.len(),
        }
    }

    /// Drive `consumer` from its own subscription until cancelled
    ///
    /// A consumer whose handler fails is removed from the bus; the
    /// publisher and the other consumers are unaffected.
    pub fn attach(&self, consumer: Arc<dyn EventConsumer>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut subscription = self.subscribe();
        let inner = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            info!(consumer = consumer.name(), "Event consumer attached");
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => event,
                };

                let Some(event) = event else { break };

                if let Err(e) = consumer.on_event(&event).await {
                    warn!(consumer = consumer.name(), error = %e, "Event consumer failed, removing it");
                    if let Some(inner) = inner.upgrade() {
                        inner.removed.fetch_add(1, Ordering::Relaxed);
                    }
                    break;
                }
            }
            debug!(consumer = consumer.name(), "Event consumer detached");
        })
    }
}

/// Receiving end of a subscription
///
/// Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriberId,
    backlog: VecDeque<Event>,
    receiver: mpsc::Receiver<Event>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event; `None` once the bus has disconnected this subscriber
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.backlog.pop_front().or_else(|| self.receiver.try_recv().ok())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.state().subscribers.remove(&self.id);
        }
    }
}

/// Something that reacts to bus events
#[async_trait::async_trait]
pub trait EventConsumer: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Writes status changes and cycle summaries to the log
pub struct LogConsumer;

#[async_trait::async_trait]
impl EventConsumer for LogConsumer {
    fn name(&self) -> &str {
        "log"
    }

    async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        match &event.kind {
            EventKind::StatusChanged(change) => {
                info!(
                    target_key = %change.key,
                    label = %change.label,
                    old = %change.old_status,
                    new = %change.new_status,
                    "Target status changed"
                );
            }
            EventKind::CycleCompleted(summary) => {
                debug!(
                    cycle = summary.cycle,
                    online = summary.online,
                    offline = summary.offline,
                    error = summary.error,
                    "Cycle completed"
                );
            }
            other => debug!(event = other.name(), "Monitoring event"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stopped() -> EventKind {
        EventKind::MonitoringStopped
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest_for_that_subscriber_only() {
        let bus = EventBus::new(3, 10);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for _ in 0..5 {
            bus.publish(stopped());
            while fast.try_recv().is_some() {}
        }

        let received: Vec<u64> = std::iter::from_fn(|| slow.try_recv()).map(|e| e.id).collect();
        assert_eq!(received, vec![1, 2, 3]);
        assert_eq!(bus.stats().dropped, 2);
        assert_eq!(bus.stats().published, 5);
    }

    #[tokio::test]
    async fn test_history_replay_is_bounded() {
        let bus = EventBus::new(10, 3);
        for _ in 0..5 {
            bus.publish(stopped());
        }

        let mut late = bus.subscribe_with_history(10);
        bus.publish(stopped());

        let ids: Vec<u64> = std::iter::from_fn(|| late.try_recv()).map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5, 6]);
        assert_eq!(bus.history(2).iter().map(|e| e.id).collect::<Vec<_>>(), vec![5, 6]);
    }

    #[tokio::test]
    async fn test_dropped_subscription_unsubscribes() {
        let bus = EventBus::new(4, 0);
        let sub = bus.subscribe();
        assert_eq!(bus.stats().subscribers, 1);
        drop(sub);
        assert_eq!(bus.stats().subscribers, 0);
        bus.publish(stopped());
    }

    #[tokio::test]
    async fn test_close_ends_receivers() {
        let bus = EventBus::new(4, 0);
        let mut sub = bus.subscribe();
        bus.publish(stopped());
        assert_eq!(bus.close(), 1);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_event_json_shape() {
        let bus = EventBus::new(1, 1);
        let event = bus.publish(EventKind::MonitoringStarted { targets: 3, interval_secs: 30 });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["id"], 1);
        assert_eq!(json["type"], "monitoring_started");
        assert_eq!(json["data"]["targets"], 3);
    }

    struct Failing;

    #[async_trait::async_trait]
    impl EventConsumer for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("handler broke")
        }
    }

    struct Counting(AtomicU64);

    #[async_trait::async_trait]
    impl EventConsumer for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_consumer_is_removed() {
        let bus = EventBus::new(8, 0);
        let cancel = CancellationToken::new();
        let counting = Arc::new(Counting(AtomicU64::new(0)));

        let failing_task = bus.attach(Arc::new(Failing), cancel.clone());
        let counting_task = bus.attach(counting.clone(), cancel.clone());
        assert_eq!(bus.stats().subscribers, 2);

        bus.publish(stopped());
        failing_task.await.unwrap();
        bus.publish(stopped());

        tokio::time::timeout(Duration::from_secs(1), async {
            while counting.0.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let stats = bus.stats();
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.removed, 1);

        cancel.cancel();
        counting_task.await.unwrap();
        assert_eq!(bus.stats().subscribers, 0);
    }
}
