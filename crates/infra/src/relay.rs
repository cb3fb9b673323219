//! Event relay: the single path from the committed log to the bus.
//!
//! Commits to different aggregates finish concurrently, so publishing from
//! each command task could put global sequence 11 on the bus before 10. A
//! tailing stream session would then drop 10 as a duplicate. The relay instead
//! reads the store's global log after a cursor and publishes strictly in
//! global order.
//!
//! The orchestrator wakes the relay after every successful append
//! ([`CommitNotifier`]); the relay also polls on an interval so commits made by
//! other processes sharing the same Postgres database are distributed too.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use eventide_events::{EventBus, TopicResolver};

use crate::event_store::{EventStore, StoreError};
use crate::workers::WorkerHandle;

/// Wakes the relay after a commit. Cheap to clone; never blocks.
#[derive(Debug, Clone, Default)]
pub struct CommitNotifier(Arc<Notify>);

impl CommitNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A wake-up sent while the relay is busy is remembered, not lost.
    pub fn notify(&self) {
        self.0.notify_one();
    }

    async fn notified(&self) {
        self.0.notified().await;
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 500,
        }
    }
}

/// Publishes committed events to the bus in global-sequence order.
pub struct EventRelay<S, B> {
    store: S,
    bus: B,
    topics: Arc<dyn TopicResolver>,
    config: RelayConfig,
    position: Arc<AtomicU64>,
}

impl<S, B> EventRelay<S, B>
where
    S: EventStore + 'static,
    B: EventBus + 'static,
{
    pub fn new(store: S, bus: B, topics: Arc<dyn TopicResolver>, config: RelayConfig) -> Self {
        Self {
            store,
            bus,
            topics,
            config,
            position: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared view of the last published global sequence.
    pub fn position(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.position)
    }

    /// Publish everything committed after the current cursor.
    ///
    /// Returns the number of events published. Publish failures are logged and
    /// skipped; the store stays the source of truth for consumers that replay.
    pub async fn drain(&self) -> Result<usize, StoreError> {
        let mut published = 0;
        loop {
            let cursor = self.position.load(Ordering::Acquire);
            let batch = self
                .store
                .load_since_batch(cursor, self.config.batch_size)
                .await?;
            let exhausted = batch.len() < self.config.batch_size;

            for event in batch {
                let topic = self.topics.topic_of(&event);
                let global_sequence = event.global_sequence;
                if let Err(err) = self.bus.publish(&topic, event) {
                    warn!(
                        global_sequence,
                        topic = %topic,
                        error = %err,
                        "relay failed to publish event"
                    );
                }
                self.position.store(global_sequence, Ordering::Release);
                published += 1;
            }

            if exhausted {
                return Ok(published);
            }
        }
    }

    /// Start relaying from the current store head.
    pub async fn spawn(self, notifier: CommitNotifier) -> Result<WorkerHandle, StoreError> {
        let head = self.store.last_global_sequence().await?;
        Ok(self.spawn_from(head, notifier))
    }

    /// Start relaying everything after `after`.
    pub fn spawn_from(self, after: u64, notifier: CommitNotifier) -> WorkerHandle {
        self.position.store(after, Ordering::Release);
        info!(after, "event relay starting");

        WorkerHandle::spawn("event-relay", move |mut shutdown| async move {
            let mut poll = tokio::time::interval(self.config.poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = notifier.notified() => {}
                    _ = poll.tick() => {}
                }

                match self.drain().await {
                    Ok(0) => {}
                    Ok(published) => debug!(
                        published,
                        position = self.position.load(Ordering::Acquire),
                        "relay published events"
                    ),
                    Err(err) => warn!(error = %err, "relay failed to read the event log"),
                }
            }
            info!("event relay stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventide_core::AggregateRef;
    use eventide_events::{FixedDomain, InMemoryEventBus, NewEvent, SubscriptionPattern};

    use crate::event_store::InMemoryEventStore;

    fn relay(
        store: Arc<InMemoryEventStore>,
        bus: Arc<InMemoryEventBus>,
        batch_size: usize,
    ) -> EventRelay<Arc<InMemoryEventStore>, Arc<InMemoryEventBus>> {
        EventRelay::new(
            store,
            bus,
            Arc::new(FixedDomain::new("test")),
            RelayConfig {
                poll_interval: Duration::from_millis(20),
                batch_size,
            },
        )
    }

    async fn commit(store: &InMemoryEventStore, id: &str, version: u64) {
        let r = AggregateRef::new("counter", id).unwrap();
        store
            .append(&r, version, vec![NewEvent::new("counter.incremented", b"{}".to_vec())])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drain_publishes_in_global_order_across_pages() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let mut sub = bus.subscribe(SubscriptionPattern::all());

        for version in 0..5 {
            commit(&store, "a", version).await;
            commit(&store, "b", version).await;
        }

        let relay = relay(Arc::clone(&store), Arc::clone(&bus), 3);
        assert_eq!(relay.drain().await.unwrap(), 10);
        assert_eq!(relay.drain().await.unwrap(), 0);

        for expected in 1..=10 {
            assert_eq!(sub.recv().await.unwrap().global_sequence, expected);
        }
    }

    #[tokio::test]
    async fn spawned_relay_starts_at_head_and_follows_notifications() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        commit(&store, "old", 0).await;

        let notifier = CommitNotifier::new();
        let handle = relay(Arc::clone(&store), Arc::clone(&bus), 100)
            .spawn(notifier.clone())
            .await
            .unwrap();
        let mut sub = bus.subscribe(SubscriptionPattern::all());

        commit(&store, "new", 0).await;
        notifier.notify();

        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.global_sequence, 2);
        assert_eq!(event.aggregate_ref.aggregate_id(), "new");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn publish_failures_do_not_stall_the_cursor() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        commit(&store, "a", 0).await;
        bus.close();

        let relay = relay(Arc::clone(&store), Arc::clone(&bus), 10);
        assert_eq!(relay.drain().await.unwrap(), 1);
        assert_eq!(relay.position().load(Ordering::Acquire), 1);
    }
}
