//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern** - a pub/sub mechanism for
//! distributing committed events to live consumers (streaming clients,
//! projection workers, cache invalidation).
//!
//! ## Design Philosophy
//!
//! - **No persistence**: the bus is for distribution, not storage. A new
//!   subscription only sees events published after it was created; history
//!   comes from the event store.
//! - **At-least-once per active subscription**: consumers tolerate duplicates
//!   by comparing global sequences.
//! - **Ordered per subscription**: a subscription receives matching events in
//!   publish order.
//! - **Publishers never block**: every subscription owns a bounded buffer.
//!
//! ## Slow consumers
//!
//! When a subscription's buffer is full at publish time, its whole backlog is
//! dropped and the next receive yields [`RecvError::Lagged`] with the number of
//! events the consumer will never see. Memory stays bounded by
//! `capacity * subscriptions`; the consumer is expected to resynchronize from
//! the event store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::Notify;

use crate::{Event, SubscriptionPattern, Topic};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The bus was shut down; nothing can be delivered any more.
    #[error("event bus is closed")]
    Closed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// The subscription's buffer overflowed and `skipped` events were dropped.
    #[error("subscription lagged behind; {skipped} events were skipped")]
    Lagged { skipped: u64 },

    /// The bus was shut down and the buffer is drained.
    #[error("event bus is closed")]
    Closed,
}

/// Outcome of offering one event to a subscriber's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Buffer was full; `dropped` events (backlog plus this one) were discarded.
    Overflowed { dropped: u64 },
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    buffer: VecDeque<Arc<Event>>,
    skipped: u64,
    closed: bool,
}

/// Bounded single-consumer buffer behind a [`Subscription`].
///
/// Bus implementations push into it; the owning subscription drains it.
#[derive(Debug)]
pub struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl SubscriberQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // Critical sections never panic, so a poisoned lock still holds consistent state.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, event: Arc<Event>) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.buffer.len() >= self.capacity {
                let dropped = state.buffer.len() as u64 + 1;
                state.buffer.clear();
                state.skipped += dropped;
                PushOutcome::Overflowed { dropped }
            } else {
                state.buffer.push_back(event);
                PushOutcome::Queued
            }
        };
        self.notify.notify_one();
        outcome
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_pop(&self) -> Result<Option<Arc<Event>>, RecvError> {
        let mut state = self.lock();
        if state.skipped > 0 {
            let skipped = std::mem::take(&mut state.skipped);
            return Err(RecvError::Lagged { skipped });
        }
        if let Some(event) = state.buffer.pop_front() {
            return Ok(Some(event));
        }
        if state.closed {
            return Err(RecvError::Closed);
        }
        Ok(None)
    }

    async fn pop(&self) -> Result<Arc<Event>, RecvError> {
        loop {
            if let Some(event) = self.try_pop()? {
                return Ok(event);
            }
            // `notify_one` stores a permit when nobody is waiting, so a push
            // between `try_pop` and here is not lost.
            self.notify.notified().await;
        }
    }

    fn pending_lag(&self) -> Option<u64> {
        let state = self.lock();
        (state.skipped > 0).then_some(state.skipped)
    }
}

/// A live subscription to a bus.
///
/// Dropping the subscription deregisters it from the bus and frees its buffer.
pub struct Subscription {
    id: u64,
    pattern: SubscriptionPattern,
    queue: Arc<SubscriberQueue>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// `detach` runs exactly once, when the subscription is dropped.
    pub fn new(
        id: u64,
        pattern: SubscriptionPattern,
        queue: Arc<SubscriberQueue>,
        detach: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            id,
            pattern,
            queue,
            detach: Some(Box::new(detach)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pattern(&self) -> &SubscriptionPattern {
        &self.pattern
    }

    /// Wait for the next matching event.
    ///
    /// Cancel-safe: dropping the returned future never loses an event.
    pub async fn recv(&mut self) -> Result<Arc<Event>, RecvError> {
        self.queue.pop().await
    }

    /// Receive without waiting; `Ok(None)` when the buffer is empty.
    pub fn try_recv(&mut self) -> Result<Option<Arc<Event>>, RecvError> {
        self.queue.try_pop()
    }

    /// Number of skipped events waiting to be reported, if the buffer overflowed.
    pub fn pending_lag(&self) -> Option<u64> {
        self.queue.pending_lag()
    }

    pub fn buffered(&self) -> usize {
        self.queue.len()
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern.as_str())
            .field("buffered", &self.queue.len())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ```text
/// Command → Event Store (append) → Relay (global order) → Event Bus → Subscriptions
///                                                                      ├─ stream sessions
///                                                                      ├─ projection workers
///                                                                      └─ cache invalidation
/// ```
///
/// Events are **stored first**, then **published**. If publication fails the
/// events are still in the store and consumers recover them by replay.
///
/// The trait requires `Send + Sync`; many tasks publish and subscribe
/// concurrently.
pub trait EventBus: Send + Sync {
    /// Deliver `event` to every subscription whose pattern matches `topic`.
    ///
    /// Never blocks on slow subscribers.
    fn publish(&self, topic: &Topic, event: Arc<Event>) -> Result<(), PublishError>;

    /// Register a subscription. Only events published afterwards are delivered.
    fn subscribe(&self, pattern: SubscriptionPattern) -> Subscription;
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    fn publish(&self, topic: &Topic, event: Arc<Event>) -> Result<(), PublishError> {
        (**self).publish(topic, event)
    }

    fn subscribe(&self, pattern: SubscriptionPattern) -> Subscription {
        (**self).subscribe(pattern)
    }
}
